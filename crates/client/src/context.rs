//! Shared handles threaded through the upload and chat paths

use crate::ledger::LedgerClient;
use crate::submitter::{RetryPolicy, TransactionSubmitter};
use std::sync::Arc;
use weightlink_common::{Result, WeightLinkConfig, WeightLinkError};
use weightlink_protocol::{Address, Keypair, ProgramInstructions};

/// Ledger connection, signing identity, target program and settings
///
/// Built once at startup and handed to every component; cloning is cheap.
#[derive(Clone)]
pub struct LedgerContext {
    ledger: Arc<dyn LedgerClient>,
    payer: Arc<Keypair>,
    program: ProgramInstructions,
    config: Arc<WeightLinkConfig>,
}

impl LedgerContext {
    pub fn new(ledger: Arc<dyn LedgerClient>, payer: Keypair, config: WeightLinkConfig) -> Result<Self> {
        let program_id: Address = config.ledger.program_id.parse().map_err(|e| {
            WeightLinkError::config(format!("ledger.program_id: {}", e))
        })?;

        Ok(Self {
            ledger,
            payer: Arc::new(payer),
            program: ProgramInstructions::new(program_id),
            config: Arc::new(config),
        })
    }

    pub fn ledger(&self) -> &dyn LedgerClient {
        self.ledger.as_ref()
    }

    /// Fee payer and authority of every record this client creates
    pub fn payer(&self) -> &Keypair {
        &self.payer
    }

    pub fn program(&self) -> &ProgramInstructions {
        &self.program
    }

    pub fn config(&self) -> &WeightLinkConfig {
        &self.config
    }

    /// A submitter using the configured retry and confirmation settings
    pub fn submitter(&self) -> TransactionSubmitter {
        TransactionSubmitter::new(
            self.ledger.clone(),
            RetryPolicy::from_config(&self.config.retry),
            &self.config.confirmation,
        )
    }
}
