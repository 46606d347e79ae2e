//! Ledger port
//!
//! Everything the upload and chat paths need from a ledger node, behind
//! one async trait so the JSON-RPC adapter and the in-process simulated
//! ledger are interchangeable.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use weightlink_common::{Result, WeightLinkError};
use weightlink_protocol::{Address, Hash, Signature};

/// Raw state of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountData {
    pub owner: Address,
    pub lamports: u64,
    pub data: Vec<u8>,
}

/// What the ledger knows about a sent transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Seen, not yet at the requested commitment
    Processed,

    /// Reached the requested commitment
    Confirmed,

    /// Landed but the program rejected it
    Failed { reason: String },
}

/// Operations a ledger node provides
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fresh block hash to build a transaction against
    async fn latest_blockhash(&self) -> Result<Hash>;

    /// Send a serialized, signed transaction; returns its id
    async fn send_transaction(&self, wire: &[u8]) -> Result<Signature>;

    /// `None` while the ledger has not seen the signature
    async fn signature_status(&self, signature: &Signature) -> Result<Option<SignatureStatus>>;

    /// Program log lines of a landed transaction, `None` if not yet available
    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>>;

    /// Current state of a record, `None` if it does not exist
    async fn get_account(&self, address: &Address) -> Result<Option<AccountData>>;
}

/// Number of polls that fit in `timeout`, at least one
pub(crate) fn poll_budget(timeout: Duration, interval: Duration) -> u32 {
    let interval = interval.as_millis().max(1);
    ((timeout.as_millis() / interval) as u32).max(1)
}

/// Poll until the record at `address` is readable
///
/// Transient read errors count as a failed poll; anything else propagates.
pub async fn await_account(
    ledger: &dyn LedgerClient,
    address: &Address,
    timeout: Duration,
    interval: Duration,
) -> Result<AccountData> {
    let polls = poll_budget(timeout, interval);
    for poll in 1..=polls {
        match ledger.get_account(address).await {
            Ok(Some(account)) => {
                debug!(%address, poll, "Record visible");
                return Ok(account);
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                warn!(%address, poll, error = %e, "Visibility poll failed");
            }
            Err(e) => return Err(e),
        }
        if poll < polls {
            tokio::time::sleep(interval).await;
        }
    }
    Err(WeightLinkError::timeout(format!(
        "record {} not visible after {:?}",
        address, timeout
    )))
}
