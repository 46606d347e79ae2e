//! Write submission
//!
//! One logical write goes through `Building → Signed → Sent → Confirmed`.
//! A transient failure at any step sends it back to `Building` with a fresh
//! block hash after a backoff delay; a terminal failure, or running out of
//! attempts, ends it with an error. Before rebuilding, the signature of the
//! previous attempt is checked once more so a write that landed after its
//! confirmation window is not sent twice.

use crate::ledger::{poll_budget, LedgerClient, SignatureStatus};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use weightlink_common::config::{ConfirmationConfig, RetryConfig};
use weightlink_common::{ErrorClass, Result, WeightLinkError, METRICS};
use weightlink_protocol::{Instruction, Keypair, Signature, Transaction};

/// Decides whether an error is worth another attempt
pub type ErrorClassifier = fn(&WeightLinkError) -> ErrorClass;

/// Attempt budget, backoff schedule and error classification
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub classifier: ErrorClassifier,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            classifier: WeightLinkError::classify,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }

    pub fn classify(&self, err: &WeightLinkError) -> ErrorClass {
        (self.classifier)(err)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Lifecycle of one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Building,
    Signed,
    Sent,
    Confirmed,
    Failed,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionState::Building => "building",
            SubmissionState::Signed => "signed",
            SubmissionState::Sent => "sent",
            SubmissionState::Confirmed => "confirmed",
            SubmissionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Proof that a write reached confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub signature: Signature,
    /// Attempts spent, including the one that landed
    pub attempts: u32,
}

/// A failed attempt, with its signature once the transaction was signed
struct AttemptError {
    signature: Option<Signature>,
    error: WeightLinkError,
}

impl AttemptError {
    fn unsigned(error: WeightLinkError) -> Self {
        Self {
            signature: None,
            error,
        }
    }
}

/// Submits writes one at a time and waits for each to confirm
#[derive(Clone)]
pub struct TransactionSubmitter {
    ledger: Arc<dyn LedgerClient>,
    policy: RetryPolicy,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl TransactionSubmitter {
    pub fn new(ledger: Arc<dyn LedgerClient>, policy: RetryPolicy, confirmation: &ConfirmationConfig) -> Self {
        Self {
            ledger,
            policy,
            confirm_timeout: confirmation.timeout(),
            poll_interval: confirmation.poll_interval(),
        }
    }

    /// Submit `instructions` paid by `payer` and signed by `signers`
    ///
    /// The signer set stays fixed across attempts, so a write that creates
    /// a record at a signer's address targets the same address every time.
    pub async fn submit(
        &self,
        label: &str,
        instructions: &[Instruction],
        payer: &Keypair,
        signers: &[&Keypair],
    ) -> Result<Receipt> {
        let mut previous: Option<Signature> = None;

        for attempt in 1..=self.policy.max_attempts {
            if let Some(signature) = previous.take() {
                if self.landed_late(&signature).await {
                    METRICS.submission.late_confirmations_total.inc();
                    METRICS.submission.confirmed_total.inc();
                    info!(label, %signature, attempt, "Previous attempt confirmed late");
                    return Ok(Receipt {
                        signature,
                        attempts: attempt - 1,
                    });
                }
            }

            let AttemptError { signature, error: err } =
                match self.attempt(label, attempt, instructions, payer, signers).await {
                    Ok(signature) => {
                        METRICS.submission.confirmed_total.inc();
                        return Ok(Receipt {
                            signature,
                            attempts: attempt,
                        });
                    }
                    Err(failure) => failure,
                };

            let logs = err.logs();
            if !logs.is_empty() {
                debug!(label, attempt, logs = ?logs, "Program logs of failed attempt");
            }

            if self.policy.classify(&err) == ErrorClass::Terminal {
                METRICS.submission.failed_total.inc();
                error!(label, attempt, error = %err, state = %SubmissionState::Failed, "Write rejected");
                return Err(err);
            }
            if attempt == self.policy.max_attempts {
                METRICS.submission.failed_total.inc();
                error!(label, attempts = attempt, error = %err, "Write abandoned after all attempts");
                return Err(WeightLinkError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                label,
                attempt,
                max_attempts = self.policy.max_attempts,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "Write attempt failed, retrying"
            );
            METRICS.submission.retries_total.inc();
            previous = signature;
            tokio::time::sleep(backoff).await;
        }

        // max_attempts >= 1, so the loop always returns
        Err(WeightLinkError::internal("retry loop ended without a result"))
    }

    /// One pass through the state machine
    async fn attempt(
        &self,
        label: &str,
        attempt: u32,
        instructions: &[Instruction],
        payer: &Keypair,
        signers: &[&Keypair],
    ) -> std::result::Result<Signature, AttemptError> {
        debug!(label, attempt, state = %SubmissionState::Building);
        let blockhash = self.ledger.latest_blockhash().await.map_err(AttemptError::unsigned)?;
        let tx = Transaction::sign(instructions, payer, signers, blockhash).map_err(AttemptError::unsigned)?;
        let signature = *tx
            .signature()
            .ok_or_else(|| AttemptError::unsigned(WeightLinkError::internal("transaction has no signatures")))?;
        let wire = tx.to_wire().map_err(AttemptError::unsigned)?;
        debug!(label, attempt, %signature, bytes = wire.len(), state = %SubmissionState::Signed);

        let failed = |error| AttemptError {
            signature: Some(signature),
            error,
        };
        let sent_at = Instant::now();
        self.ledger.send_transaction(&wire).await.map_err(failed)?;
        METRICS.submission.sent_total.inc();
        debug!(label, attempt, %signature, state = %SubmissionState::Sent);

        self.confirm(&signature).await.map_err(failed)?;
        METRICS
            .submission
            .confirmation_duration
            .observe(sent_at.elapsed().as_secs_f64());
        info!(label, attempt, %signature, state = %SubmissionState::Confirmed, "Write confirmed");
        Ok(signature)
    }

    /// Poll the signature status a bounded number of times
    async fn confirm(&self, signature: &Signature) -> Result<()> {
        let polls = poll_budget(self.confirm_timeout, self.poll_interval);
        for poll in 1..=polls {
            match self.ledger.signature_status(signature).await {
                Ok(Some(SignatureStatus::Confirmed)) => return Ok(()),
                Ok(Some(SignatureStatus::Failed { reason })) => {
                    let logs = self
                        .ledger
                        .transaction_logs(signature)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    return Err(WeightLinkError::TransactionFailed {
                        signature: signature.to_string(),
                        reason,
                        logs,
                    });
                }
                Ok(Some(SignatureStatus::Processed)) | Ok(None) => {}
                Err(e) if e.is_transient() => {
                    debug!(%signature, poll, error = %e, "Status poll failed");
                }
                Err(e) => return Err(e),
            }
            if poll < polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(WeightLinkError::timeout(format!(
            "{} not confirmed within {:?}",
            signature, self.confirm_timeout
        )))
    }

    async fn landed_late(&self, signature: &Signature) -> bool {
        matches!(
            self.ledger.signature_status(signature).await,
            Ok(Some(SignatureStatus::Confirmed))
        )
    }
}
