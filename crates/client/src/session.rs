//! Chat sessions
//!
//! A session record lives at an address derived from the configured seed
//! and the owner's address, so any client holding the owner's key finds the
//! same session without bookkeeping. Turns are written against it and the
//! answer is recovered from the turn's program logs.

use crate::context::LedgerContext;
use crate::ledger::{await_account, poll_budget};
use crate::response::ResponseExtractor;
use crate::submitter::TransactionSubmitter;
use tracing::{debug, info, warn};
use weightlink_common::{Result, WeightLinkError, METRICS};
use weightlink_protocol::{Address, ChatState, Signature};

/// Result of one confirmed chat turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub signature: Signature,
    /// `None` when the logs carried no recognisable response
    pub response: Option<String>,
}

/// Longest prefix of `text` within `max_bytes` that ends on a char boundary
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub struct SessionController {
    ctx: LedgerContext,
    submitter: TransactionSubmitter,
    extractor: ResponseExtractor,
}

impl SessionController {
    pub fn new(ctx: LedgerContext) -> Self {
        let submitter = ctx.submitter();
        let extractor = ResponseExtractor::new(ctx.config().session.response_marker.clone());
        Self {
            ctx,
            submitter,
            extractor,
        }
    }

    /// Session address of `owner`
    pub fn session_address(&self, owner: &Address) -> Result<Address> {
        let seed = &self.ctx.config().session.seed;
        Ok(self.ctx.program().deriver().session(seed, owner)?.address)
    }

    /// Find or create the payer's session, bound to `registry` on creation
    pub async fn ensure_session(&self, registry: &Address) -> Result<Address> {
        let payer = self.ctx.payer();
        let owner = payer.pubkey();
        let session = self.session_address(&owner)?;

        if let Some(account) = self.ctx.ledger().get_account(&session).await? {
            match ChatState::decode(&account.data) {
                Ok(state) if state.model != *registry => {
                    warn!(%session, bound = %state.model, requested = %registry, "Reusing session bound to a different model");
                }
                Ok(_) => {}
                Err(e) => warn!(%session, error = %e, "Session address holds an unexpected record"),
            }
            info!(%session, "Reusing existing session");
            return Ok(session);
        }

        let instruction = self
            .ctx
            .program()
            .initialize_chat(&owner, &session, registry);
        let signature = match self
            .submitter
            .submit("initialize_chat", &[instruction], payer, &[])
            .await
        {
            Ok(receipt) => Some(receipt.signature),
            // A create whose confirmation was lost can still have landed.
            Err(err) if self.owns_session(&session, &owner).await => {
                warn!(%session, error = %err, "Submission failed but session exists, treating as created");
                None
            }
            Err(err) => return Err(err),
        };

        let config = &self.ctx.config().session;
        await_account(self.ctx.ledger(), &session, config.visibility_timeout(), config.poll_interval()).await?;

        METRICS.session.sessions_created_total.inc();
        info!(%session, %registry, ?signature, "Session created");
        Ok(session)
    }

    /// Whether `session` holds a chat record owned by `owner`
    async fn owns_session(&self, session: &Address, owner: &Address) -> bool {
        match self.ctx.ledger().get_account(session).await {
            Ok(Some(account)) => ChatState::decode(&account.data)
                .map(|state| state.authority == *owner)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                debug!(%session, error = %e, "Session lookup failed");
                false
            }
        }
    }

    /// Send one turn and recover its response
    ///
    /// Input is cut to the configured byte bound on a character boundary.
    /// A confirmed turn without a discoverable response is not an error.
    pub async fn send_turn(&self, session: &Address, text: &str) -> Result<TurnOutcome> {
        let max_bytes = self.ctx.config().session.max_input_bytes;
        let input = truncate_utf8(text, max_bytes);
        if input.trim().is_empty() {
            return Err(WeightLinkError::invalid_input("chat input is empty"));
        }
        if input.len() < text.len() {
            warn!(original = text.len(), kept = input.len(), "Chat input truncated");
        }

        let account = self
            .ctx
            .ledger()
            .get_account(session)
            .await?
            .ok_or_else(|| WeightLinkError::invalid_input(format!("no session at {}", session)))?;
        let state = ChatState::decode(&account.data)?;

        let payer = self.ctx.payer();
        let instruction = self
            .ctx
            .program()
            .chat(&payer.pubkey(), session, &state.model, input.as_bytes())?;
        let receipt = self
            .submitter
            .submit("chat", &[instruction], payer, &[])
            .await?;
        METRICS.session.turns_total.inc();

        let logs = self.fetch_logs(&receipt.signature).await?;
        let response = self.extractor.extract(&logs);
        if response.is_none() {
            METRICS.session.turns_without_response_total.inc();
            warn!(signature = %receipt.signature, lines = logs.len(), "No response in turn logs");
        }

        Ok(TurnOutcome {
            signature: receipt.signature,
            response,
        })
    }

    /// Logs of a confirmed transaction; empty if they never become available
    async fn fetch_logs(&self, signature: &Signature) -> Result<Vec<String>> {
        let config = &self.ctx.config().session;
        let polls = poll_budget(config.visibility_timeout(), config.poll_interval());
        for poll in 1..=polls {
            match self.ctx.ledger().transaction_logs(signature).await {
                Ok(Some(logs)) => return Ok(logs),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    debug!(%signature, poll, error = %e, "Log fetch failed");
                }
                Err(e) => return Err(e),
            }
            if poll < polls {
                tokio::time::sleep(config.poll_interval()).await;
            }
        }
        warn!(%signature, "Transaction logs not available");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_utf8("Hello, LLM!", 64), "Hello, LLM!");
        assert_eq!(truncate_utf8("abcdef", 4), "abcd");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        // "é" is two bytes; cutting at 3 would split the second one
        assert_eq!(truncate_utf8("aéé", 4), "aé");
        assert_eq!(truncate_utf8("aéé", 5), "aéé");
        assert_eq!(truncate_utf8("\u{1f44b}", 3), "");
    }
}
