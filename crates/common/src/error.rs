//! Common error types for WeightLink
//!
//! This module defines all error types used across the WeightLink system.
//! Every error carries a retry classification so the submission path can
//! tell a transient ledger hiccup from a write that will never succeed.

use thiserror::Error;

/// JSON-RPC error codes returned by ledger nodes that are worth retrying.
const RPC_NODE_UNHEALTHY: i64 = -32005;
const RPC_BLOCK_NOT_AVAILABLE: i64 = -32004;
const RPC_SLOT_SKIPPED: i64 = -32007;
const RPC_PREFLIGHT_FAILURE: i64 = -32002;

/// Preflight failure messages that clear up once the write is rebuilt.
const TRANSIENT_PREFLIGHT_MARKERS: &[&str] = &[
    "Blockhash not found",
    "blockhash not found",
    "exceeded CUs meter",
    "Computational budget exceeded",
    "block height exceeded",
];

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rebuilding and resubmitting the operation may succeed
    Transient,

    /// The operation will fail the same way every time
    Terminal,
}

/// Main error type for WeightLink
#[derive(Error, Debug)]
pub enum WeightLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// The ledger node is throttling us
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// JSON-RPC error object returned by the ledger node
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        logs: Vec<String>,
    },

    /// A transaction was confirmed but the ledger program rejected it
    #[error("Transaction {signature} failed: {reason}")]
    TransactionFailed {
        signature: String,
        reason: String,
        logs: Vec<String>,
    },

    /// Retry budget spent on transient failures
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<WeightLinkError>,
    },

    /// Wire format violations (bad record layout, seed too long, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Key material errors
    #[error("Keypair error: {0}")]
    Keypair(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WeightLinkError {
    /// Classify this error for the retry policy
    pub fn classify(&self) -> ErrorClass {
        match self {
            WeightLinkError::Connection(_)
            | WeightLinkError::RateLimited(_)
            | WeightLinkError::Timeout(_) => ErrorClass::Transient,
            WeightLinkError::Http(err) => {
                if err.is_connect() || err.is_timeout() || err.is_request() {
                    ErrorClass::Transient
                } else {
                    match err.status() {
                        Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                            ErrorClass::Transient
                        }
                        _ => ErrorClass::Terminal,
                    }
                }
            }
            WeightLinkError::Rpc { code, message, .. } => match *code {
                RPC_NODE_UNHEALTHY | RPC_BLOCK_NOT_AVAILABLE | RPC_SLOT_SKIPPED => {
                    ErrorClass::Transient
                }
                RPC_PREFLIGHT_FAILURE => {
                    if TRANSIENT_PREFLIGHT_MARKERS
                        .iter()
                        .any(|marker| message.contains(marker))
                    {
                        ErrorClass::Transient
                    } else {
                        ErrorClass::Terminal
                    }
                }
                // -32603 and friends are node-internal failures
                code if (-32699..=-32600).contains(&code) && code != -32602 => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Terminal,
            },
            _ => ErrorClass::Terminal,
        }
    }

    /// Whether this error is worth retrying
    pub fn is_transient(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Program logs attached to this error, if the ledger returned any
    pub fn logs(&self) -> &[String] {
        match self {
            WeightLinkError::Rpc { logs, .. } | WeightLinkError::TransactionFailed { logs, .. } => {
                logs
            }
            WeightLinkError::RetriesExhausted { last, .. } => last.logs(),
            _ => &[],
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        WeightLinkError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        WeightLinkError::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        WeightLinkError::Protocol(msg.into())
    }

    /// Create a keypair error
    pub fn keypair(msg: impl Into<String>) -> Self {
        WeightLinkError::Keypair(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        WeightLinkError::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        WeightLinkError::Timeout(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        WeightLinkError::Parse(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        WeightLinkError::Internal(msg.into())
    }
}

/// Result type alias for WeightLink operations
pub type Result<T> = std::result::Result<T, WeightLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64, message: &str) -> WeightLinkError {
        WeightLinkError::Rpc {
            code,
            message: message.to_string(),
            logs: vec![],
        }
    }

    #[test]
    fn test_network_errors_are_transient() {
        assert!(WeightLinkError::connection("refused").is_transient());
        assert!(WeightLinkError::RateLimited("429".into()).is_transient());
        assert!(WeightLinkError::timeout("confirmation").is_transient());
        assert!(rpc(RPC_NODE_UNHEALTHY, "Node is behind").is_transient());
    }

    #[test]
    fn test_preflight_classification() {
        assert!(rpc(
            RPC_PREFLIGHT_FAILURE,
            "Transaction simulation failed: Blockhash not found"
        )
        .is_transient());

        assert_eq!(
            rpc(
                RPC_PREFLIGHT_FAILURE,
                "Transaction simulation failed: Error processing Instruction 0: custom program error: 0x1770"
            )
            .classify(),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_invalid_input_is_terminal() {
        assert_eq!(
            WeightLinkError::invalid_input("chunk too large").classify(),
            ErrorClass::Terminal
        );
        assert_eq!(rpc(-32602, "Invalid params").classify(), ErrorClass::Terminal);
    }

    #[test]
    fn test_logs_survive_exhaustion() {
        let err = WeightLinkError::RetriesExhausted {
            attempts: 3,
            last: Box::new(WeightLinkError::Rpc {
                code: RPC_NODE_UNHEALTHY,
                message: "behind".into(),
                logs: vec!["Program log: hi".into()],
            }),
        };
        assert_eq!(err.logs(), ["Program log: hi".to_string()]);
        assert_eq!(err.classify(), ErrorClass::Terminal);
    }
}
