//! Configuration structures for WeightLink
//!
//! This module defines all configuration types used by the upload and chat paths.
//! Configurations are loaded from YAML files and can be overridden by environment
//! variables of the form `WEIGHTLINK__SECTION__KEY` (e.g. `WEIGHTLINK__LEDGER__ENDPOINT`).

use crate::error::{Result, WeightLinkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest chunk payload the ledger program accepts (elements)
pub const MAX_CHUNK_LEN: usize = 128;

/// Largest chat input the ledger program accepts (bytes)
pub const MAX_SEQ_LEN: usize = 128;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "WEIGHTLINK";

/// Top-level configuration for WeightLink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightLinkConfig {
    /// Ledger connection settings
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Retry policy for write submission
    #[serde(default)]
    pub retry: RetryConfig,

    /// Confirmation polling
    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    /// Artifact upload settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Chat session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Ledger connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the ledger node
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Address of the receiving ledger program (base58)
    #[serde(default = "default_program_id")]
    pub program_id: String,

    /// Path to the signing keypair (JSON array of 64 bytes)
    #[serde(default = "default_keypair_path")]
    pub keypair_path: PathBuf,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Commitment level used for reads and confirmation
    #[serde(default)]
    pub commitment: Commitment,
}

/// Ledger commitment level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    /// Voted on by a supermajority
    #[default]
    Confirmed,

    /// Rooted; cannot be rolled back
    Finalized,
}

impl Commitment {
    /// Wire name of the commitment level
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum submission attempts per logical write
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Growth factor applied after every failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Confirmation polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// How long to wait for a sent write to be confirmed
    #[serde(default = "default_confirmation_timeout")]
    pub timeout_ms: u64,

    /// Delay between status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Fixed-width encoding of the section files
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementFormat {
    /// Signed 16-bit little-endian
    #[default]
    I16,

    /// Unsigned 16-bit little-endian
    U16,

    /// Signed 32-bit little-endian
    I32,
}

impl ElementFormat {
    /// Width of one element in bytes
    pub fn width(&self) -> usize {
        match self {
            ElementFormat::I16 | ElementFormat::U16 => 2,
            ElementFormat::I32 => 4,
        }
    }
}

/// Artifact upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Elements per chunk record
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,

    /// Element encoding of `chunk_<type>.bin`
    #[serde(default)]
    pub element_format: ElementFormat,

    /// Progress journal location (defaults to `<artifact-dir>/upload_journal.jsonl`)
    #[serde(default)]
    pub journal_path: Option<PathBuf>,

    /// Compute unit limit requested for registry creation
    #[serde(default = "default_compute_unit_limit")]
    pub compute_unit_limit: u32,

    /// How long to wait for a new registry to become readable
    #[serde(default = "default_visibility_timeout")]
    pub registry_visibility_timeout_ms: u64,
}

/// Chat session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seed the session address is derived from
    #[serde(default = "default_session_seed")]
    pub seed: String,

    /// Maximum bytes of user text per turn
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,

    /// Log line prefix carrying the response
    #[serde(default = "default_response_marker")]
    pub response_marker: String,

    /// How long to wait for a new session to become readable
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,

    /// Delay between visibility polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write Prometheus text metrics here on exit
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

/// Default value functions
fn default_endpoint() -> String {
    "http://127.0.0.1:8899".to_string()
}

fn default_program_id() -> String {
    "CG3rq4URcAwEUNnfGZ3YHRKTZAZgyemttN1BQwypa8qj".to_string()
}

fn default_keypair_path() -> PathBuf {
    PathBuf::from("~/.config/solana/id.json")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_confirmation_timeout() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_chunk_capacity() -> usize {
    MAX_CHUNK_LEN
}

fn default_compute_unit_limit() -> u32 {
    1_400_000
}

fn default_visibility_timeout() -> u64 {
    20_000
}

fn default_session_seed() -> String {
    "chat".to_string()
}

fn default_max_input_bytes() -> usize {
    64
}

fn default_response_marker() -> String {
    "LLM RESPONSE:".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            program_id: default_program_id(),
            keypair_path: default_keypair_path(),
            request_timeout_secs: default_request_timeout(),
            commitment: Commitment::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: default_chunk_capacity(),
            element_format: ElementFormat::default(),
            journal_path: None,
            compute_unit_limit: default_compute_unit_limit(),
            registry_visibility_timeout_ms: default_visibility_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed: default_session_seed(),
            max_input_bytes: default_max_input_bytes(),
            response_marker: default_response_marker(),
            visibility_timeout_ms: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl LedgerConfig {
    /// HTTP request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl UploadConfig {
    pub fn registry_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_visibility_timeout_ms)
    }
}

impl SessionConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_path: None,
        }
    }
}

impl WeightLinkConfig {
    /// Load configuration from a YAML file layered with environment overrides
    ///
    /// A missing file is not an error; defaults plus environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                WeightLinkError::Config(format!("Failed to read config {}: {}", path.display(), e))
            })?;

        let config: WeightLinkConfig = settings.try_deserialize().map_err(|e| {
            WeightLinkError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no environment layering)
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: WeightLinkConfig = serde_yaml::from_str(content)
            .map_err(|e| WeightLinkError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ledger.endpoint.trim().is_empty() {
            return Err(WeightLinkError::config("ledger.endpoint must not be empty"));
        }
        if self.ledger.program_id.trim().is_empty() {
            return Err(WeightLinkError::config("ledger.program_id must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(WeightLinkError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(WeightLinkError::config(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.confirmation.poll_interval_ms == 0 || self.session.poll_interval_ms == 0 {
            return Err(WeightLinkError::config("poll intervals must be non-zero"));
        }
        if self.upload.chunk_capacity == 0 || self.upload.chunk_capacity > MAX_CHUNK_LEN {
            return Err(WeightLinkError::config(format!(
                "upload.chunk_capacity must be in 1..={}, got {}",
                MAX_CHUNK_LEN, self.upload.chunk_capacity
            )));
        }
        if self.session.max_input_bytes == 0 || self.session.max_input_bytes > MAX_SEQ_LEN {
            return Err(WeightLinkError::config(format!(
                "session.max_input_bytes must be in 1..={}, got {}",
                MAX_SEQ_LEN, self.session.max_input_bytes
            )));
        }
        if self.session.seed.is_empty() || self.session.seed.len() > 32 {
            return Err(WeightLinkError::config("session.seed must be 1..=32 bytes"));
        }
        if self.session.response_marker.is_empty() {
            return Err(WeightLinkError::config("session.response_marker must not be empty"));
        }
        Ok(())
    }

    /// Keypair path with a leading `~` expanded against `$HOME`
    pub fn keypair_path(&self) -> PathBuf {
        expand_home(&self.ledger.keypair_path)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
