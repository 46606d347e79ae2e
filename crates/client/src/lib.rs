//! WeightLink client
//!
//! Uploads quantized model artifacts into a ledger program as bounded chunk
//! records and runs chat sessions against the uploaded model.

pub mod artifact;
pub mod context;
pub mod journal;
pub mod ledger;
pub mod response;
pub mod rpc;
pub mod session;
pub mod simulated;
pub mod submitter;
pub mod upload;

pub use artifact::Artifact;
pub use context::LedgerContext;
pub use journal::UploadJournal;
pub use ledger::{AccountData, LedgerClient, SignatureStatus};
pub use response::ResponseExtractor;
pub use rpc::RpcLedgerClient;
pub use session::{SessionController, TurnOutcome};
pub use simulated::SimulatedLedger;
pub use submitter::{Receipt, RetryPolicy, SubmissionState, TransactionSubmitter};
pub use upload::{SectionSummary, SkipReason, UploadCoordinator, UploadSummary};
