//! Upload and chat flows against the in-process ledger

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use weightlink_client::{
    AccountData, Artifact, LedgerClient, LedgerContext, SessionController, SignatureStatus, SimulatedLedger,
    SkipReason, UploadCoordinator, UploadJournal,
};
use weightlink_common::{Result, WeightLinkConfig, WeightLinkError};
use weightlink_protocol::{Address, Hash, Keypair, ModelChunk, ModelRegistry, ModelShape, SectionType, Signature};

fn config() -> WeightLinkConfig {
    let mut config = WeightLinkConfig::default();
    config.retry.max_attempts = 4;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.confirmation.timeout_ms = 5;
    config.confirmation.poll_interval_ms = 1;
    config.upload.registry_visibility_timeout_ms = 5;
    config.session.visibility_timeout_ms = 5;
    config.session.poll_interval_ms = 1;
    config
}

fn program_id() -> Address {
    config().ledger.program_id.parse().unwrap()
}

fn shape() -> ModelShape {
    ModelShape {
        vocab_size: 256,
        embedding_dim: 16,
        hidden_dim: 16,
        context_length: 128,
        layer_count: 1,
    }
}

fn embedding(len: i32) -> Vec<i32> {
    (0..len).map(|v| v - 150).collect()
}

/// Forwards to a simulated ledger while counting sends and injecting faults
struct Tracked {
    inner: Arc<SimulatedLedger>,
    sends: AtomicU32,
    /// Sends numbered at or above this are refused outright
    refuse_from: AtomicU32,
    /// Sends that are applied but whose acknowledgement is lost
    drop_acks: AtomicU32,
}

impl Tracked {
    fn new(inner: Arc<SimulatedLedger>) -> Self {
        Self {
            inner,
            sends: AtomicU32::new(0),
            refuse_from: AtomicU32::new(u32::MAX),
            drop_acks: AtomicU32::new(0),
        }
    }

    fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for Tracked {
    async fn latest_blockhash(&self) -> Result<Hash> {
        self.inner.latest_blockhash().await
    }

    async fn send_transaction(&self, wire: &[u8]) -> Result<Signature> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if n >= self.refuse_from.load(Ordering::SeqCst) {
            return Err(WeightLinkError::Rpc {
                code: -32002,
                message: "Transaction simulation failed: node refused".to_string(),
                logs: vec![],
            });
        }
        let signature = self.inner.send_transaction(wire).await?;
        let dropped = self
            .drop_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(WeightLinkError::connection("connection reset"));
        }
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<SignatureStatus>> {
        self.inner.signature_status(signature).await
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>> {
        self.inner.transaction_logs(signature).await
    }

    async fn get_account(&self, address: &Address) -> Result<Option<AccountData>> {
        self.inner.get_account(address).await
    }
}

async fn chunk_record(ledger: &SimulatedLedger, address: &Address) -> ModelChunk {
    let account = ledger.get_account(address).await.unwrap().unwrap();
    ModelChunk::decode(&account.data).unwrap()
}

#[tokio::test]
async fn test_upload_splits_section_into_ordered_chunks() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let artifact = Artifact::new(
        shape(),
        [
            (SectionType::Embedding, embedding(300)),
            (SectionType::LnGamma, Vec::new()),
        ],
    );
    let registry = coordinator.create_registry(&shape()).await.unwrap();
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();

    assert_eq!(summary.total_chunks(), 3);
    assert_eq!(summary.uploaded(), 3);
    assert_eq!(ledger.registry(&registry).unwrap().chunk_count, 3);

    let uploads = ledger.uploads();
    let indices: Vec<u32> = uploads.iter().map(|u| u.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(uploads.iter().all(|u| u.chunk_type == SectionType::Embedding.index()));

    let mut lengths = Vec::new();
    for upload in &uploads {
        let record = chunk_record(&ledger, &upload.chunk).await;
        assert_eq!(record.registry, registry);
        lengths.push(record.data.len());
    }
    assert_eq!(lengths, vec![128, 128, 44]);
    assert_eq!(chunk_record(&ledger, &uploads[2].chunk).await.data[43], 149);

    assert!(summary.skipped.contains(&(SectionType::LnGamma, SkipReason::Empty)));
    assert!(summary.skipped.contains(&(SectionType::Hidden, SkipReason::Absent)));
    assert_eq!(journal.confirmed_count(SectionType::Embedding), 3);
}

#[tokio::test]
async fn test_resumed_upload_creates_no_duplicates() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let tracked = Arc::new(Tracked::new(ledger.clone()));
    let ctx = LedgerContext::new(tracked.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("journal.jsonl");
    let artifact = Artifact::new(shape(), [(SectionType::Embedding, embedding(300))]);

    let registry = coordinator.create_registry(&shape()).await.unwrap();

    // Registry plus two chunks get through, then the node refuses everything.
    tracked.refuse_from.store(3, Ordering::SeqCst);
    let mut journal = UploadJournal::open(&journal_path, registry).unwrap();
    assert!(coordinator.upload(&artifact, &registry, &mut journal).await.is_err());
    assert_eq!(ledger.uploads().len(), 2);
    drop(journal);

    tracked.refuse_from.store(u32::MAX, Ordering::SeqCst);
    let mut journal = UploadJournal::open(&journal_path, registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();

    assert_eq!(summary.resumed(), 2);
    assert_eq!(summary.uploaded(), 1);
    let indices: Vec<u32> = ledger.uploads().iter().map(|u| u.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(ledger.registry(&registry).unwrap().chunk_count, 3);

    // A third run has nothing left to do.
    let mut journal = UploadJournal::open(&journal_path, registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();
    assert_eq!(summary.uploaded(), 0);
    assert_eq!(ledger.uploads().len(), 3);
}

#[tokio::test]
async fn test_transient_send_failures_are_retried() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let artifact = Artifact::new(shape(), [(SectionType::Output, embedding(10))]);

    let registry = coordinator.create_registry(&shape()).await.unwrap();
    ledger.fail_next_sends(2);
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();

    assert_eq!(summary.uploaded(), 1);
    assert_eq!(ledger.send_count(), 2);
    assert_eq!(ledger.uploads().len(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let artifact = Artifact::new(shape(), [(SectionType::Embedding, embedding(10))]);

    let registry = coordinator.create_registry(&shape()).await.unwrap();
    ledger.fail_next_sends(100);
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let err = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap_err();

    assert!(matches!(err, WeightLinkError::RetriesExhausted { attempts: 4, .. }));
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_rejected_write_is_not_retried() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let tracked = Arc::new(Tracked::new(ledger.clone()));
    let ctx = LedgerContext::new(tracked.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();

    // Registry owned by someone else
    let registry = Keypair::generate().pubkey();
    let record = ModelRegistry {
        authority: Keypair::generate().pubkey(),
        chunk_count: 0,
        shape: shape(),
    };
    ledger.insert_account(registry, record.encode());

    let artifact = Artifact::new(shape(), [(SectionType::Embedding, embedding(10))]);
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let err = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap_err();

    assert!(!err.is_transient());
    assert!(err.logs().iter().any(|line| line.contains("custom program error: 0x1770")));
    assert_eq!(tracked.sends(), 1);
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_late_confirmation_is_not_resent() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();

    // Status stays hidden for the whole confirmation window of the first attempt.
    ledger.hide_next_confirmation(5);
    let registry = coordinator.create_registry(&shape()).await.unwrap();

    assert_eq!(ledger.send_count(), 1);
    assert_eq!(ledger.registry(&registry).unwrap().chunk_count, 0);
}

#[tokio::test]
async fn test_sections_upload_in_fixed_order() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let artifact = Artifact::new(
        shape(),
        [
            (SectionType::Output, embedding(130)),
            (SectionType::Embedding, embedding(200)),
            (SectionType::Hidden, embedding(10)),
        ],
    );
    let registry = coordinator.create_registry(&shape()).await.unwrap();
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();

    let uploads = ledger.uploads();
    let types: Vec<u8> = uploads.iter().map(|u| u.chunk_type).collect();
    let indices: Vec<u32> = uploads.iter().map(|u| u.chunk_index).collect();
    assert_eq!(types, vec![0, 0, 1, 4, 4]);
    assert_eq!(indices, vec![0, 1, 0, 0, 1]);

    let order: Vec<SectionType> = summary.sections.iter().map(|s| s.section).collect();
    assert_eq!(order, vec![SectionType::Embedding, SectionType::Hidden, SectionType::Output]);
    assert_eq!(summary.total_chunks(), 5);
    assert_eq!(ledger.registry(&registry).unwrap().chunk_count, 5);
}

#[tokio::test]
async fn test_registry_landing_after_confirmation_window() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let owner = ctx.payer().pubkey();
    let coordinator = UploadCoordinator::new(ctx).unwrap();

    // Hidden through every confirmation poll and the late check; the resend is refused.
    ledger.hide_next_confirmation(6);
    let registry = coordinator.create_registry(&shape()).await.unwrap();

    assert_eq!(ledger.send_count(), 1);
    let record = ledger.registry(&registry).unwrap();
    assert_eq!(record.authority, owner);
    assert_eq!(record.chunk_count, 0);
}

#[tokio::test]
async fn test_session_landing_after_confirmation_window() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let owner = ctx.payer().pubkey();
    let registry = UploadCoordinator::new(ctx.clone())
        .unwrap()
        .create_registry(&shape())
        .await
        .unwrap();
    let controller = SessionController::new(ctx);

    ledger.hide_next_confirmation(6);
    let session = controller.ensure_session(&registry).await.unwrap();

    assert_eq!(session, controller.session_address(&owner).unwrap());
    assert_eq!(ledger.chat_init_count(), 1);
    assert_eq!(controller.ensure_session(&registry).await.unwrap(), session);
}

#[tokio::test]
async fn test_lost_acknowledgement_is_not_resent() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let tracked = Arc::new(Tracked::new(ledger.clone()));
    let ctx = LedgerContext::new(tracked.clone(), Keypair::generate(), config()).unwrap();
    let coordinator = UploadCoordinator::new(ctx).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let artifact = Artifact::new(shape(), [(SectionType::Hidden, embedding(200))]);

    let registry = coordinator.create_registry(&shape()).await.unwrap();
    tracked.drop_acks.store(1, Ordering::SeqCst);
    let mut journal = UploadJournal::open(dir.path().join("journal.jsonl"), registry).unwrap();
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await.unwrap();

    assert_eq!(summary.uploaded(), 2);
    assert_eq!(ledger.uploads().len(), 2);
    assert_eq!(ledger.registry(&registry).unwrap().chunk_count, 2);
    assert_eq!(tracked.sends(), 3);
}

#[tokio::test]
async fn test_session_is_created_once() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let owner = ctx.payer().pubkey();
    let registry = UploadCoordinator::new(ctx.clone())
        .unwrap()
        .create_registry(&shape())
        .await
        .unwrap();
    let controller = SessionController::new(ctx);

    let first = controller.ensure_session(&registry).await.unwrap();
    let second = controller.ensure_session(&registry).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, controller.session_address(&owner).unwrap());
    assert_eq!(ledger.chat_init_count(), 1);
}

#[tokio::test]
async fn test_chat_turn_returns_logged_response() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let registry = UploadCoordinator::new(ctx.clone())
        .unwrap()
        .create_registry(&shape())
        .await
        .unwrap();
    let controller = SessionController::new(ctx);
    let session = controller.ensure_session(&registry).await.unwrap();

    let outcome = controller.send_turn(&session, "Hello, LLM!").await.unwrap();
    assert_eq!(outcome.response.as_deref(), Some("You said: Hello, LLM!"));

    let long = "x".repeat(100);
    let outcome = controller.send_turn(&session, &long).await.unwrap();
    assert_eq!(outcome.response, Some(format!("You said: {}", "x".repeat(64))));

    let err = controller.send_turn(&session, "   ").await.unwrap_err();
    assert!(matches!(err, WeightLinkError::InvalidInput(_)));
}

#[tokio::test]
async fn test_chat_turn_without_response() {
    let ledger = Arc::new(SimulatedLedger::new(program_id()).with_responder(|_| None));
    let ctx = LedgerContext::new(ledger.clone(), Keypair::generate(), config()).unwrap();
    let registry = UploadCoordinator::new(ctx.clone())
        .unwrap()
        .create_registry(&shape())
        .await
        .unwrap();
    let controller = SessionController::new(ctx);
    let session = controller.ensure_session(&registry).await.unwrap();

    let outcome = controller.send_turn(&session, "anyone there?").await.unwrap();
    assert_eq!(outcome.response, None);
}
