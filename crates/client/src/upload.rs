//! Artifact upload
//!
//! Sections go up in their fixed order and, within a section, chunks go up
//! one at a time in index order. Each chunk lives at the address of a
//! keypair reserved in the journal before the first attempt, so retries and
//! resumed runs can only ever create it once.

use crate::artifact::Artifact;
use crate::context::LedgerContext;
use crate::journal::{ChunkProgress, UploadJournal};
use crate::ledger::await_account;
use crate::submitter::TransactionSubmitter;
use tracing::{debug, info, warn};
use weightlink_common::{Result, WeightLinkError, METRICS};
use weightlink_protocol::instruction::set_compute_unit_limit;
use weightlink_protocol::{Address, ChunkDescriptor, ChunkSplitter, Keypair, ModelChunk, ModelRegistry, ModelShape, SectionType};

/// Why a section produced no chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No chunk file in the artifact
    Absent,
    /// Chunk file holds no values
    Empty,
}

/// Per-section outcome of an upload run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSummary {
    pub section: SectionType,
    pub chunk_count: u32,
    /// Created by this run
    pub uploaded: u32,
    /// Already confirmed in the journal
    pub resumed: u32,
}

/// Outcome of an upload run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub registry: Address,
    pub sections: Vec<SectionSummary>,
    pub skipped: Vec<(SectionType, SkipReason)>,
}

impl UploadSummary {
    /// Chunks across all non-empty sections
    pub fn total_chunks(&self) -> u32 {
        self.sections.iter().map(|s| s.chunk_count).sum()
    }

    pub fn uploaded(&self) -> u32 {
        self.sections.iter().map(|s| s.uploaded).sum()
    }

    pub fn resumed(&self) -> u32 {
        self.sections.iter().map(|s| s.resumed).sum()
    }
}

/// Share of `total` chunks done once `position` of them are, in percent
fn progress_percent(position: u32, total: u32) -> u64 {
    u64::from(position) * 100 / u64::from(total.max(1))
}

/// Drives artifact chunks through the submitter
pub struct UploadCoordinator {
    ctx: LedgerContext,
    submitter: TransactionSubmitter,
    splitter: ChunkSplitter,
}

impl UploadCoordinator {
    pub fn new(ctx: LedgerContext) -> Result<Self> {
        let splitter = ChunkSplitter::new(ctx.config().upload.chunk_capacity)?;
        let submitter = ctx.submitter();
        Ok(Self {
            ctx,
            submitter,
            splitter,
        })
    }

    /// Create a registry for `shape` and wait until it is readable
    pub async fn create_registry(&self, shape: &ModelShape) -> Result<Address> {
        let config = &self.ctx.config().upload;
        let payer = self.ctx.payer();
        let registry = Keypair::generate();

        let instructions = [
            set_compute_unit_limit(config.compute_unit_limit),
            self.ctx
                .program()
                .initialize_model(&payer.pubkey(), &registry.pubkey(), shape),
        ];
        let signature = match self
            .submitter
            .submit("initialize_model", &instructions, payer, &[&registry])
            .await
        {
            Ok(receipt) => Some(receipt.signature),
            // A create whose confirmation was lost can still have landed.
            Err(err) if self.owns_registry(&registry.pubkey(), &payer.pubkey()).await => {
                warn!(registry = %registry.pubkey(), error = %err, "Submission failed but registry exists, treating as created");
                None
            }
            Err(err) => return Err(err),
        };

        await_account(
            self.ctx.ledger(),
            &registry.pubkey(),
            config.registry_visibility_timeout(),
            self.ctx.config().confirmation.poll_interval(),
        )
        .await?;

        METRICS.upload.registries_created_total.inc();
        info!(registry = %registry.pubkey(), ?signature, ?shape, "Model registry created");
        Ok(registry.pubkey())
    }

    /// Whether `address` holds a registry whose authority is `authority`
    async fn owns_registry(&self, address: &Address, authority: &Address) -> bool {
        match self.ctx.ledger().get_account(address).await {
            Ok(Some(account)) => ModelRegistry::decode(&account.data)
                .map(|registry| registry.authority == *authority)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                debug!(%address, error = %e, "Registry lookup failed");
                false
            }
        }
    }

    /// Upload every non-empty section of `artifact` into `registry`
    pub async fn upload(
        &self,
        artifact: &Artifact,
        registry: &Address,
        journal: &mut UploadJournal,
    ) -> Result<UploadSummary> {
        if journal.registry() != registry {
            return Err(WeightLinkError::invalid_input(format!(
                "journal {} tracks registry {}, not {}",
                journal.path().display(),
                journal.registry(),
                registry
            )));
        }

        let mut summary = UploadSummary {
            registry: *registry,
            sections: Vec::new(),
            skipped: Vec::new(),
        };

        for section in SectionType::ALL {
            let values = match artifact.section(section) {
                None => {
                    info!(%section, "No chunk file for section, skipping");
                    METRICS.upload.sections_skipped_total.inc();
                    summary.skipped.push((section, SkipReason::Absent));
                    continue;
                }
                Some([]) => {
                    info!(%section, "Section is empty, skipping");
                    METRICS.upload.sections_skipped_total.inc();
                    summary.skipped.push((section, SkipReason::Empty));
                    continue;
                }
                Some(values) => values,
            };

            let chunk_count = self.splitter.chunk_count(values.len()) as u32;
            info!(%section, values = values.len(), chunks = chunk_count, "Uploading section");
            let mut section_summary = SectionSummary {
                section,
                chunk_count,
                uploaded: 0,
                resumed: 0,
            };

            for chunk in self.splitter.split(section, values) {
                if journal.is_confirmed(section, chunk.index) {
                    debug!(%section, index = chunk.index, "Chunk already confirmed");
                    METRICS.upload.chunks_resumed_total.inc();
                    section_summary.resumed += 1;
                    continue;
                }
                self.upload_chunk(registry, &chunk, chunk_count, journal).await?;
                section_summary.uploaded += 1;
            }
            summary.sections.push(section_summary);
        }

        info!(
            %registry,
            chunks = summary.total_chunks(),
            uploaded = summary.uploaded(),
            resumed = summary.resumed(),
            "Upload complete"
        );
        Ok(summary)
    }

    async fn upload_chunk(
        &self,
        registry: &Address,
        chunk: &ChunkDescriptor,
        chunk_count: u32,
        journal: &mut UploadJournal,
    ) -> Result<()> {
        let section = chunk.section;
        let was_pending = matches!(
            journal.progress(section, chunk.index),
            Some(ChunkProgress::Pending(_))
        );
        let keypair = journal.reserve(section, chunk.index)?;
        let address = keypair.pubkey();

        // An interrupted run may have landed this chunk without journaling it.
        if was_pending && self.chunk_exists(registry, chunk, &address).await? {
            info!(%section, index = chunk.index, chunk = %address, "Chunk found on ledger, not resending");
            journal.confirm(section, chunk.index, address, None)?;
            METRICS.upload.chunks_uploaded_total.inc();
            return Ok(());
        }

        let position = chunk.index + 1;
        info!(
            "Uploading {} chunk {}/{} ({}% complete)",
            section,
            position,
            chunk_count,
            progress_percent(position, chunk_count)
        );

        let payer = self.ctx.payer();
        let instruction = self.ctx.program().upload_chunk(
            &payer.pubkey(),
            registry,
            &address,
            chunk.index,
            section.index(),
            &chunk.data,
        );
        let label = format!("upload_chunk {}#{}", section, chunk.index);

        match self
            .submitter
            .submit(&label, &[instruction], payer, &[&keypair])
            .await
        {
            Ok(receipt) => {
                journal.confirm(section, chunk.index, address, Some(receipt.signature))?;
            }
            Err(err) => {
                // A write whose confirmation was lost can still have landed.
                if self.chunk_exists(registry, chunk, &address).await.unwrap_or(false) {
                    warn!(%section, index = chunk.index, error = %err, "Submission failed but chunk exists, treating as confirmed");
                    journal.confirm(section, chunk.index, address, None)?;
                } else {
                    return Err(err);
                }
            }
        }
        METRICS.upload.chunks_uploaded_total.inc();
        Ok(())
    }

    /// Whether the record at `address` is this chunk
    async fn chunk_exists(&self, registry: &Address, chunk: &ChunkDescriptor, address: &Address) -> Result<bool> {
        let Some(account) = self.ctx.ledger().get_account(address).await? else {
            return Ok(false);
        };
        match ModelChunk::decode(&account.data) {
            Ok(record) => Ok(record.registry == *registry
                && record.chunk_index == chunk.index
                && record.chunk_type == chunk.section.index()),
            Err(e) => {
                warn!(%address, error = %e, "Unexpected record at chunk address");
                Ok(false)
            }
        }
    }
}
