//! Durable upload progress
//!
//! The journal is an append-only JSON-lines file. Before a chunk is first
//! sent, a `pending` entry records the keypair whose address the chunk
//! record will live at; once the write confirms, a `confirmed` entry
//! follows. Replaying the file tells a resumed upload which chunks are done
//! and which address an unfinished chunk must reuse.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use weightlink_common::{Result, WeightLinkError};
use weightlink_protocol::{Address, Keypair, SectionType, Signature};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    Pending {
        registry: Address,
        section: SectionType,
        index: u32,
        chunk: Address,
        keypair: Vec<u8>,
    },
    Confirmed {
        registry: Address,
        section: SectionType,
        index: u32,
        chunk: Address,
        signature: Option<Signature>,
    },
}

/// State of one chunk according to the journal
#[derive(Debug, Clone)]
pub enum ChunkProgress {
    /// Keypair reserved, confirmation not yet recorded
    Pending(Keypair),
    Confirmed { chunk: Address },
}

/// Upload progress for one registry, backed by a JSON-lines file
pub struct UploadJournal {
    path: PathBuf,
    registry: Address,
    chunks: HashMap<(SectionType, u32), ChunkProgress>,
    file: File,
}

impl UploadJournal {
    /// Open (or create) the journal at `path` and replay entries for `registry`
    ///
    /// Entries for other registries are kept in the file but ignored. A
    /// torn final line from an interrupted write is skipped.
    pub fn open<P: AsRef<Path>>(path: P, registry: Address) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut chunks = HashMap::new();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping unreadable journal line");
                    continue;
                }
            };
            Self::replay(&mut chunks, registry, entry)?;
        }
        debug!(path = %path.display(), %registry, chunks = chunks.len(), "Journal opened");

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !content.is_empty() && !content.ends_with('\n') {
            // Terminate a torn line so the next entry starts clean.
            file.write_all(b"\n")?;
        }
        Ok(Self {
            path,
            registry,
            chunks,
            file,
        })
    }

    fn replay(
        chunks: &mut HashMap<(SectionType, u32), ChunkProgress>,
        registry: Address,
        entry: JournalEntry,
    ) -> Result<()> {
        match entry {
            JournalEntry::Pending {
                registry: r,
                section,
                index,
                keypair,
                ..
            } if r == registry => {
                let keypair = Keypair::from_bytes(&keypair)?;
                // A confirmation, once recorded, is final.
                chunks
                    .entry((section, index))
                    .or_insert(ChunkProgress::Pending(keypair));
            }
            JournalEntry::Confirmed {
                registry: r,
                section,
                index,
                chunk,
                ..
            } if r == registry => {
                chunks.insert((section, index), ChunkProgress::Confirmed { chunk });
            }
            _ => {}
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &Address {
        &self.registry
    }

    pub fn progress(&self, section: SectionType, index: u32) -> Option<&ChunkProgress> {
        self.chunks.get(&(section, index))
    }

    pub fn is_confirmed(&self, section: SectionType, index: u32) -> bool {
        matches!(self.progress(section, index), Some(ChunkProgress::Confirmed { .. }))
    }

    /// Confirmed chunks of `section`
    pub fn confirmed_count(&self, section: SectionType) -> usize {
        self.chunks
            .iter()
            .filter(|((s, _), p)| *s == section && matches!(p, ChunkProgress::Confirmed { .. }))
            .count()
    }

    /// Keypair for chunk `(section, index)`: the journaled one if present,
    /// otherwise a fresh keypair that is journaled before it is returned.
    pub fn reserve(&mut self, section: SectionType, index: u32) -> Result<Keypair> {
        match self.chunks.get(&(section, index)) {
            Some(ChunkProgress::Pending(keypair)) => return Ok(keypair.clone()),
            Some(ChunkProgress::Confirmed { .. }) => {
                return Err(WeightLinkError::internal(format!(
                    "{} chunk {} is already confirmed",
                    section, index
                )))
            }
            None => {}
        }

        let keypair = Keypair::generate();
        self.append(&JournalEntry::Pending {
            registry: self.registry,
            section,
            index,
            chunk: keypair.pubkey(),
            keypair: keypair.to_bytes().to_vec(),
        })?;
        self.chunks
            .insert((section, index), ChunkProgress::Pending(keypair.clone()));
        Ok(keypair)
    }

    /// Record that chunk `(section, index)` exists at `chunk`
    pub fn confirm(
        &mut self,
        section: SectionType,
        index: u32,
        chunk: Address,
        signature: Option<Signature>,
    ) -> Result<()> {
        self.append(&JournalEntry::Confirmed {
            registry: self.registry,
            section,
            index,
            chunk,
            signature,
        })?;
        self.chunks
            .insert((section, index), ChunkProgress::Confirmed { chunk });
        Ok(())
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Address {
        Address::new([7u8; 32])
    }

    #[test]
    fn test_reserve_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let first = {
            let mut journal = UploadJournal::open(&path, registry()).unwrap();
            journal.reserve(SectionType::Embedding, 0).unwrap().pubkey()
        };

        let mut journal = UploadJournal::open(&path, registry()).unwrap();
        assert!(matches!(
            journal.progress(SectionType::Embedding, 0),
            Some(ChunkProgress::Pending(_))
        ));
        assert_eq!(journal.reserve(SectionType::Embedding, 0).unwrap().pubkey(), first);
    }

    #[test]
    fn test_confirmation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        {
            let mut journal = UploadJournal::open(&path, registry()).unwrap();
            let chunk = journal.reserve(SectionType::Hidden, 1).unwrap().pubkey();
            journal.confirm(SectionType::Hidden, 1, chunk, None).unwrap();
            assert!(journal.reserve(SectionType::Hidden, 1).is_err());
        }

        let journal = UploadJournal::open(&path, registry()).unwrap();
        assert!(journal.is_confirmed(SectionType::Hidden, 1));
        assert!(!journal.is_confirmed(SectionType::Hidden, 0));
        assert_eq!(journal.confirmed_count(SectionType::Hidden), 1);
    }

    #[test]
    fn test_other_registries_and_torn_lines_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        {
            let mut journal = UploadJournal::open(&path, Address::new([1u8; 32])).unwrap();
            let chunk = journal.reserve(SectionType::Output, 0).unwrap().pubkey();
            journal.confirm(SectionType::Output, 0, chunk, None).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"event\":\"confirmed\",\"regis").unwrap();

        {
            let mut journal = UploadJournal::open(&path, registry()).unwrap();
            assert!(!journal.is_confirmed(SectionType::Output, 0));
            let chunk = journal.reserve(SectionType::Output, 0).unwrap().pubkey();
            journal.confirm(SectionType::Output, 0, chunk, None).unwrap();
        }

        let journal = UploadJournal::open(&path, registry()).unwrap();
        assert!(journal.is_confirmed(SectionType::Output, 0));
    }
}
