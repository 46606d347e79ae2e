//! Artifact sections and their chunking
//!
//! Each section of a model artifact is a flat sequence of quantized values.
//! A section is cut into fixed-capacity chunks; chunk `i` covers values
//! `[i * capacity, min((i + 1) * capacity, len))`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use weightlink_common::config::MAX_CHUNK_LEN;
use weightlink_common::{Result, WeightLinkError};

/// Logical type of an artifact section, in upload order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Embedding,
    Hidden,
    LnGamma,
    LnBeta,
    Output,
}

impl SectionType {
    /// All section types in the fixed enumeration order
    pub const ALL: [SectionType; 5] = [
        SectionType::Embedding,
        SectionType::Hidden,
        SectionType::LnGamma,
        SectionType::LnBeta,
        SectionType::Output,
    ];

    /// Wire tag (`chunk_type`) of the section
    pub fn index(&self) -> u8 {
        match self {
            SectionType::Embedding => 0,
            SectionType::Hidden => 1,
            SectionType::LnGamma => 2,
            SectionType::LnBeta => 3,
            SectionType::Output => 4,
        }
    }

    /// Parse a wire tag
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            SectionType::Embedding => "embedding",
            SectionType::Hidden => "hidden",
            SectionType::LnGamma => "ln_gamma",
            SectionType::LnBeta => "ln_beta",
            SectionType::Output => "output",
        }
    }

    /// Source file name inside an artifact directory
    pub fn file_name(&self) -> String {
        format!("chunk_{}.bin", self.index())
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SectionType {
    type Err = WeightLinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|section| section.name() == s)
            .ok_or_else(|| WeightLinkError::parse(format!("unknown section type: {}", s)))
    }
}

/// One bounded slice of a section, the unit of upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Section the values belong to
    pub section: SectionType,

    /// Position within the section, contiguous from 0
    pub index: u32,

    /// At most `capacity` values
    pub data: Vec<i32>,
}

/// Cuts section values into chunk descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSplitter {
    capacity: usize,
}

impl ChunkSplitter {
    /// Create a splitter; capacity must be in `1..=MAX_CHUNK_LEN`
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_CHUNK_LEN {
            return Err(WeightLinkError::invalid_input(format!(
                "chunk capacity must be in 1..={}, got {}",
                MAX_CHUNK_LEN, capacity
            )));
        }
        Ok(Self { capacity })
    }

    /// Values per chunk
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks `len` values produce
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.capacity)
    }

    /// Lazily split `values`; empty input yields no chunks
    pub fn split<'a>(
        &self,
        section: SectionType,
        values: &'a [i32],
    ) -> impl Iterator<Item = ChunkDescriptor> + 'a {
        values
            .chunks(self.capacity)
            .enumerate()
            .map(move |(index, data)| ChunkDescriptor {
                section,
                index: index as u32,
                data: data.to_vec(),
            })
    }
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self {
            capacity: MAX_CHUNK_LEN,
        }
    }
}
