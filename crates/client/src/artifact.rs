//! Quantized model artifacts on disk
//!
//! An artifact directory holds `model_registry.json` with the model's shape
//! parameters and one `chunk_<type>.bin` per section: a flat little-endian
//! array of fixed-width values. Section files are memory-mapped and decoded
//! once at load time.

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use weightlink_common::config::ElementFormat;
use weightlink_common::{Result, WeightLinkError};
use weightlink_protocol::{ModelShape, SectionType};

/// Name of the shape descriptor inside an artifact directory
pub const DESCRIPTOR_FILE: &str = "model_registry.json";

/// The descriptor either carries the shape at top level or nests it under
/// `config`, the layout the quantizer writes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Descriptor {
    Nested { config: ModelShape },
    Flat(ModelShape),
}

/// A loaded model artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    shape: ModelShape,
    sections: BTreeMap<SectionType, Vec<i32>>,
}

/// Decode a little-endian array; a trailing partial element is an error
pub fn decode_elements(bytes: &[u8], format: ElementFormat) -> Result<Vec<i32>> {
    let width = format.width();
    if bytes.len() % width != 0 {
        return Err(WeightLinkError::invalid_input(format!(
            "{} bytes is not a whole number of {}-byte elements",
            bytes.len(),
            width
        )));
    }
    let values = bytes
        .chunks_exact(width)
        .map(|raw| match format {
            ElementFormat::I16 => LittleEndian::read_i16(raw) as i32,
            ElementFormat::U16 => LittleEndian::read_u16(raw) as i32,
            ElementFormat::I32 => LittleEndian::read_i32(raw),
        })
        .collect();
    Ok(values)
}

fn read_section(path: &Path, format: ElementFormat) -> Result<Vec<i32>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        // Zero-length files cannot be mapped on every platform.
        return Ok(Vec::new());
    }
    // SAFETY: the artifact is not modified while an upload reads it.
    let mmap = unsafe { Mmap::map(&file)? };
    decode_elements(&mmap, format).map_err(|e| {
        WeightLinkError::invalid_input(format!("{}: {}", path.display(), e))
    })
}

impl Artifact {
    /// Build an artifact from in-memory sections
    pub fn new(shape: ModelShape, sections: impl IntoIterator<Item = (SectionType, Vec<i32>)>) -> Self {
        Self {
            shape,
            sections: sections.into_iter().collect(),
        }
    }

    /// Load from an artifact directory. Missing section files are omitted.
    pub fn load<P: AsRef<Path>>(dir: P, format: ElementFormat) -> Result<Self> {
        let dir = dir.as_ref();
        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&descriptor_path).map_err(|e| {
            WeightLinkError::config(format!("failed to read {}: {}", descriptor_path.display(), e))
        })?;
        let shape = match serde_json::from_str::<Descriptor>(&content).map_err(|e| {
            WeightLinkError::parse(format!("invalid {}: {}", descriptor_path.display(), e))
        })? {
            Descriptor::Nested { config } => config,
            Descriptor::Flat(shape) => shape,
        };

        let mut sections = BTreeMap::new();
        for section in SectionType::ALL {
            let path = Self::section_path(dir, section);
            if !path.exists() {
                info!(%section, path = %path.display(), "No chunk file, section omitted");
                continue;
            }
            let values = read_section(&path, format)?;
            debug!(%section, values = values.len(), "Section loaded");
            sections.insert(section, values);
        }

        Ok(Self { shape, sections })
    }

    pub fn section_path(dir: &Path, section: SectionType) -> PathBuf {
        dir.join(section.file_name())
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    /// Values of `section`, `None` if the artifact has no such section
    pub fn section(&self, section: SectionType) -> Option<&[i32]> {
        self.sections.get(&section).map(Vec::as_slice)
    }

    /// Total number of values across all sections
    pub fn total_values(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_i16(path: &Path, values: &[i16]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_decode_formats() {
        let bytes = [0xff, 0xff, 0x01, 0x00];
        assert_eq!(decode_elements(&bytes, ElementFormat::I16).unwrap(), vec![-1, 1]);
        assert_eq!(decode_elements(&bytes, ElementFormat::U16).unwrap(), vec![65535, 1]);
        assert_eq!(decode_elements(&bytes, ElementFormat::I32).unwrap(), vec![0x0001_ffff]);
    }

    #[test]
    fn test_partial_element_rejected() {
        assert!(decode_elements(&[1, 2, 3], ElementFormat::I16).is_err());
    }

    #[test]
    fn test_load_nested_descriptor_and_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE),
            r#"{"config": {"vocab_size": 256, "embedding_dim": 16, "hidden_dim": 16,
                "context_length": 128, "layer_count": 1, "bits": 16}, "num_chunks": 3}"#,
        )
        .unwrap();
        let values: Vec<i16> = (0..300).map(|v| v as i16 - 150).collect();
        write_i16(&dir.path().join("chunk_0.bin"), &values);
        fs::write(dir.path().join("chunk_2.bin"), b"").unwrap();

        let artifact = Artifact::load(dir.path(), ElementFormat::I16).unwrap();
        assert_eq!(artifact.shape().embedding_dim, 16);
        assert_eq!(artifact.section(SectionType::Embedding).unwrap().len(), 300);
        assert_eq!(artifact.section(SectionType::Embedding).unwrap()[0], -150);
        assert_eq!(artifact.section(SectionType::LnGamma), Some(&[][..]));
        assert_eq!(artifact.section(SectionType::Hidden), None);
        assert_eq!(artifact.total_values(), 300);
    }

    #[test]
    fn test_load_flat_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE),
            r#"{"vocab_size": 256, "embedding_dim": 8, "hidden_dim": 8, "context_length": 64, "layer_count": 2}"#,
        )
        .unwrap();

        let artifact = Artifact::load(dir.path(), ElementFormat::I16).unwrap();
        assert_eq!(artifact.shape().layer_count, 2);
        assert_eq!(artifact.total_values(), 0);
    }

    #[test]
    fn test_missing_descriptor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Artifact::load(dir.path(), ElementFormat::I16).is_err());
    }
}
