//! Remote record layouts
//!
//! Every record starts with an 8-byte type discriminator followed by its
//! fields, little-endian, with vectors prefixed by a `u32` length. Records
//! may be allocated larger than their contents, so decoding ignores
//! trailing bytes.

use crate::address::Address;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use weightlink_common::{Result, WeightLinkError};

pub const MODEL_REGISTRY_DISCRIMINATOR: [u8; 8] = [174, 72, 180, 46, 185, 165, 246, 200];
pub const MODEL_CHUNK_DISCRIMINATOR: [u8; 8] = [254, 185, 27, 224, 107, 118, 26, 25];
pub const CHAT_STATE_DISCRIMINATOR: [u8; 8] = [67, 109, 181, 186, 97, 123, 128, 236];

/// Shape parameters declared for a model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub vocab_size: u32,
    pub embedding_dim: u32,
    pub hidden_dim: u32,
    pub context_length: u32,
    pub layer_count: u32,
}

/// Summary record of an uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    pub authority: Address,
    pub chunk_count: u32,
    pub shape: ModelShape,
}

/// One uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChunk {
    pub authority: Address,
    pub registry: Address,
    pub chunk_index: u32,
    pub chunk_type: u8,
    pub data: Vec<i32>,
}

/// Conversational state of one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub authority: Address,
    pub model: Address,
    pub history: Vec<u8>,
    pub history_len: u32,
}

fn truncated(err: std::io::Error) -> WeightLinkError {
    WeightLinkError::protocol(format!("record truncated: {}", err))
}

fn read_discriminator(cursor: &mut Cursor<&[u8]>, expected: &[u8; 8], kind: &str) -> Result<()> {
    let mut tag = [0u8; 8];
    cursor.read_exact(&mut tag).map_err(truncated)?;
    if &tag != expected {
        return Err(WeightLinkError::protocol(format!(
            "record is not a {} (discriminator {:?})",
            kind, tag
        )));
    }
    Ok(())
}

fn read_address(cursor: &mut Cursor<&[u8]>) -> Result<Address> {
    let mut bytes = [0u8; 32];
    cursor.read_exact(&mut bytes).map_err(truncated)?;
    Ok(Address::new(bytes))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor.read_u32::<LittleEndian>().map_err(truncated)
}

/// Bound a declared vector length by what is actually left in the record
fn read_len(cursor: &mut Cursor<&[u8]>, element_width: usize) -> Result<usize> {
    let len = read_u32(cursor)? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len.saturating_mul(element_width) > remaining {
        return Err(WeightLinkError::protocol(format!(
            "declared length {} exceeds remaining {} bytes",
            len, remaining
        )));
    }
    Ok(len)
}

impl ModelRegistry {
    /// Encoded size without padding
    pub const LEN: usize = 8 + 32 + 4 * 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&MODEL_REGISTRY_DISCRIMINATOR);
        out.extend_from_slice(self.authority.as_slice());
        for value in [
            self.chunk_count,
            self.shape.vocab_size,
            self.shape.embedding_dim,
            self.shape.hidden_dim,
            self.shape.context_length,
            self.shape.layer_count,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        read_discriminator(&mut cursor, &MODEL_REGISTRY_DISCRIMINATOR, "model registry")?;
        let authority = read_address(&mut cursor)?;
        let chunk_count = read_u32(&mut cursor)?;
        let shape = ModelShape {
            vocab_size: read_u32(&mut cursor)?,
            embedding_dim: read_u32(&mut cursor)?,
            hidden_dim: read_u32(&mut cursor)?,
            context_length: read_u32(&mut cursor)?,
            layer_count: read_u32(&mut cursor)?,
        };
        Ok(Self {
            authority,
            chunk_count,
            shape,
        })
    }
}

impl ModelChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 64 + 4 + 1 + 4 + self.data.len() * 4);
        out.extend_from_slice(&MODEL_CHUNK_DISCRIMINATOR);
        out.extend_from_slice(self.authority.as_slice());
        out.extend_from_slice(self.registry.as_slice());
        out.extend_from_slice(&self.chunk_index.to_le_bytes());
        out.push(self.chunk_type);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        for value in &self.data {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        read_discriminator(&mut cursor, &MODEL_CHUNK_DISCRIMINATOR, "model chunk")?;
        let authority = read_address(&mut cursor)?;
        let registry = read_address(&mut cursor)?;
        let chunk_index = read_u32(&mut cursor)?;
        let chunk_type = cursor.read_u8().map_err(truncated)?;
        let len = read_len(&mut cursor, 4)?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(cursor.read_i32::<LittleEndian>().map_err(truncated)?);
        }
        Ok(Self {
            authority,
            registry,
            chunk_index,
            chunk_type,
            data: values,
        })
    }
}

impl ChatState {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 64 + 4 + self.history.len() + 4);
        out.extend_from_slice(&CHAT_STATE_DISCRIMINATOR);
        out.extend_from_slice(self.authority.as_slice());
        out.extend_from_slice(self.model.as_slice());
        out.extend_from_slice(&(self.history.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.history);
        out.extend_from_slice(&self.history_len.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        read_discriminator(&mut cursor, &CHAT_STATE_DISCRIMINATOR, "chat state")?;
        let authority = read_address(&mut cursor)?;
        let model = read_address(&mut cursor)?;
        let len = read_len(&mut cursor, 1)?;
        let mut history = vec![0u8; len];
        cursor.read_exact(&mut history).map_err(truncated)?;
        let history_len = read_u32(&mut cursor)?;
        Ok(Self {
            authority,
            model,
            history,
            history_len,
        })
    }

    /// The meaningful prefix of the history buffer
    pub fn history_text(&self) -> String {
        let end = (self.history_len as usize).min(self.history.len());
        String::from_utf8_lossy(&self.history[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ModelShape {
        ModelShape {
            vocab_size: 256,
            embedding_dim: 128,
            hidden_dim: 128,
            context_length: 128,
            layer_count: 2,
        }
    }

    #[test]
    fn test_registry_field_offsets() {
        let registry = ModelRegistry {
            authority: Address::new([1u8; 32]),
            chunk_count: 3,
            shape: shape(),
        };
        let bytes = registry.encode();

        assert_eq!(bytes.len(), ModelRegistry::LEN);
        assert_eq!(&bytes[8..40], &[1u8; 32]);
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[44..48].try_into().unwrap()), 256);
        assert_eq!(u32::from_le_bytes(bytes[60..64].try_into().unwrap()), 2);
    }

    #[test]
    fn test_decode_ignores_padding() {
        let registry = ModelRegistry {
            authority: Address::new([2u8; 32]),
            chunk_count: 0,
            shape: shape(),
        };
        let mut bytes = registry.encode();
        bytes.extend_from_slice(&[0u8; 8]);

        assert_eq!(ModelRegistry::decode(&bytes).unwrap(), registry);
    }

    #[test]
    fn test_chunk_decode_with_negative_values() {
        let chunk = ModelChunk {
            authority: Address::new([3u8; 32]),
            registry: Address::new([4u8; 32]),
            chunk_index: 2,
            chunk_type: 1,
            data: vec![-32768, 0, 32767, -1],
        };
        let decoded = ModelChunk::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_wrong_discriminator_rejected() {
        let chunk = ModelChunk {
            authority: Address::new([3u8; 32]),
            registry: Address::new([4u8; 32]),
            chunk_index: 0,
            chunk_type: 0,
            data: vec![],
        };
        assert!(ModelRegistry::decode(&chunk.encode()).is_err());
    }

    #[test]
    fn test_chat_state_layout() {
        let state = ChatState {
            authority: Address::new([5u8; 32]),
            model: Address::new([6u8; 32]),
            history: vec![7u8; 3],
            history_len: 2,
        };
        let bytes = state.encode();

        assert_eq!(bytes.len(), 8 + 64 + 4 + 3 + 4);
        assert_eq!(&bytes[72..76], &[3, 0, 0, 0]);
        assert_eq!(&bytes[76..79], &[7u8; 3]);
        assert_eq!(&bytes[79..83], &[2, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let state = ChatState {
            authority: Address::new([5u8; 32]),
            model: Address::new([6u8; 32]),
            history: vec![0u8; 128],
            history_len: 0,
        };
        let bytes = state.encode();
        assert!(ChatState::decode(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn test_history_text() {
        let mut history = b"Hello, LLM!".to_vec();
        history.resize(128, 0);
        let state = ChatState {
            authority: Address::new([5u8; 32]),
            model: Address::new([6u8; 32]),
            history,
            history_len: 11,
        };
        assert_eq!(ChatState::decode(&state.encode()).unwrap().history_text(), "Hello, LLM!");
    }
}
