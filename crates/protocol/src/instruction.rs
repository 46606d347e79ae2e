//! Program instructions
//!
//! Builders for the five operations the model program accepts, plus the
//! compute-budget instruction that precedes registry creation. Instruction
//! data is an 8-byte discriminator followed by little-endian arguments;
//! vectors carry a `u32` length prefix.

use crate::accounts::ModelShape;
use crate::address::Address;
use crate::chunk::SectionType;
use crate::derive::AddressDeriver;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use weightlink_common::{Result, WeightLinkError};

pub const INITIALIZE_MODEL: [u8; 8] = [150, 196, 232, 118, 138, 43, 140, 244];
pub const UPLOAD_CHUNK: [u8; 8] = [130, 219, 165, 153, 119, 149, 252, 162];
pub const INITIALIZE_CHAT: [u8; 8] = [4, 81, 179, 155, 220, 138, 192, 182];
pub const CHAT: [u8; 8] = [189, 34, 82, 12, 30, 178, 146, 97];
pub const CLOSE_GIVEN_ACCOUNT: [u8; 8] = [96, 51, 228, 64, 229, 69, 186, 32];

/// Compute-budget instruction tag for `SetComputeUnitLimit`
const SET_COMPUTE_UNIT_LIMIT: u8 = 2;

/// One account reference of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountMeta {
    pub pubkey: Address,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(pubkey: Address, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn readonly(pubkey: Address, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

/// A program invocation: target program, accounts and opaque data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub program_id: Address,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

fn data_with(discriminator: &[u8; 8], capacity: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + capacity);
    data.extend_from_slice(discriminator);
    data
}

/// Builds instructions for one deployed model program
#[derive(Debug, Clone, Copy)]
pub struct ProgramInstructions {
    deriver: AddressDeriver,
}

impl ProgramInstructions {
    pub fn new(program_id: Address) -> Self {
        Self {
            deriver: AddressDeriver::new(program_id),
        }
    }

    pub fn program_id(&self) -> &Address {
        self.deriver.program_id()
    }

    pub fn deriver(&self) -> &AddressDeriver {
        &self.deriver
    }

    /// Create a registry record at the address of a fresh keypair
    pub fn initialize_model(&self, signer: &Address, registry: &Address, shape: &ModelShape) -> Instruction {
        let mut data = data_with(&INITIALIZE_MODEL, 20);
        for value in [
            shape.vocab_size,
            shape.embedding_dim,
            shape.hidden_dim,
            shape.context_length,
            shape.layer_count,
        ] {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Instruction {
            program_id: *self.program_id(),
            accounts: vec![
                AccountMeta::writable(*signer, true),
                AccountMeta::writable(*registry, true),
                AccountMeta::readonly(Address::SYSTEM_PROGRAM, false),
            ],
            data,
        }
    }

    /// Create one chunk record at `chunk` and bump the registry counter
    pub fn upload_chunk(
        &self,
        signer: &Address,
        registry: &Address,
        chunk: &Address,
        chunk_index: u32,
        chunk_type: u8,
        values: &[i32],
    ) -> Instruction {
        let mut data = data_with(&UPLOAD_CHUNK, 4 + 1 + 4 + values.len() * 4);
        data.extend_from_slice(&chunk_index.to_le_bytes());
        data.push(chunk_type);
        data.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Instruction {
            program_id: *self.program_id(),
            accounts: vec![
                AccountMeta::writable(*signer, true),
                AccountMeta::writable(*registry, false),
                AccountMeta::writable(*chunk, true),
                AccountMeta::readonly(Address::SYSTEM_PROGRAM, false),
            ],
            data,
        }
    }

    /// Create the session record at `session`, bound to `model`
    pub fn initialize_chat(&self, signer: &Address, session: &Address, model: &Address) -> Instruction {
        Instruction {
            program_id: *self.program_id(),
            accounts: vec![
                AccountMeta::writable(*signer, true),
                AccountMeta::writable(*session, false),
                AccountMeta::readonly(*model, false),
                AccountMeta::readonly(Address::SYSTEM_PROGRAM, false),
            ],
            data: INITIALIZE_CHAT.to_vec(),
        }
    }

    /// Submit one chat turn against `session` using the model at `registry`
    pub fn chat(&self, signer: &Address, session: &Address, registry: &Address, input: &[u8]) -> Result<Instruction> {
        let mut accounts = vec![
            AccountMeta::writable(*signer, true),
            AccountMeta::writable(*session, false),
            AccountMeta::readonly(*registry, false),
        ];
        for section in SectionType::ALL {
            let anchor = self.deriver.chunk_anchor(registry, section.index())?;
            accounts.push(AccountMeta::readonly(anchor.address, false));
        }

        let mut data = data_with(&CHAT, 4 + input.len() + 4);
        data.extend_from_slice(&(input.len() as u32).to_le_bytes());
        data.extend_from_slice(input);
        data.extend_from_slice(&(input.len() as u32).to_le_bytes());

        Ok(Instruction {
            program_id: *self.program_id(),
            accounts,
            data,
        })
    }

    /// Reclaim the storage of `account`
    pub fn close_given_account(&self, signer: &Address, account: &Address) -> Instruction {
        Instruction {
            program_id: *self.program_id(),
            accounts: vec![
                AccountMeta::writable(*signer, true),
                AccountMeta::writable(*account, false),
                AccountMeta::readonly(Address::SYSTEM_PROGRAM, false),
            ],
            data: CLOSE_GIVEN_ACCOUNT.to_vec(),
        }
    }
}

/// Raise the compute unit ceiling of the enclosing transaction
pub fn set_compute_unit_limit(units: u32) -> Instruction {
    let mut data = Vec::with_capacity(5);
    data.push(SET_COMPUTE_UNIT_LIMIT);
    data.extend_from_slice(&units.to_le_bytes());
    Instruction {
        program_id: Address::COMPUTE_BUDGET_PROGRAM,
        accounts: Vec::new(),
        data,
    }
}

/// Decoded instruction data of the model program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramCall {
    InitializeModel(ModelShape),
    UploadChunk {
        chunk_index: u32,
        chunk_type: u8,
        data: Vec<i32>,
    },
    InitializeChat,
    Chat {
        input_text: Vec<u8>,
        input_length: u32,
    },
    CloseGivenAccount,
}

impl ProgramCall {
    pub fn name(&self) -> &'static str {
        match self {
            ProgramCall::InitializeModel(_) => "initialize_model",
            ProgramCall::UploadChunk { .. } => "upload_chunk",
            ProgramCall::InitializeChat => "initialize_chat",
            ProgramCall::Chat { .. } => "chat",
            ProgramCall::CloseGivenAccount => "close_given_account",
        }
    }

    /// Parse instruction data produced by [`ProgramInstructions`]
    pub fn decode(data: &[u8]) -> Result<Self> {
        let malformed = |e: std::io::Error| WeightLinkError::protocol(format!("malformed instruction data: {}", e));

        let mut cursor = Cursor::new(data);
        let mut discriminator = [0u8; 8];
        cursor.read_exact(&mut discriminator).map_err(malformed)?;

        let call = match discriminator {
            INITIALIZE_MODEL => {
                let mut fields = [0u32; 5];
                for field in fields.iter_mut() {
                    *field = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
                }
                ProgramCall::InitializeModel(ModelShape {
                    vocab_size: fields[0],
                    embedding_dim: fields[1],
                    hidden_dim: fields[2],
                    context_length: fields[3],
                    layer_count: fields[4],
                })
            }
            UPLOAD_CHUNK => {
                let chunk_index = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
                let chunk_type = cursor.read_u8().map_err(malformed)?;
                let len = cursor.read_u32::<LittleEndian>().map_err(malformed)? as usize;
                let remaining = data.len() - cursor.position() as usize;
                if len.saturating_mul(4) > remaining {
                    return Err(WeightLinkError::protocol("chunk data length exceeds instruction"));
                }
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(cursor.read_i32::<LittleEndian>().map_err(malformed)?);
                }
                ProgramCall::UploadChunk {
                    chunk_index,
                    chunk_type,
                    data: values,
                }
            }
            INITIALIZE_CHAT => ProgramCall::InitializeChat,
            CHAT => {
                let len = cursor.read_u32::<LittleEndian>().map_err(malformed)? as usize;
                let remaining = data.len() - cursor.position() as usize;
                if len > remaining {
                    return Err(WeightLinkError::protocol("chat input length exceeds instruction"));
                }
                let mut input_text = vec![0u8; len];
                cursor.read_exact(&mut input_text).map_err(malformed)?;
                let input_length = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
                ProgramCall::Chat {
                    input_text,
                    input_length,
                }
            }
            CLOSE_GIVEN_ACCOUNT => ProgramCall::CloseGivenAccount,
            other => {
                return Err(WeightLinkError::protocol(format!(
                    "unknown instruction discriminator {:?}",
                    other
                )))
            }
        };
        Ok(call)
    }
}

/// Decode a `SetComputeUnitLimit` instruction, if that is what `data` is
pub fn decode_compute_unit_limit(data: &[u8]) -> Option<u32> {
    match data {
        [SET_COMPUTE_UNIT_LIMIT, rest @ ..] if rest.len() == 4 => {
            Some(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]))
        }
        _ => None,
    }
}
