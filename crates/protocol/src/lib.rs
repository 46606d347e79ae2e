//! WeightLink wire protocol
//!
//! Ledger-facing types with no network I/O: addresses and keys, derived
//! record addresses, program instructions, record layouts, transaction
//! encoding and artifact chunking.

pub mod accounts;
pub mod address;
pub mod chunk;
pub mod derive;
pub mod instruction;
pub mod keypair;
pub mod transaction;

pub use accounts::{ChatState, ModelChunk, ModelRegistry, ModelShape};
pub use address::{Address, Hash, Signature};
pub use chunk::{ChunkDescriptor, ChunkSplitter, SectionType};
pub use derive::{AddressDeriver, DerivedAddress};
pub use instruction::{AccountMeta, Instruction, ProgramCall, ProgramInstructions};
pub use keypair::Keypair;
pub use transaction::{Message, Transaction};
