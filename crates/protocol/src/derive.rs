//! Deterministic record addresses
//!
//! Records such as chat sessions and chunk-set anchors live at addresses
//! derived from a short seed list and the program address. The derivation
//! hashes the seeds with a bump byte and keeps the first digest that is
//! *not* a valid ed25519 point, so nobody can hold a private key for it.

use crate::address::Address;
use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha256};
use weightlink_common::{Result, WeightLinkError};

/// Maximum length of one seed
pub const MAX_SEED_LEN: usize = 32;

/// Maximum number of seeds (bump excluded)
pub const MAX_SEEDS: usize = 16;

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

/// A derived address and the bump byte that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: Address,
    pub bump: u8,
}

/// Whether `bytes` decompress to a point on the ed25519 curve
pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
    CompressedEdwardsY(*bytes).decompress().is_some()
}

fn check_seeds(seeds: &[&[u8]]) -> Result<()> {
    if seeds.len() > MAX_SEEDS {
        return Err(WeightLinkError::protocol(format!(
            "at most {} seeds allowed, got {}",
            MAX_SEEDS,
            seeds.len()
        )));
    }
    if let Some(seed) = seeds.iter().find(|seed| seed.len() > MAX_SEED_LEN) {
        return Err(WeightLinkError::protocol(format!(
            "seed of {} bytes exceeds {} byte limit",
            seed.len(),
            MAX_SEED_LEN
        )));
    }
    Ok(())
}

/// Hash seeds into an address, or `None` if the digest lands on the curve
fn hash_seeds(seeds: &[&[u8]], bump: Option<u8>, program_id: &Address) -> Option<Address> {
    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed);
    }
    if let Some(bump) = bump {
        hasher.update([bump]);
    }
    hasher.update(program_id.as_bytes());
    hasher.update(PDA_MARKER);

    let digest: [u8; 32] = hasher.finalize().into();
    if is_on_curve(&digest) {
        None
    } else {
        Some(Address::new(digest))
    }
}

/// Derive the address for an exact seed list (bump already included)
pub fn create_program_address(seeds: &[&[u8]], program_id: &Address) -> Result<Address> {
    check_seeds(seeds)?;
    hash_seeds(seeds, None, program_id)
        .ok_or_else(|| WeightLinkError::protocol("seeds derive an on-curve address"))
}

/// Search bumps 255 down to 0 for the canonical derived address
pub fn find_program_address(seeds: &[&[u8]], program_id: &Address) -> Result<DerivedAddress> {
    // The bump rides along as one more seed.
    if seeds.len() >= MAX_SEEDS {
        return Err(WeightLinkError::protocol(format!(
            "at most {} seeds allowed alongside the bump",
            MAX_SEEDS - 1
        )));
    }
    check_seeds(seeds)?;

    (0..=u8::MAX)
        .rev()
        .find_map(|bump| {
            hash_seeds(seeds, Some(bump), program_id).map(|address| DerivedAddress { address, bump })
        })
        .ok_or_else(|| WeightLinkError::protocol("no viable bump seed"))
}

/// Maps (domain tag, owner, optional extra bytes) to a record address
/// under a fixed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressDeriver {
    program_id: Address,
}

impl AddressDeriver {
    /// Create a deriver for records owned by `program_id`
    pub fn new(program_id: Address) -> Self {
        Self { program_id }
    }

    /// Program the derived records belong to
    pub fn program_id(&self) -> &Address {
        &self.program_id
    }

    /// Derive the address for `[tag, owner, extra?]`
    pub fn derive(&self, tag: &[u8], owner: &Address, extra: Option<&[u8]>) -> Result<DerivedAddress> {
        match extra {
            Some(extra) => find_program_address(&[tag, owner.as_slice(), extra], &self.program_id),
            None => find_program_address(&[tag, owner.as_slice()], &self.program_id),
        }
    }

    /// Session record for `owner`, keyed by the human-chosen `seed`
    pub fn session(&self, seed: &str, owner: &Address) -> Result<DerivedAddress> {
        self.derive(seed.as_bytes(), owner, None)
    }

    /// Chunk-set anchor of one section type under a registry
    pub fn chunk_anchor(&self, registry: &Address, section_index: u8) -> Result<DerivedAddress> {
        self.derive(b"chunk", registry, Some(&[section_index][..]))
    }
}
