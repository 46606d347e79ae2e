//! Ed25519 signing identities
//!
//! Keypair files use the ledger CLI layout: a JSON array of 64 bytes,
//! secret seed followed by the public key.

use crate::address::{Address, Signature};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use std::path::Path;
use weightlink_common::{Result, WeightLinkError};

/// Ed25519 keypair.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self { signing_key }
    }

    /// Create from secret seed (32 bytes).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Create from the 64-byte secret-then-public layout.
    ///
    /// Fails if the public half does not belong to the secret half.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 64] = bytes.try_into().map_err(|_| {
            WeightLinkError::keypair(format!("keypair must be 64 bytes, got {}", bytes.len()))
        })?;
        let signing_key = SigningKey::from_keypair_bytes(&array)
            .map_err(|e| WeightLinkError::keypair(format!("inconsistent keypair bytes: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// Read a JSON keypair file.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WeightLinkError::keypair(format!("failed to read {}: {}", path.display(), e))
        })?;
        let bytes: Vec<u8> = serde_json::from_str(&content).map_err(|e| {
            WeightLinkError::keypair(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }

    /// Secret-then-public bytes, the inverse of [`Keypair::from_bytes`].
    pub fn to_bytes(&self) -> [u8; 64] {
        self.signing_key.to_keypair_bytes()
    }

    /// Address controlled by this keypair.
    pub fn pubkey(&self) -> Address {
        Address::new(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::new(self.signing_key.sign(message).to_bytes())
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}

/// Check `signature` over `message` against `signer`.
pub fn verify_signature(signer: &Address, message: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    verifying_key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"upload_chunk");

        assert!(verify_signature(&keypair.pubkey(), b"upload_chunk", &signature));
        assert!(!verify_signature(&keypair.pubkey(), b"tampered", &signature));
    }

    #[test]
    fn test_bytes_roundtrip_keeps_identity() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let restored = Keypair::from_bytes(&keypair.to_bytes()).unwrap();
        assert_eq!(restored.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_mismatched_public_half_rejected() {
        let mut bytes = Keypair::from_seed([1u8; 32]).to_bytes();
        bytes[40] ^= 0xff;
        assert!(Keypair::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_read_from_file() {
        let keypair = Keypair::from_seed([3u8; 32]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap()).unwrap();

        let loaded = Keypair::read_from_file(file.path()).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }
}
