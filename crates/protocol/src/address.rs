//! Base58-encoded identities used on the wire
//!
//! Addresses, block hashes and signatures are fixed-size byte arrays that
//! the ledger renders as base58 text.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use weightlink_common::{Result, WeightLinkError};

macro_rules! base58_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Length in bytes
            pub const LEN: usize = $len;

            /// Wrap raw bytes
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Copy from a slice of exactly `LEN` bytes
            pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    WeightLinkError::parse(format!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Raw bytes as a slice
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bs58::encode(self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = WeightLinkError;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = bs58::decode(s.trim()).into_vec().map_err(|e| {
                    WeightLinkError::parse(format!("invalid base58 {}: {}", stringify!($name), e))
                })?;
                Self::try_from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

base58_bytes!(
    /// 32-byte ledger address of a record, program or signer
    Address,
    32
);

base58_bytes!(
    /// Recent block hash; the freshness token a transaction is built against
    Hash,
    32
);

base58_bytes!(
    /// 64-byte ed25519 signature; the first one identifies a transaction
    Signature,
    64
);

impl Address {
    /// The system program (all zero bytes)
    pub const SYSTEM_PROGRAM: Address = Address([0u8; 32]);

    /// `ComputeBudget111111111111111111111111111111`
    pub const COMPUTE_BUDGET_PROGRAM: Address = Address([
        3, 6, 70, 111, 229, 33, 23, 50, 255, 236, 173, 186, 114, 195, 155, 231, 188, 140, 229, 187,
        197, 247, 18, 107, 44, 67, 155, 58, 64, 0, 0, 0,
    ]);
}

impl Default for Hash {
    fn default() -> Self {
        Hash([0u8; 32])
    }
}
