//! Content addressing for transactions.
//!
//! A transaction hash is the BLAKE3 digest of the transaction's canonical
//! byte form, displayed as lowercase hex. Proof-of-work is expressed as a
//! required number of leading zero hex nibbles in that digest.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Digest size in bytes.
pub const HASH_SIZE: usize = 32;

/// A transaction digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; HASH_SIZE]);

impl TxHash {
    /// Sentinel for uninitialized hash fields. Never produced by mining.
    pub const INVALID: TxHash = TxHash([0u8; HASH_SIZE]);

    /// Whether this hash has been set to something other than the sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Lowercase hex form (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Option<TxHash> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(TxHash(arr))
    }

    /// Number of leading zero hex nibbles, for proof-of-work checks.
    pub fn leading_zero_nibbles(&self) -> u32 {
        let mut count = 0;
        for byte in self.0 {
            if byte == 0 {
                count += 2;
            } else if byte >> 4 == 0 {
                count += 1;
                break;
            } else {
                break;
            }
        }
        count
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_hex())
    }
}
