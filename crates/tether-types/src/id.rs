//! 512-bit identifiers for stored objects and message correlation.
//!
//! Names map onto identifiers through [`Id::new_hash`], which must produce the
//! same bytes on every node so that a name resolves to the same key
//! network-wide.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;

/// Length of an identifier in bytes.
pub const ID_LENGTH: usize = 64;

/// A fixed-length 64-byte key. Equality is byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LENGTH]);

impl Id {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// A random identifier built from four random 128-bit values.
    pub fn new_random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; ID_LENGTH];
        for chunk in bytes.chunks_exact_mut(16) {
            chunk.copy_from_slice(&rng.gen::<u128>().to_le_bytes());
        }
        Self(bytes)
    }

    /// Derive an identifier from a name (UTF-8 bytes fed to [`Id::hashed_key`]).
    pub fn new_hash(name: &str) -> Self {
        Self::hashed_key(name.as_bytes())
    }

    /// Derive an identifier from arbitrary bytes.
    ///
    /// Hashes the input and its three incremented variants (input+1, +2, +3,
    /// read as little-endian integers of the same width) with SHA-512,
    /// concatenates the four digests and keeps the first 512 bits.
    pub fn hashed_key(data: &[u8]) -> Self {
        let mut digests = Vec::with_capacity(ID_LENGTH * 4);
        digests.extend_from_slice(&Sha512::digest(data));
        for step in 1..=3u64 {
            let mut variant = data.to_vec();
            add_le(&mut variant, step);
            digests.extend_from_slice(&Sha512::digest(&variant));
        }

        let mut bytes = [0u8; ID_LENGTH];
        bytes.copy_from_slice(&digests[..ID_LENGTH]);
        Self(bytes)
    }

    /// Integer addition over the byte array, wrapping at 512 bits.
    ///
    /// Used to derive related-but-distinct keys from a base key.
    pub fn add(&self, amount: u64) -> Self {
        let mut bytes = self.0;
        add_le(&mut bytes, amount);
        Self(bytes)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Add `amount` to a little-endian integer in place, discarding the final carry.
fn add_le(bytes: &mut [u8], amount: u64) {
    let mut carry = amount as u128;
    for byte in bytes.iter_mut() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u128 + (carry & 0xff);
        *byte = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}…)", &self.to_hex()[..12])
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; ID_LENGTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
