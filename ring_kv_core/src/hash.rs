//! 128-bit key hashes and circular hash ranges.
//!
//! Every key and every node id (`host:port`) is hashed with MD5 and the
//! digest is read as a big-endian `u128`. Ranges are half open on the
//! low side: `(low, high]`.

use crate::error::KvError;
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyHash(u128);

impl KeyHash {
    pub const MIN: KeyHash = KeyHash(u128::MIN);
    pub const MAX: KeyHash = KeyHash(u128::MAX);

    /// Hash an arbitrary string (a key or a `host:port` node id).
    pub fn of(input: &str) -> Self {
        let digest = Md5::digest(input.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        KeyHash(u128::from_be_bytes(bytes))
    }

    pub const fn from_u128(value: u128) -> Self {
        KeyHash(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// 32 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    pub fn from_hex(text: &str) -> Result<Self, KvError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| KvError::Protocol(format!("invalid hash '{}': {}", text, e)))?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            KvError::Protocol(format!("invalid hash '{}': expected 16 bytes", text))
        })?;
        Ok(KeyHash(u128::from_be_bytes(bytes)))
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({:032x})", self.0)
    }
}

impl FromStr for KeyHash {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyHash::from_hex(s)
    }
}

impl Serialize for KeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        KeyHash::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// A circular `(low, high]` range of the hash space.
///
/// `low == high` denotes the whole ring (a single node owns everything).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub low: KeyHash,
    pub high: KeyHash,
}

impl HashRange {
    pub fn new(low: KeyHash, high: KeyHash) -> Self {
        Self { low, high }
    }

    /// The range owned by the only node of a ring.
    pub fn full(at: KeyHash) -> Self {
        Self { low: at, high: at }
    }

    pub fn is_full(&self) -> bool {
        self.low == self.high
    }

    pub fn contains(&self, hash: KeyHash) -> bool {
        if self.low == self.high {
            true
        } else if self.low < self.high {
            self.low < hash && hash <= self.high
        } else {
            hash > self.low || hash <= self.high
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.contains(KeyHash::of(key))
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.low, self.high)
    }
}

impl fmt::Debug for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.low, self.high)
    }
}
