//! Strongly-typed job identifiers.
//!
//! Identifiers are either caller-supplied (recurring jobs use stable, well-known
//! names) or generated: 10 random bytes from the OS RNG rendered as 16 lowercase
//! base32 characters, which keeps them URL-safe and case-stable.

use core::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Number of random bytes behind a generated identifier.
pub const UID_RANDOM_BYTES: usize = 10;

/// Length of a generated identifier (80 bits, 5 bits per character).
pub const UID_LEN: usize = 16;

const UID_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Identifier of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUid(String);

impl JobUid {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; UID_RANDOM_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(encode_base32(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for JobUid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::borrow::Borrow<str> for JobUid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobUid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<JobUid> for String {
    fn from(value: JobUid) -> Self {
        value.0
    }
}

impl FromStr for JobUid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(DomainError::validation("job uid must not be empty"));
        }
        Ok(Self(s.to_string()))
    }
}

fn encode_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(UID_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }

    if bits > 0 {
        out.push(UID_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }

    out
}
