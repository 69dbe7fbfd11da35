use std::fmt;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Sortable session identifier: `YYYYMMDD-HHMMSS-<8 hex>`.
///
/// Lexical order matches creation order because the timestamp prefix is
/// fixed-width and zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from the current time plus 8 random hex digits.
    pub fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        Self(format!("{stamp}-{suffix:08x}"))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, StoreError> {
        let s = s.into();
        if !is_valid(&s) {
            return Err(StoreError::InvalidSessionId(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    // YYYYMMDD-HHMMSS-XXXXXXXX = 8 + 1 + 6 + 1 + 8 = 24 bytes
    if bytes.len() != 24 {
        return false;
    }
    let digits = |r: std::ops::Range<usize>| bytes[r].iter().all(u8::is_ascii_digit);
    let hex = |r: std::ops::Range<usize>| bytes[r].iter().all(u8::is_ascii_hexdigit);
    digits(0..8) && bytes[8] == b'-' && digits(9..15) && bytes[15] == b'-' && hex(16..24)
        && bytes[16..24].iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SessionId::parse(s).map_err(serde::de::Error::custom)
    }
}
