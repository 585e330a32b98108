//! Time-Stamped Version identifiers.
//!
//! A [`Tsv`] is an opaque string of the form `tsv:<unix-ms>-<shorthash>-<seq>`,
//! totally ordered by its embedded millisecond timestamp. Equality is
//! byte-string equality, never timestamp equality — two TSVs minted in the
//! same millisecond are distinct identifiers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A time-stamped version identifier, e.g. `tsv:1732650000000-a91f2e-1`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tsv(String);

impl Tsv {
    /// Parse a raw string into a `Tsv`, validating the `tsv:<ms>-<hash>-<seq>` shape.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TsvParseError> {
        let raw = raw.into();
        let body = raw
            .strip_prefix("tsv:")
            .ok_or_else(|| TsvParseError::MissingPrefix(raw.clone()))?;
        let mut parts = body.splitn(3, '-');
        let ts = parts.next().ok_or_else(|| TsvParseError::Malformed(raw.clone()))?;
        let hash = parts.next().ok_or_else(|| TsvParseError::Malformed(raw.clone()))?;
        let seq = parts.next().ok_or_else(|| TsvParseError::Malformed(raw.clone()))?;
        ts.parse::<u64>()
            .map_err(|_| TsvParseError::BadTimestamp(raw.clone()))?;
        if hash.is_empty() || seq.is_empty() {
            return Err(TsvParseError::Malformed(raw));
        }
        Ok(Self(raw))
    }

    /// Mint a new `Tsv` from a timestamp, a short content hash, and a sequence number.
    #[must_use]
    pub fn new(unix_ms: u64, seed: &[u8], seq: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(unix_ms.to_be_bytes());
        let digest = hasher.finalize();
        let shorthash = hex_prefix(&digest, 6);
        Self(format!("tsv:{unix_ms}-{shorthash}-{seq}"))
    }

    /// The raw `tsv:...` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The embedded millisecond timestamp, used for total ordering.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0
            .strip_prefix("tsv:")
            .and_then(|body| body.split('-').next())
            .and_then(|ts| ts.parse().ok())
            .unwrap_or(0)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take((len + 1) / 2).fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })[..len]
        .to_string()
}

impl fmt::Display for Tsv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for Tsv {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl std::hash::Hash for Tsv {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Ordering follows the embedded timestamp; byte-equal strings with the same
/// timestamp (same key) compare equal, distinct strings at the same
/// millisecond are ordered (arbitrarily but consistently) by the full string
/// so that sorts are stable.
impl Ord for Tsv {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_ms()
            .cmp(&other.timestamp_ms())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Tsv {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Errors produced while parsing a raw string into a [`Tsv`].
#[derive(Debug, thiserror::Error)]
pub enum TsvParseError {
    /// The string did not start with the `tsv:` prefix.
    #[error("TSV missing 'tsv:' prefix: {0}")]
    MissingPrefix(String),
    /// The string did not have the `<ms>-<hash>-<seq>` shape.
    #[error("malformed TSV: {0}")]
    Malformed(String),
    /// The timestamp segment was not a valid integer.
    #[error("TSV timestamp segment is not a valid integer: {0}")]
    BadTimestamp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_tsv() {
        let tsv = Tsv::parse("tsv:1000-a1b2c3-1").unwrap();
        assert_eq!(tsv.as_str(), "tsv:1000-a1b2c3-1");
        assert_eq!(tsv.timestamp_ms(), 1000);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(
            Tsv::parse("1000-a1b2c3-1"),
            Err(TsvParseError::MissingPrefix(_))
        ));
    }

    #[test]
    fn rejects_malformed_body() {
        assert!(matches!(Tsv::parse("tsv:1000"), Err(TsvParseError::Malformed(_))));
    }

    #[test]
    fn orders_by_embedded_timestamp() {
        let earlier = Tsv::parse("tsv:1000-a-1").unwrap();
        let later = Tsv::parse("tsv:2000-b-1").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn equality_is_byte_string_equality() {
        let a = Tsv::parse("tsv:1000-a-1").unwrap();
        let b = Tsv::parse("tsv:1000-a-1").unwrap();
        let c = Tsv::parse("tsv:1000-a-2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_mints_parseable_tsv() {
        let tsv = Tsv::new(1_732_650_000_000, b"seed", 1);
        assert!(tsv.as_str().starts_with("tsv:1732650000000-"));
        Tsv::parse(tsv.as_str().to_string()).unwrap();
    }
}
