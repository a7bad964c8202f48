//! Content digests and repository names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// A content digest of the form `algorithm:encoded`, e.g.
/// `sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

/// A string that is not a valid digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest {digest:?}: {reason}")]
pub struct DigestError {
    digest: String,
    reason: &'static str,
}

impl Digest {
    /// Parse and validate a digest.
    pub fn parse(digest: impl Into<String>) -> Result<Self, DigestError> {
        let digest = digest.into();
        let invalid = |reason| DigestError {
            digest: digest.clone(),
            reason,
        };

        let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        let expected = match algorithm {
            "sha256" => Some(64),
            "sha512" => Some(128),
            "" => return Err(invalid("empty algorithm")),
            other if other.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) => None,
            _ => return Err(invalid("algorithm must be lowercase alphanumeric")),
        };

        match expected {
            Some(len) => {
                if encoded.len() != len {
                    return Err(invalid("wrong length for algorithm"));
                }
                if !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
                    return Err(invalid("encoded part must be lowercase hex"));
                }
            }
            None => {
                if encoded.is_empty() {
                    return Err(invalid("empty encoded part"));
                }
                if !encoded
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
                {
                    return Err(invalid("invalid character in encoded part"));
                }
            }
        }

        Ok(Digest(digest))
    }

    /// The sha256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Digest(format!("sha256:{}", hex::encode(sha2::Sha256::digest(data))))
    }

    /// The algorithm part, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The encoded hash.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    /// The digest as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

/// Whether `name` is a valid repository name: slash separated lowercase
/// components, each made of alphanumerics joined by `.`, `_`, `__` or runs
/// of `-`.
pub fn is_valid_repository(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('/').all(is_valid_component)
}

fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let valid = separator == "."
            || separator == "_"
            || separator == "__"
            || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
    }
    true
}

/// Whether `tag` is a valid tag: up to 128 characters of `[A-Za-z0-9_.-]`,
/// not starting with `.` or `-`.
pub fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return false;
    }
    if !(bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_') {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}
