//! # Version Comparison
//!
//! Semantic version ordering used to sort the catalog, filter outstanding
//! routines and decide whether the persisted version marker may advance.
//!
//! Parsing is deliberately loose about *shape* but strict about *content*:
//!
//! * Surrounding whitespace and a leading `v` are ignored
//! * Partial versions are zero padded (`1` → `1.0.0`, `1.2` → `1.2.0`)
//! * Pre-release and build suffixes follow regular semver rules
//!
//! Anything else is a [`VersionError::Malformed`].
//!
//! ```rust
//! use std::cmp::Ordering;
//! use switchy_upgrade::version::{Version, compare};
//!
//! assert_eq!(compare("1.2", "1.2.0").unwrap(), Ordering::Equal);
//! assert_eq!(compare("1.10.0", "1.9.9").unwrap(), Ordering::Greater);
//!
//! let version: Version = "v2.0".parse().unwrap();
//! assert_eq!(version.to_string(), "2.0");
//! ```

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Malformed version '{0}'")]
    Malformed(String),
}

/// A comparable version that remembers how it was written.
///
/// Equality and ordering only consider the parsed semver value, so `1.1` and
/// `1.1.0` are the same version. [`fmt::Display`] renders the registered text so
/// markers are persisted exactly as routines were registered.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    parsed: semver::Version,
}

impl Version {
    /// `0.0.0`: the floor that every registered version is greater than.
    pub const SENTINEL: &'static str = "0.0.0";

    /// # Errors
    ///
    /// * If `value` is not a loose semantic version
    pub fn parse(value: &str) -> Result<Self, VersionError> {
        let raw = value.trim();
        let unprefixed = raw
            .strip_prefix('v')
            .or_else(|| raw.strip_prefix('V'))
            .unwrap_or(raw);

        let (core, suffix) = unprefixed
            .find(['-', '+'])
            .map_or((unprefixed, ""), |idx| unprefixed.split_at(idx));

        let parts = core.split('.').collect::<Vec<_>>();

        if core.is_empty()
            || parts.len() > 3
            || parts
                .iter()
                .any(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(VersionError::Malformed(value.to_string()));
        }

        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(suffix);

        let parsed = semver::Version::parse(&padded)
            .map_err(|_| VersionError::Malformed(value.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            parsed,
        })
    }

    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            raw: Self::SENTINEL.to_string(),
            parsed: semver::Version::new(0, 0, 0),
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.parsed == semver::Version::new(0, 0, 0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub const fn semver(&self) -> &semver::Version {
        &self.parsed
    }
}

/// Compare two version strings with semver precedence.
///
/// # Errors
///
/// * If either side is malformed
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Version {
    type Error = VersionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
