//! Version numbers and the sentinels used before a version is assigned.
//!
//! Only concrete integers ever reach the disk. `Default` and `Next` are
//! conveniences for writers and must be flattened by the ledger first.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexError;

/// Concrete value of the DEFAULT version; the first version of every store.
pub const DEFAULT_VERSION: u32 = 0;

/// Directory name reserved for the DEFAULT version.
pub const DEFAULT_FOLDER: &str = "v_default";

const DEFAULT_TOKEN: &str = "default";
const NEXT_TOKEN: &str = "next";

/// A version as requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// A concrete, persisted version number.
    Number(u32),
    /// The starting version, used for auto-generated state-initialization artifacts.
    Default,
    /// One past the current maximum, resolved when the write happens.
    Next,
}

impl Version {
    /// Parses a version token: a non-negative integer, `default` or `next`.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidVersion` for anything else.
    pub fn parse(value: &str) -> Result<Self, IndexError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case(DEFAULT_TOKEN) {
            return Ok(Self::Default);
        }
        if trimmed.eq_ignore_ascii_case(NEXT_TOKEN) {
            return Ok(Self::Next);
        }
        trimmed
            .parse::<u32>()
            .map(Self::Number)
            .map_err(|_| IndexError::invalid_version(value))
    }

    /// Returns the concrete number, failing for an unflattened sentinel.
    ///
    /// Reaching the error branch means a caller skipped flattening, so the
    /// error is reported as a defect.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidVersion` for `Default` and `Next`.
    pub fn require_concrete(self) -> Result<u32, IndexError> {
        match self {
            Self::Number(n) => Ok(n),
            other => Err(IndexError::invalid_version(format!("unflattened {other}"))),
        }
    }

    /// Resolves the version without consulting a ledger. `Next` has no such value.
    #[must_use]
    pub const fn resolved(self) -> Option<u32> {
        match self {
            Self::Number(n) => Some(n),
            Self::Default => Some(DEFAULT_VERSION),
            Self::Next => None,
        }
    }

    /// Returns true for `Default` and for the concrete DEFAULT number.
    #[must_use]
    pub const fn is_default(self) -> bool {
        matches!(self, Self::Default | Self::Number(DEFAULT_VERSION))
    }

    /// Returns true if this version is a sentinel that still needs flattening.
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        matches!(self, Self::Default | Self::Next)
    }
}

impl From<u32> for Version {
    fn from(n: u32) -> Self {
        Self::Number(n)
    }
}

impl TryFrom<i64> for Version {
    type Error = IndexError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map(Self::Number)
            .map_err(|_| IndexError::invalid_version(value))
    }
}

impl FromStr for Version {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Default => f.write_str(DEFAULT_TOKEN),
            Self::Next => f.write_str(NEXT_TOKEN),
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_u32(*n),
            Self::Default => serializer.serialize_str(DEFAULT_TOKEN),
            Self::Next => serializer.serialize_str(NEXT_TOKEN),
        }
    }
}

struct VersionVisitor;

impl<'de> Visitor<'de> for VersionVisitor {
    type Value = Version;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer, \"default\" or \"next\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        u32::try_from(v)
            .map(Version::Number)
            .map_err(|_| E::custom(IndexError::invalid_version(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Version::try_from(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Version::parse(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Directory name for a concrete version: `v_default` for DEFAULT, else `v_NNNN`.
#[must_use]
pub fn folder_name(version: u32) -> String {
    if version == DEFAULT_VERSION {
        DEFAULT_FOLDER.to_string()
    } else {
        format!("v_{version:04}")
    }
}

fn folder_regex() -> &'static Regex {
    static FOLDER: OnceLock<Regex> = OnceLock::new();
    FOLDER.get_or_init(|| {
        Regex::new(r"^v_(?:(?P<num>\d{4,})|default)$").expect("version folder pattern compiles")
    })
}

/// Parses a version directory name. Returns `None` for anything else.
///
/// DEFAULT is only ever stored in `v_default`; a numbered folder such as
/// `v_0000` is not a version directory.
#[must_use]
pub fn parse_folder_name(name: &str) -> Option<u32> {
    let caps = folder_regex().captures(name)?;
    match caps.name("num") {
        Some(num) => num
            .as_str()
            .parse()
            .ok()
            .filter(|version| *version != DEFAULT_VERSION),
        None => Some(DEFAULT_VERSION),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(Version::parse("7").unwrap(), Version::Number(7));
        assert_eq!(Version::parse(" default ").unwrap(), Version::Default);
        assert_eq!(Version::parse("NEXT").unwrap(), Version::Next);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["-1", "1.5", "", "latest", "v_0001"] {
            let err = Version::parse(bad).unwrap_err();
            assert!(matches!(err, IndexError::InvalidVersion { .. }), "{bad}");
        }
    }

    #[test]
    fn test_try_from_negative() {
        assert!(Version::try_from(-1i64).is_err());
        assert_eq!(Version::try_from(12i64).unwrap(), Version::Number(12));
    }

    #[test]
    fn test_require_concrete() {
        assert_eq!(Version::Number(3).require_concrete().unwrap(), 3);
        assert!(Version::Default.require_concrete().is_err());
        assert!(Version::Next.require_concrete().is_err());
    }

    #[test]
    fn test_resolved() {
        assert_eq!(Version::Default.resolved(), Some(DEFAULT_VERSION));
        assert_eq!(Version::Next.resolved(), None);
        assert!(Version::Number(DEFAULT_VERSION).is_default());
    }

    #[test]
    fn test_serde_forms() {
        assert_eq!(serde_json::to_string(&Version::Number(4)).unwrap(), "4");
        let v: Version = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(v, Version::Default);
        let v: Version = serde_json::from_str("9").unwrap();
        assert_eq!(v, Version::Number(9));
        assert!(serde_json::from_str::<Version>("-2").is_err());
        assert!(serde_json::from_str::<Version>("\"soon\"").is_err());
    }

    #[test]
    fn test_folder_names() {
        assert_eq!(folder_name(0), "v_default");
        assert_eq!(folder_name(3), "v_0003");
        assert_eq!(folder_name(12345), "v_12345");
    }

    #[test]
    fn test_parse_folder_names() {
        assert_eq!(parse_folder_name("v_default"), Some(0));
        assert_eq!(parse_folder_name("v_0003"), Some(3));
        assert_eq!(parse_folder_name("v_0000"), None);
        assert_eq!(parse_folder_name("v_00000"), None);
        assert_eq!(parse_folder_name("v_4294967295"), Some(u32::MAX));
        assert_eq!(parse_folder_name("v_4294967296"), None);
        assert_eq!(parse_folder_name("v_12345"), Some(12345));
        assert_eq!(parse_folder_name("v_12"), None);
        assert_eq!(parse_folder_name("v_0003.tmp"), None);
        assert_eq!(parse_folder_name("CalibrationIndex.json"), None);
    }
}
