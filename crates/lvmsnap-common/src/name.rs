//! Logical volume name validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SnapError, SnapResult};

/// Substrings LVM reserves for its own hidden sub-volumes.
const RESERVED_SUBSTRINGS: &[&str] = &[
    "_cdata", "_cmeta", "_corig", "_mlog", "_mimage", "_pmspare", "_rimage", "_rmeta", "_tdata",
    "_tmeta", "_vorigin",
];

/// Prefixes LVM refuses for user-created volumes.
const RESERVED_PREFIXES: &[&str] = &["snapshot", "pvmove"];

/// A validated logical volume name.
///
/// Volume names must:
/// - Be 1-127 characters long
/// - Contain only `a-z A-Z 0-9 + _ . -`
/// - Not start with a hyphen, and not be `.` or `..`
/// - Avoid the names LVM reserves for internal volumes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    /// Maximum length of a volume name.
    pub const MAX_LENGTH: usize = 127;

    /// Create a new volume name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::InvalidVolumeName`] if LVM would reject the name.
    pub fn new(name: impl Into<String>) -> SnapResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> SnapResult<()> {
        let invalid = || SnapError::InvalidVolumeName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }
        if name == "." || name == ".." || name.starts_with('-') {
            return Err(invalid());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
        {
            return Err(invalid());
        }
        if RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
            || RESERVED_SUBSTRINGS.iter().any(|s| name.contains(s))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VolumeName {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VolumeName {
    type Error = SnapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeName> for String {
    fn from(name: VolumeName) -> Self {
        name.0
    }
}

impl AsRef<str> for VolumeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_volume_names() {
        assert!(VolumeName::new("1").is_ok());
        assert!(VolumeName::new("42").is_ok());
        assert!(VolumeName::new("contd-metadata-holder").is_ok());
        assert!(VolumeName::new("pool0").is_ok());
        assert!(VolumeName::new("a+b.c_d").is_ok());
    }

    #[test]
    fn invalid_volume_names() {
        assert!(VolumeName::new("").is_err());
        assert!(VolumeName::new("-lv").is_err());
        assert!(VolumeName::new(".").is_err());
        assert!(VolumeName::new("..").is_err());
        assert!(VolumeName::new("with space").is_err());
        assert!(VolumeName::new("vg/lv").is_err());
        assert!(VolumeName::new("snapshot1").is_err());
        assert!(VolumeName::new("data_tmeta").is_err());
        assert!(VolumeName::new("a".repeat(128)).is_err());
    }

    #[test]
    fn serde_validates() {
        let name: VolumeName = serde_json::from_str("\"17\"").unwrap();
        assert_eq!(name.as_str(), "17");
        assert!(serde_json::from_str::<VolumeName>("\"-bad\"").is_err());
    }
}
