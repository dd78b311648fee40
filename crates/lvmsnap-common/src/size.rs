//! Human-readable byte sizes.
//!
//! Units follow LVM, where every suffix is a power of 1024:
//! - "10G", "512m", "1.5g"
//! - "1Gi", "128MiB", "4KB"
//! - Plain byte counts: "4096"

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SnapError, SnapResult};

const KI: u64 = 1024;
const MI: u64 = KI * 1024;
const GI: u64 = MI * 1024;
const TI: u64 = GI * 1024;
const PI: u64 = TI * 1024;

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create a size from a byte count.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from gibibytes.
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * GI)
    }

    /// Get the raw byte count.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a human-readable size.
    ///
    /// Units are case-insensitive and binary, so `10G` is 10 GiB as
    /// `lvcreate` reads it. An `i` and a `B` suffix are optional.
    /// Whitespace between number and unit is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::InvalidSize`] for empty, negative or unparsable
    /// values.
    pub fn parse(s: &str) -> SnapResult<Self> {
        let invalid = || SnapError::InvalidSize {
            value: s.to_string(),
        };

        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }

        let unit = unit.trim().to_ascii_lowercase();
        let unit = unit.strip_suffix('b').unwrap_or(&unit);
        let unit = unit.strip_suffix('i').unwrap_or(unit);
        let multiplier = match unit {
            "" => 1,
            "k" => KI,
            "m" => MI,
            "g" => GI,
            "t" => TI,
            "p" => PI,
            _ => return Err(invalid()),
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(Self)
                .ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(invalid());
        }
        Ok(Self(bytes as u64))
    }

    /// Size argument in the form LVM tools accept (`<bytes>b`).
    #[must_use]
    pub fn to_lvm_arg(&self) -> String {
        format!("{}b", self.0)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(PI, "P"), (TI, "T"), (GI, "G"), (MI, "M"), (KI, "k")];
        for (multiplier, suffix) in units {
            if self.0 >= multiplier && self.0 % multiplier == 0 {
                return write!(f, "{}{}", self.0 / multiplier, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ByteSize {
    type Error = SnapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_follows_lvm_units() {
        assert_eq!(ByteSize::parse("10G").unwrap().as_bytes(), 10 * GI);
        assert_eq!(ByteSize::parse("10g").unwrap().as_bytes(), 10_737_418_240);
        assert_eq!(ByteSize::parse("10GB").unwrap().as_bytes(), 10 * GI);
        assert_eq!(ByteSize::parse("512M").unwrap().as_bytes(), 512 * MI);
        assert_eq!(ByteSize::parse("1k").unwrap().as_bytes(), 1024);
    }

    #[test]
    fn explicit_binary_suffix_is_accepted() {
        assert_eq!(ByteSize::parse("1Ki").unwrap().as_bytes(), 1024);
        assert_eq!(ByteSize::parse("128MiB").unwrap().as_bytes(), 128 * MI);
        assert_eq!(ByteSize::parse("2gi").unwrap(), ByteSize::parse("2G").unwrap());
    }

    #[test]
    fn parse_fractional_and_spaced() {
        assert_eq!(ByteSize::parse("1.5G").unwrap().as_bytes(), 1_610_612_736);
        assert_eq!(ByteSize::parse(" 20 MB ").unwrap().as_bytes(), 20 * MI);
    }

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(ByteSize::parse("4096").unwrap().as_bytes(), 4096);
        assert_eq!(ByteSize::parse("4096b").unwrap().as_bytes(), 4096);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ByteSize::parse("").is_err());
        assert!(ByteSize::parse("G").is_err());
        assert!(ByteSize::parse("-1G").is_err());
        assert!(ByteSize::parse("10X").is_err());
        assert!(ByteSize::parse("10iG").is_err());
        assert!(ByteSize::parse("1.2.3G").is_err());
        assert!(ByteSize::parse("99999999999P").is_err());
    }

    #[test]
    fn display_and_lvm_arg() {
        assert_eq!(ByteSize::gibibytes(10).to_string(), "10G");
        assert_eq!(ByteSize::bytes(1500).to_string(), "1500");
        assert_eq!(ByteSize::bytes(2 * MI).to_string(), "2M");
        assert_eq!(ByteSize::bytes(2_000_000).to_string(), "2000000");
        assert_eq!(ByteSize::gibibytes(10).to_lvm_arg(), "10737418240b");
    }

    proptest! {
        #[test]
        fn display_reparses(bytes in 0u64..=u64::MAX / 2) {
            let size = ByteSize::bytes(bytes);
            prop_assert_eq!(ByteSize::parse(&size.to_string()).unwrap(), size);
        }
    }
}
