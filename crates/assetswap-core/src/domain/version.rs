//! OS version parsed from the device's `ProductVersion`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `major.minor[.patch]`。欠けた要素は 0 として扱う。
///
/// フィールド順に `Ord` を derive しているので、そのまま大小比較できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid OS version {input:?}: {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: &'static str,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for OsVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| VersionParseError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(err("empty"));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in trimmed.split('.') {
            if count == parts.len() {
                return Err(err("more than three components"));
            }
            parts[count] = piece.parse().map_err(|_| err("non-numeric component"))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("17", OsVersion::new(17, 0, 0))]
    #[case("16.5", OsVersion::new(16, 5, 0))]
    #[case("17.0.1", OsVersion::new(17, 0, 1))]
    #[case(" 18.2 ", OsVersion::new(18, 2, 0))]
    fn parses_partial_versions(#[case] input: &str, #[case] expected: OsVersion) {
        assert_eq!(input.parse::<OsVersion>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("seventeen")]
    #[case("17.a")]
    #[case("1.2.3.4")]
    #[case("17..1")]
    fn rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<OsVersion>().is_err());
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let v9: OsVersion = "9.3".parse().unwrap();
        let v16: OsVersion = "16.5".parse().unwrap();
        let v17: OsVersion = "17.0".parse().unwrap();
        assert!(v9 < v16);
        assert!(v16 < v17);
        assert!(OsVersion::new(17, 0, 1) > v17);
    }
}
