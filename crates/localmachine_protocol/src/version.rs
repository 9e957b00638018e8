//! Business versions of agent software.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` version, compared numerically.
///
/// Parsing accepts a leading `v` and missing trailing parts (`"2.1"` is
/// `2.1.0`). Anything after a `-` or `+` is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BusinessVersion {
    /// Major part.
    pub major: u32,
    /// Minor part.
    pub minor: u32,
    /// Patch part.
    pub patch: u32,
}

impl BusinessVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a version string.
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Err(ProtocolError::InvalidVersion(input.to_string()));
        }

        let mut parts = [0u32; 3];
        for (i, part) in core.split('.').enumerate() {
            if i >= parts.len() {
                return Err(ProtocolError::InvalidVersion(input.to_string()));
            }
            parts[i] = part
                .parse()
                .map_err(|_| ProtocolError::InvalidVersion(input.to_string()))?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl FromStr for BusinessVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BusinessVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for BusinessVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BusinessVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
