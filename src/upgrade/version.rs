//! Firmware version parsing and comparison.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// `major.minor.patch` triple.
///
/// Ordering is lexicographic over the three components. Pre-release and
/// build suffixes are accepted when parsing but do not take part in the
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTriple {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl VersionTriple {
    /// Construct from components.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `"1.2.3"`, `"v1.2.3"`, `"1.2.3-rc.1"` or `"2024.01.15"`.
    ///
    /// Components are plain decimal integers, so leading zeros are
    /// accepted. A `-pre` or `+build` suffix must be well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedVersion`] unless the string holds exactly
    /// three numeric components.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedVersion(s.to_string());

        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let (core, build) = match trimmed.split_once('+') {
            Some((core, build)) => (core, Some(build)),
            None => (trimmed, None),
        };
        let (core, pre) = match core.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (core, None),
        };
        if let Some(pre) = pre {
            semver::Prerelease::new(pre).map_err(|_| malformed())?;
        }
        if let Some(build) = build {
            semver::BuildMetadata::new(build).map_err(|_| malformed())?;
        }

        let mut parts = core.split('.').map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            part.parse::<u64>().map_err(|_| malformed())
        });
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        Ok(Self::new(major?, minor?, patch?))
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compare two version strings.
///
/// `Ordering::Less` means `a` is older than `b`; `ordering as i8` gives the
/// conventional -1/0/1.
///
/// # Errors
///
/// Returns [`Error::MalformedVersion`] naming the first operand that fails
/// to parse.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    let a = VersionTriple::parse(a)?;
    let b = VersionTriple::parse(b)?;
    Ok(a.cmp(&b))
}

/// Whether `candidate` is strictly newer than `current`.
///
/// # Errors
///
/// Returns [`Error::MalformedVersion`] if either string fails to parse.
pub fn is_newer(current: &str, candidate: &str) -> Result<bool> {
    Ok(compare(current, candidate)? == Ordering::Less)
}
