//! Version model: semver-backed values, tag patterns, bump arithmetic.

pub mod bump;
pub mod hotfix;
pub mod resolve;

pub use bump::{BumpLevel, BumpPolicy, BumpPolicyKind};
pub use hotfix::{derive_id_from_branch, id_from_commit, validate_identifier, HotfixContext};
pub use resolve::{BranchPolicy, ResolvedVersion, VersionResolver};

use crate::error::{ConfigError, VersionError};
use serde::{Deserialize, Serialize};

/// Version format tag. Defines comparison and rendering rules.
///
/// Only SemVer 2.0 is supported today; the enum is closed so new formats are
/// an explicit, reviewed addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionFormat {
    #[default]
    Semver,
}

/// A version value with a format tag.
///
/// Backed by `semver::Version`; ordering is SemVer precedence with build
/// metadata as a deterministic tie-break, so versions of the same format are
/// totally ordered and a release always compares greater than any prerelease
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    inner: semver::Version,
    format: VersionFormat,
}

impl Version {
    /// A plain release version (no prerelease, no build metadata).
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            inner: semver::Version::new(major, minor, patch),
            format: VersionFormat::Semver,
        }
    }

    /// Parse a version string according to the given format.
    pub fn parse(input: &str, format: VersionFormat) -> Result<Self, VersionError> {
        match format {
            VersionFormat::Semver => semver::Version::parse(input.trim())
                .map(|inner| Version { inner, format })
                .map_err(|_| VersionError::InvalidVersion {
                    input: input.to_string(),
                }),
        }
    }

    pub fn format(&self) -> VersionFormat {
        self.format
    }

    pub fn major(&self) -> u64 {
        self.inner.major
    }

    pub fn minor(&self) -> u64 {
        self.inner.minor
    }

    pub fn patch(&self) -> u64 {
        self.inner.patch
    }

    /// Prerelease component, if any.
    pub fn prerelease(&self) -> Option<&str> {
        if self.inner.pre.is_empty() {
            None
        } else {
            Some(self.inner.pre.as_str())
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.inner.pre.is_empty()
    }

    /// Copy without build metadata (the "pure" version exposed to steps).
    pub fn pure(&self) -> Version {
        let mut inner = self.inner.clone();
        inner.build = semver::BuildMetadata::EMPTY;
        Version {
            inner,
            format: self.format,
        }
    }

    /// Copy with the given prerelease component.
    pub fn with_prerelease(&self, pre: &str) -> Result<Version, VersionError> {
        let pre = semver::Prerelease::new(pre).map_err(|_| VersionError::InvalidVersion {
            input: format!("{}-{}", self.inner, pre),
        })?;
        let mut inner = self.inner.clone();
        inner.pre = pre;
        Ok(Version {
            inner,
            format: self.format,
        })
    }

    /// Copy with the given build metadata.
    pub fn with_build(&self, build: &str) -> Result<Version, VersionError> {
        let build =
            semver::BuildMetadata::new(build).map_err(|_| VersionError::InvalidVersion {
                input: format!("{}+{}", self.inner, build),
            })?;
        let mut inner = self.inner.clone();
        inner.build = build;
        Ok(Version {
            inner,
            format: self.format,
        })
    }

    /// Release version after applying a bump level.
    ///
    /// Prerelease and build metadata are cleared; `BumpLevel::None` returns
    /// the value unchanged.
    pub fn bump(&self, level: BumpLevel) -> Version {
        let v = &self.inner;
        let inner = match level {
            BumpLevel::None => return self.clone(),
            BumpLevel::Patch => semver::Version::new(v.major, v.minor, v.patch + 1),
            BumpLevel::Minor => semver::Version::new(v.major, v.minor + 1, 0),
            BumpLevel::Major => semver::Version::new(v.major + 1, 0, 0),
        };
        Version {
            inner,
            format: self.format,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.cmp(&other.inner)
    }
}

/// Tag rendering pattern: literal text around a `{version}` placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPattern {
    prefix: String,
    suffix: String,
}

impl TagPattern {
    const PLACEHOLDER: &'static str = "{version}";

    /// Parse a pattern like `v{version}`; exactly one placeholder required.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        match pattern.split_once(Self::PLACEHOLDER) {
            Some((prefix, suffix)) if !suffix.contains(Self::PLACEHOLDER) => Ok(TagPattern {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
            _ => Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "expected exactly one {version} placeholder".to_string(),
            }),
        }
    }

    /// Render a version to its tag string.
    pub fn render(&self, version: &Version) -> String {
        format!("{}{}{}", self.prefix, version, self.suffix)
    }

    /// Parse a tag string back into a version.
    pub fn parse(&self, tag: &str, format: VersionFormat) -> Result<Version, VersionError> {
        let inner = tag
            .strip_prefix(&self.prefix)
            .and_then(|t| t.strip_suffix(&self.suffix))
            .ok_or_else(|| VersionError::InvalidTag {
                tag: tag.to_string(),
            })?;
        Version::parse(inner, format)
    }
}
