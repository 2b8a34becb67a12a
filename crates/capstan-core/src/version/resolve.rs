//! Version resolution: base version + bump policy + commit range.

use super::{BumpLevel, BumpPolicy, HotfixContext, TagPattern, Version};
use crate::commit::{CommitId, CommitRange};
use crate::error::VersionError;
use regex::Regex;
use tracing::{debug, info};

/// Which bump levels a branch accepts.
///
/// Hotfix and release lineages are patch-only; mainline branches are
/// unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPolicy {
    pub allow_major: bool,
    pub allow_minor: bool,
}

impl BranchPolicy {
    pub fn unrestricted() -> Self {
        BranchPolicy {
            allow_major: true,
            allow_minor: true,
        }
    }

    pub fn patch_only() -> Self {
        BranchPolicy {
            allow_major: false,
            allow_minor: false,
        }
    }

    fn check(&self, branch: &str, level: BumpLevel) -> Result<(), VersionError> {
        let forbidden = (level == BumpLevel::Major && !self.allow_major)
            || (level == BumpLevel::Minor && !self.allow_minor);
        if forbidden {
            return Err(VersionError::RestrictedChange {
                branch: branch.to_string(),
                required: level,
            });
        }
        Ok(())
    }
}

/// Outcome of a version resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// The version for this source state.
    pub version: Version,

    /// The base the resolution started from (last tag or initial version).
    pub base: Version,

    /// Bump level applied to the base. `None` means the base was returned
    /// unchanged.
    pub bump: BumpLevel,
}

impl ResolvedVersion {
    /// Version without build metadata, as exposed to steps as `PURE_VERSION`.
    pub fn pure_version(&self) -> Version {
        self.version.pure()
    }

    /// Tag-rendered version, as exposed to steps as `PUBLISH_VERSION`.
    pub fn publish_version(&self, pattern: &TagPattern) -> String {
        pattern.render(&self.version.pure())
    }

    /// Whether this resolution produced a version different from the base.
    pub fn is_new(&self) -> bool {
        self.bump != BumpLevel::None
    }
}

/// Computes the version for the current source state.
///
/// The same inputs always produce the same output: resolution never consults
/// the environment, so a local run and a remote orchestrator run agree.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    policy: BumpPolicy,
    branch_policy: BranchPolicy,
    branch: String,
}

impl VersionResolver {
    pub fn new(policy: BumpPolicy, branch_policy: BranchPolicy, branch: impl Into<String>) -> Self {
        VersionResolver {
            policy,
            branch_policy,
            branch: branch.into(),
        }
    }

    /// Resolve the version for a normal (non-hotfix) lineage.
    ///
    /// `base` is the last tagged version reachable from history; `initial`
    /// is the configured fallback when no tag exists. Neither present is
    /// `NoVersionFound`.
    pub fn resolve(
        &self,
        base: Option<Version>,
        initial: Option<Version>,
        range: &CommitRange,
    ) -> Result<ResolvedVersion, VersionError> {
        let base = base.or(initial).ok_or(VersionError::NoVersionFound)?;
        let bump = self.policy.range_level(range)?;
        self.branch_policy.check(&self.branch, bump)?;

        let version = base.bump(bump);
        if bump == BumpLevel::None {
            debug!(base = %base, "no semantically meaningful change, keeping base version");
        } else {
            info!(base = %base, version = %version, bump = %bump, "resolved version");
        }

        Ok(ResolvedVersion {
            version,
            base,
            bump,
        })
    }

    /// Resolve the version for a hotfix lineage.
    ///
    /// `base` is the version the hotfix branch split from. The identifier is
    /// derived from the branch name when `id_pattern` matches, otherwise from
    /// the first commit unique to the lineage (first-parent chain; on
    /// diamond merges the leftmost candidate wins, which the source provider
    /// guarantees). `prior_versions` is the count of existing hotfix versions
    /// with the same identifier and base.
    pub fn resolve_hotfix(
        &self,
        base: Version,
        range: &CommitRange,
        id_pattern: Option<&Regex>,
        first_unique: &CommitId,
        prior_versions: u64,
    ) -> Result<ResolvedVersion, VersionError> {
        let bump = self.policy.range_level(range)?;
        // Hotfix lineages never accept anything above a patch.
        BranchPolicy::patch_only().check(&self.branch, bump)?;

        let id = match id_pattern {
            Some(pattern) => super::derive_id_from_branch(&self.branch, pattern, &base)?,
            None => None,
        };
        let (id, from_hash) = match id {
            Some(id) => (id, false),
            None => (super::id_from_commit(first_unique), true),
        };
        super::validate_identifier(&id, from_hash)?;

        let ctx = HotfixContext::new(base.clone(), id, prior_versions);
        let version = ctx.version()?;
        info!(base = %base, version = %version, counter = ctx.counter, "resolved hotfix version");

        Ok(ResolvedVersion {
            version,
            base,
            bump: BumpLevel::Patch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitId;

    fn range(messages: &[&str]) -> CommitRange {
        let raw = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (CommitId::new(format!("{i:040x}")), m.to_string()))
            .collect();
        CommitRange::parse(None, CommitId::new("f".repeat(40)), raw)
    }

    fn resolver() -> VersionResolver {
        VersionResolver::new(
            BumpPolicy::default(),
            BranchPolicy::unrestricted(),
            "main",
        )
    }

    #[test]
    fn test_empty_range_returns_base_unchanged() {
        let base = Version::new(1, 2, 3);
        let resolved = resolver()
            .resolve(
                Some(base.clone()),
                None,
                &CommitRange::empty(CommitId::new("abc")),
            )
            .unwrap();
        assert_eq!(resolved.version, base);
        assert!(!resolved.is_new());
    }

    #[test]
    fn test_no_base_no_initial_is_an_error() {
        assert!(matches!(
            resolver().resolve(None, None, &range(&["fix: x"])),
            Err(VersionError::NoVersionFound)
        ));
    }

    #[test]
    fn test_initial_version_used_when_no_tag() {
        let resolved = resolver()
            .resolve(None, Some(Version::new(0, 1, 0)), &range(&["feat: start"]))
            .unwrap();
        assert_eq!(resolved.version, Version::new(0, 2, 0));
    }

    #[test]
    fn test_breaking_on_protected_branch_is_restricted() {
        let resolver = VersionResolver::new(
            BumpPolicy::default(),
            BranchPolicy::patch_only(),
            "release/1.2",
        );
        let err = resolver
            .resolve(Some(Version::new(1, 2, 3)), None, &range(&["feat!: boom"]))
            .unwrap_err();
        assert!(matches!(err, VersionError::RestrictedChange { .. }));
    }

    #[test]
    fn test_hotfix_resolution_with_default_identifier() {
        let resolver = VersionResolver::new(
            BumpPolicy::default(),
            BranchPolicy::patch_only(),
            "hotfix/unnamed",
        );
        let resolved = resolver
            .resolve_hotfix(
                Version::new(2, 0, 0),
                &range(&["fix: urgent"]),
                None,
                &CommitId::new("deadbeef00112233"),
                0,
            )
            .unwrap();
        assert_eq!(resolved.version.to_string(), "2.0.1-hotfix.gdeadbeef00.0");
        assert!(resolved.version > Version::new(2, 0, 0));
        assert!(resolved.version < Version::new(2, 0, 1));
    }

    #[test]
    fn test_hotfix_identifier_from_branch_pattern() {
        let resolver = VersionResolver::new(
            BumpPolicy::default(),
            BranchPolicy::patch_only(),
            "hotfix/fuel-gauge",
        );
        let pattern = Regex::new(r"^hotfix/(?P<id>.+)$").unwrap();
        let resolved = resolver
            .resolve_hotfix(
                Version::new(2, 0, 0),
                &range(&["fix: urgent"]),
                Some(&pattern),
                &CommitId::new("deadbeef"),
                1,
            )
            .unwrap();
        assert_eq!(resolved.version.to_string(), "2.0.1-hotfix.fuel-gauge.1");
    }

    #[test]
    fn test_hotfix_rejects_minor_change() {
        let resolver = VersionResolver::new(
            BumpPolicy::default(),
            BranchPolicy::patch_only(),
            "hotfix/x",
        );
        assert!(matches!(
            resolver.resolve_hotfix(
                Version::new(2, 0, 0),
                &range(&["feat: nope"]),
                None,
                &CommitId::new("deadbeef"),
                0,
            ),
            Err(VersionError::RestrictedChange { .. })
        ));
    }

    #[test]
    fn test_publish_version_uses_tag_pattern() {
        let resolved = resolver()
            .resolve(Some(Version::new(1, 0, 0)), None, &range(&["fix: x"]))
            .unwrap();
        let pattern = TagPattern::new("v{version}").unwrap();
        assert_eq!(resolved.publish_version(&pattern), "v1.0.1");
    }
}
