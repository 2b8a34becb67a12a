//! Hotfix lineages: identifier rules and per-identifier version counters.

use super::{BumpLevel, Version};
use crate::commit::CommitId;
use crate::error::VersionError;
use regex::Regex;

/// Identifier grammar: starts with a letter, ends with a letter or digit,
/// dots and dashes allowed in between.
const ID_FORMAT: &str = r"^[a-zA-Z][-.a-zA-Z0-9]*[a-zA-Z0-9]$";

/// Reserved pre-release keywords that would collide with common version
/// conventions (rc1, beta.2, dev0, ...).
const RESERVED: &str = r"^(a|b|c|rc|alpha|beta|pre|preview|post|rev|r|dev)[-.]?[0-9]*$";

/// Commit-hash shaped identifiers (`g` + hex), reserved for ids derived from
/// an actual commit hash.
const HASH_LIKE: &str = r"^g[0-9a-fA-F]+$";

/// Validate a hotfix identifier.
///
/// `from_commit_hash` marks identifiers produced by [`id_from_commit`], which
/// are allowed to look like `g<hex>`.
pub fn validate_identifier(id: &str, from_commit_hash: bool) -> Result<(), VersionError> {
    let invalid = |reason: &str| VersionError::InvalidHotfixIdentifier {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let format = Regex::new(ID_FORMAT).expect("identifier grammar is a valid regex");
    if !format.is_match(id) {
        return Err(invalid(
            "must start with a letter, end with a letter or digit, and contain only letters, digits, dots and dashes",
        ));
    }

    let reserved = Regex::new(RESERVED).expect("reserved keyword grammar is a valid regex");
    if reserved.is_match(id) {
        return Err(invalid("matches a reserved pre-release keyword"));
    }

    if !from_commit_hash {
        let hash_like = Regex::new(HASH_LIKE).expect("hash grammar is a valid regex");
        if hash_like.is_match(id) {
            return Err(invalid(
                "looks like a commit hash but was not derived from one",
            ));
        }
    }

    Ok(())
}

/// Default identifier for a hotfix lineage: `g` + the hash prefix of the
/// first commit unique to the lineage (first-parent chain).
pub fn id_from_commit(commit: &CommitId) -> String {
    format!("g{}", commit.short())
}

/// Derive an identifier from a branch name using a configured pattern.
///
/// The pattern must expose an `id` capture group. The derived value must not
/// merely restate the base version, and must satisfy the identifier grammar.
pub fn derive_id_from_branch(
    branch: &str,
    pattern: &Regex,
    base: &Version,
) -> Result<Option<String>, VersionError> {
    let caps = match pattern.captures(branch) {
        Some(caps) => caps,
        None => return Ok(None),
    };
    let id = match caps.name("id") {
        Some(m) => m.as_str().to_string(),
        None => return Ok(None),
    };

    let base_str = base.to_string();
    if id == base_str || id.strip_prefix('v') == Some(base_str.as_str()) {
        return Err(VersionError::InvalidHotfixIdentifier {
            id,
            reason: "restates the base version".to_string(),
        });
    }

    validate_identifier(&id, false)?;
    Ok(Some(id))
}

/// A hotfix lineage position: base version, identifier, monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotfixContext {
    pub base: Version,
    pub id: String,
    pub counter: u64,
}

impl HotfixContext {
    /// Context for the given counter; the identifier must already be valid.
    pub fn new(base: Version, id: impl Into<String>, counter: u64) -> Self {
        HotfixContext {
            base,
            id: id.into(),
            counter,
        }
    }

    /// First hotfix version for this identifier (counter 0).
    pub fn first(base: Version, id: impl Into<String>) -> Self {
        Self::new(base, id, 0)
    }

    /// Next counter position for the same identifier and base.
    pub fn next(&self) -> Self {
        Self::new(self.base.clone(), self.id.clone(), self.counter + 1)
    }

    /// The hotfix version: `{major}.{minor}.{patch+1}-hotfix.<id>.<counter>`.
    pub fn version(&self) -> Result<Version, VersionError> {
        self.base
            .bump(BumpLevel::Patch)
            .with_prerelease(&format!("hotfix.{}.{}", self.id, self.counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        for id in ["fuel-gauge", "ab", "issue.1234", "x1"] {
            assert!(validate_identifier(id, false).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_version_shaped_identifier_rejected() {
        // "1.2.3" duplicates the base version format; grammar forbids the
        // leading digit outright.
        assert!(matches!(
            validate_identifier("1.2.3", false),
            Err(VersionError::InvalidHotfixIdentifier { .. })
        ));
    }

    #[test]
    fn test_reserved_keywords_rejected() {
        for id in ["rc1", "beta.2", "alpha", "dev-3", "r0", "preview"] {
            assert!(
                validate_identifier(id, false).is_err(),
                "{id} should be reserved"
            );
        }
    }

    #[test]
    fn test_hash_like_rejected_unless_derived() {
        assert!(validate_identifier("gdeadbeef", false).is_err());
        assert!(validate_identifier("gdeadbeef", true).is_ok());
    }

    #[test]
    fn test_id_from_commit() {
        let id = id_from_commit(&CommitId::new("deadbeefcafe0123456789aa"));
        assert_eq!(id, "gdeadbeefca");
        assert!(validate_identifier(&id, true).is_ok());
    }

    #[test]
    fn test_derive_from_branch() {
        let pattern = Regex::new(r"^hotfix/(?P<id>.+)$").unwrap();
        let base = Version::new(1, 2, 3);
        let id = derive_id_from_branch("hotfix/fuel-gauge", &pattern, &base)
            .unwrap()
            .unwrap();
        assert_eq!(id, "fuel-gauge");
    }

    #[test]
    fn test_derive_rejects_base_restatement() {
        let pattern = Regex::new(r"^hotfix/(?P<id>.+)$").unwrap();
        let base = Version::new(1, 2, 3);
        assert!(derive_id_from_branch("hotfix/v1.2.3", &pattern, &base).is_err());
    }

    #[test]
    fn test_derive_without_match_falls_through() {
        let pattern = Regex::new(r"^hotfix/(?P<id>.+)$").unwrap();
        let base = Version::new(1, 2, 3);
        assert_eq!(
            derive_id_from_branch("feature/x", &pattern, &base).unwrap(),
            None
        );
    }

    #[test]
    fn test_hotfix_version_ordering() {
        let base = Version::new(1, 2, 3);
        let ctx = HotfixContext::first(base.clone(), "fuel");
        let hotfix = ctx.version().unwrap();

        // Strictly above the base, strictly below the next release.
        assert!(hotfix > base);
        assert!(hotfix < Version::new(1, 2, 4));
        assert_eq!(hotfix.to_string(), "1.2.4-hotfix.fuel.0");
    }

    #[test]
    fn test_counter_is_monotonic() {
        let ctx = HotfixContext::first(Version::new(1, 2, 3), "fuel");
        let first = ctx.version().unwrap();
        let second = ctx.next().version().unwrap();
        assert_eq!(ctx.next().counter, 1);
        assert!(second > first);
    }
}
