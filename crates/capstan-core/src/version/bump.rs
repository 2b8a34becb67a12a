//! Bump policy: how a commit range translates into a version increment.

use crate::commit::{Commit, CommitMessage, CommitRange};
use crate::error::VersionError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Version increment implied by a commit or a commit range.
///
/// Ordered so the level for a whole range is the maximum level observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpLevel {
    None,
    Patch,
    Minor,
    Major,
}

impl std::fmt::Display for BumpLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BumpLevel::None => "none",
            BumpLevel::Patch => "patch",
            BumpLevel::Minor => "minor",
            BumpLevel::Major => "major",
        };
        write!(f, "{s}")
    }
}

/// Commit-classification scheme the policy applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BumpPolicyKind {
    #[default]
    ConventionalCommits,
}

/// Rules deciding which bump level a commit range implies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BumpPolicy {
    /// Classification scheme; conventional commits is the only one.
    #[serde(default)]
    pub policy: BumpPolicyKind,

    /// Reject unparseable commit messages instead of treating them as no-ops.
    #[serde(default)]
    pub strict: bool,

    /// Force at least a patch bump when the range is non-empty, even if no
    /// commit carries a semantically meaningful change.
    #[serde(default)]
    pub on_every_change: bool,
}

impl BumpPolicy {
    /// Classify a single commit.
    ///
    /// Breaking changes are `Major` regardless of type; `feat` is `Minor`,
    /// `fix` is `Patch`, anything else is `None`. Unparseable messages are a
    /// hard error in strict mode, otherwise `None` with a warning.
    pub fn classify(&self, commit: &Commit) -> Result<BumpLevel, VersionError> {
        match &commit.message {
            CommitMessage::Conventional(c) => {
                if c.breaking {
                    Ok(BumpLevel::Major)
                } else {
                    Ok(match c.type_tag.as_str() {
                        "feat" => BumpLevel::Minor,
                        "fix" => BumpLevel::Patch,
                        _ => BumpLevel::None,
                    })
                }
            }
            CommitMessage::Unparseable(_) => {
                if self.strict {
                    Err(VersionError::InvalidBumpInRange {
                        commit: commit.id.short().to_string(),
                    })
                } else {
                    warn!(commit = %commit.id.short(), "commit message is not a conventional commit, ignoring for bump");
                    Ok(BumpLevel::None)
                }
            }
        }
    }

    /// Effective bump level for a whole range, oldest to newest.
    pub fn range_level(&self, range: &CommitRange) -> Result<BumpLevel, VersionError> {
        let mut level = BumpLevel::None;
        for commit in range.commits() {
            level = level.max(self.classify(commit)?);
        }
        if level == BumpLevel::None && self.on_every_change && !range.is_empty() {
            level = BumpLevel::Patch;
        }
        Ok(level)
    }
}
