//! Immutable per-invocation build context.

use crate::commit::CommitRange;
use crate::vars::VariableNamespace;
use crate::version::{ResolvedVersion, TagPattern, Version};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything the graph builder and scheduler need to know about one build
/// invocation. Constructed once, threaded explicitly, never mutated; the
/// same context yields the same graph locally and on a remote orchestrator.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Unique id of this invocation.
    pub build_id: Uuid,

    /// Branch being built, if known.
    pub branch: Option<String>,

    /// Commit range that produced the resolved version.
    pub range: CommitRange,

    /// Outcome of version resolution.
    pub resolved: ResolvedVersion,

    /// Tag rendering pattern from the configuration.
    pub tag_pattern: TagPattern,

    /// Last published version, if any.
    pub last_published: Option<Version>,

    /// Whether this invocation is allowed to publish.
    pub may_publish: bool,

    /// Pass-through environment variables, already resolved.
    pub environment: BTreeMap<String, String>,
}

impl BuildContext {
    /// Whether the resolved version differs from the last published one
    /// (the `new-version-only` gate).
    pub fn version_is_new(&self) -> bool {
        match &self.last_published {
            Some(published) => self.resolved.version != *published,
            None => true,
        }
    }

    /// The substitution namespace exposed to steps.
    pub fn variables(&self) -> VariableNamespace {
        let mut vars = self.environment.clone();
        vars.insert("VERSION".to_string(), self.resolved.version.to_string());
        vars.insert(
            "PURE_VERSION".to_string(),
            self.resolved.pure_version().to_string(),
        );
        vars.insert(
            "PUBLISH_VERSION".to_string(),
            self.resolved.publish_version(&self.tag_pattern),
        );
        vars.insert("GIT_COMMIT".to_string(), self.range.target.to_string());
        vars.insert(
            "GIT_BRANCH".to_string(),
            self.branch.clone().unwrap_or_default(),
        );
        VariableNamespace::new(vars)
    }
}
