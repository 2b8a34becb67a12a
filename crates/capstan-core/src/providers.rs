//! Capability traits for external collaborators.
//!
//! The core never shells out or talks to infrastructure directly: source
//! control, command execution, and secret storage sit behind these traits
//! and are injected at the boundary. In-memory fakes live in [`crate::fakes`].

use crate::commit::{CommitId, CommitRange};
use crate::config::{CredentialType, VolumeSpec};
use crate::error::ProviderResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// SourceProvider
// ---------------------------------------------------------------------------

/// Ordered commit sequences and tree metadata from source control.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Current target commit.
    async fn head_commit(&self) -> ProviderResult<CommitId>;

    /// Most recent version tag reachable from the target, if any.
    async fn last_version_tag(&self) -> ProviderResult<Option<String>>;

    /// Raw (id, message) pairs between base (exclusive) and target
    /// (inclusive), oldest to newest. `None` base means full history.
    async fn commits_between(
        &self,
        base: Option<&CommitId>,
        target: &CommitId,
    ) -> ProviderResult<Vec<(CommitId, String)>>;

    /// Paths touched between two commits.
    async fn changed_paths(
        &self,
        base: &CommitId,
        target: &CommitId,
    ) -> ProviderResult<Vec<PathBuf>>;

    /// First commit unique to a lineage, walking the first-parent chain
    /// (leftmost candidate wins on diamond merges).
    async fn first_unique_commit(
        &self,
        branch_point: &CommitId,
        target: &CommitId,
    ) -> ProviderResult<CommitId>;

    /// Convenience: parsed commit range between base and target.
    async fn commit_range(
        &self,
        base: Option<&CommitId>,
        target: &CommitId,
    ) -> ProviderResult<CommitRange> {
        let raw = self.commits_between(base, target).await?;
        Ok(CommitRange::parse(base.cloned(), target.clone(), raw))
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Opaque handle for an allocated executor (node/worker identity).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeHandle {
    pub id: String,
    pub label: Option<String>,
}

/// One command execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    /// Fully substituted shell command.
    pub command: String,

    /// Container image to run in, if declared.
    pub image: Option<String>,

    pub volumes: Vec<VolumeSpec>,

    /// Environment for the command (variables, credentials).
    pub env: BTreeMap<String, String>,
}

/// Outcome of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on allocated executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Allocate an executor for a variant. Called once per variant per
    /// build; reuse is the allocator's concern.
    async fn allocate(&self, variant: &str, label: Option<&str>) -> ProviderResult<NodeHandle>;

    /// Run a command to completion and capture its output.
    async fn run(&self, node: &NodeHandle, request: ExecRequest) -> ProviderResult<ExecOutcome>;

    /// Expand an output glob pattern on the executor's filesystem.
    async fn collect(&self, node: &NodeHandle, pattern: &str) -> ProviderResult<Vec<PathBuf>>;

    /// Release an allocated executor.
    async fn release(&self, node: NodeHandle) -> ProviderResult<()>;
}

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

/// Materialized credential values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialValue {
    UsernamePassword { username: String, password: String },
    SecretText { text: String },
    File { path: PathBuf },
}

/// Resolves credential identifiers into secret values.
///
/// A missing identifier is an error; values are never silently replaced
/// with empty strings.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, id: &str, kind: CredentialType) -> ProviderResult<CredentialValue>;
}

// ---------------------------------------------------------------------------
// BuildObserver
// ---------------------------------------------------------------------------

/// Lifecycle hooks the scheduler invokes at well-defined points.
///
/// Host-specific behavior (pipeline UI updates, chat notifications, ...)
/// lives entirely behind this interface. All methods default to no-ops.
pub trait BuildObserver: Send + Sync {
    fn on_build_started(&self, _build_id: &str, _version: &str) {}
    fn on_build_finished(&self, _build_id: &str, _success: bool) {}
    fn on_phase_started(&self, _phase: &str) {}
    fn on_phase_finished(&self, _phase: &str, _success: bool) {}
    fn on_variant_started(&self, _phase: &str, _variant: &str, _node: &NodeHandle) {}
    fn on_variant_finished(&self, _phase: &str, _variant: &str, _success: bool) {}
    fn on_variant_skipped(&self, _phase: &str, _variant: &str) {}
    fn on_step_started(&self, _phase: &str, _variant: &str, _step: &str) {}
    fn on_step_finished(&self, _phase: &str, _variant: &str, _step: &str, _success: bool) {}
    fn on_node_allocated(&self, _variant: &str, _node: &NodeHandle) {}
    fn on_lock_acquired(&self, _name: &str) {}
    fn on_lock_released(&self, _name: &str) {}
}

/// Observer that does nothing.
#[derive(Debug, Default)]
pub struct NullObserver;

impl BuildObserver for NullObserver {}
