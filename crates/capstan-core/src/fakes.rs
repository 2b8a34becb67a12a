//! In-memory fakes for the capability traits (testing only).
//!
//! `FakeSource`, `FakeExecutor`, `MemorySecretStore`, and
//! `RecordingObserver` satisfy the trait contracts without any external
//! dependencies.

use crate::commit::CommitId;
use crate::config::CredentialType;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::{
    BuildObserver, CredentialValue, ExecOutcome, ExecRequest, Executor, NodeHandle, SecretStore,
    SourceProvider,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

/// Scripted source provider.
#[derive(Debug, Default)]
pub struct FakeSource {
    pub head: Option<CommitId>,
    pub tag: Option<String>,
    pub commits: Vec<(CommitId, String)>,
    pub changed: Vec<PathBuf>,
    pub first_unique: Option<CommitId>,
}

impl FakeSource {
    pub fn new(head: &str) -> Self {
        FakeSource {
            head: Some(CommitId::new(head)),
            ..FakeSource::default()
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_commit(mut self, id: &str, message: &str) -> Self {
        self.commits.push((CommitId::new(id), message.to_string()));
        self
    }

    pub fn with_changed(mut self, path: &str) -> Self {
        self.changed.push(PathBuf::from(path));
        self
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn head_commit(&self) -> ProviderResult<CommitId> {
        self.head
            .clone()
            .ok_or_else(|| ProviderError::Source("no head configured".to_string()))
    }

    async fn last_version_tag(&self) -> ProviderResult<Option<String>> {
        Ok(self.tag.clone())
    }

    async fn commits_between(
        &self,
        _base: Option<&CommitId>,
        _target: &CommitId,
    ) -> ProviderResult<Vec<(CommitId, String)>> {
        Ok(self.commits.clone())
    }

    async fn changed_paths(
        &self,
        _base: &CommitId,
        _target: &CommitId,
    ) -> ProviderResult<Vec<PathBuf>> {
        Ok(self.changed.clone())
    }

    async fn first_unique_commit(
        &self,
        _branch_point: &CommitId,
        target: &CommitId,
    ) -> ProviderResult<CommitId> {
        Ok(self
            .first_unique
            .clone()
            .unwrap_or_else(|| target.clone()))
    }
}

// ---------------------------------------------------------------------------
// FakeExecutor
// ---------------------------------------------------------------------------

/// Executor that records every request and scripts failures by command
/// substring. Commands containing `fail_marker` exit nonzero.
#[derive(Debug)]
pub struct FakeExecutor {
    counter: AtomicU64,
    fail_marker: Option<String>,
    allocations: Mutex<Vec<String>>,
    runs: Mutex<Vec<(String, ExecRequest)>>,
    artifacts: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        FakeExecutor {
            counter: AtomicU64::new(0),
            fail_marker: None,
            allocations: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            artifacts: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `marker` will exit with code 1.
    pub fn failing_on(marker: &str) -> Self {
        FakeExecutor {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    /// Script the result of an artifact pattern expansion.
    pub fn with_artifacts(self, pattern: &str, paths: &[&str]) -> Self {
        self.artifacts
            .lock()
            .unwrap()
            .insert(pattern.to_string(), paths.iter().map(PathBuf::from).collect());
        self
    }

    /// Variants that requested an allocation, in order.
    pub fn allocations(&self) -> Vec<String> {
        self.allocations.lock().unwrap().clone()
    }

    /// (node id, request) pairs, in execution order.
    pub fn runs(&self) -> Vec<(String, ExecRequest)> {
        self.runs.lock().unwrap().clone()
    }

    /// Commands executed, in order.
    pub fn commands(&self) -> Vec<String> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.command.clone())
            .collect()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn allocate(&self, variant: &str, label: Option<&str>) -> ProviderResult<NodeHandle> {
        self.allocations.lock().unwrap().push(variant.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(NodeHandle {
            id: format!("node-{n}"),
            label: label.map(str::to_string),
        })
    }

    async fn run(&self, node: &NodeHandle, request: ExecRequest) -> ProviderResult<ExecOutcome> {
        let fails = self
            .fail_marker
            .as_deref()
            .is_some_and(|marker| request.command.contains(marker));
        self.runs
            .lock()
            .unwrap()
            .push((node.id.clone(), request.clone()));
        Ok(ExecOutcome {
            exit_code: if fails { 1 } else { 0 },
            stdout: format!("ran: {}", request.command),
            stderr: String::new(),
        })
    }

    async fn collect(&self, _node: &NodeHandle, pattern: &str) -> ProviderResult<Vec<PathBuf>> {
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(pattern)
            .cloned()
            .unwrap_or_default())
    }

    async fn release(&self, _node: NodeHandle) -> ProviderResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySecretStore
// ---------------------------------------------------------------------------

/// Secret store backed by a `HashMap<id, value>`.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, CredentialValue>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, value: CredentialValue) {
        self.secrets.lock().unwrap().insert(id.to_string(), value);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn resolve(&self, id: &str, kind: CredentialType) -> ProviderResult<CredentialValue> {
        let secrets = self.secrets.lock().unwrap();
        let value = secrets
            .get(id)
            .ok_or_else(|| ProviderError::CredentialNotFound { id: id.to_string() })?;

        let matches = matches!(
            (kind, value),
            (
                CredentialType::UsernamePassword,
                CredentialValue::UsernamePassword { .. }
            ) | (CredentialType::SecretText, CredentialValue::SecretText { .. })
                | (CredentialType::File, CredentialValue::File { .. })
        );
        if !matches {
            return Err(ProviderError::CredentialNotFound { id: id.to_string() });
        }
        Ok(value.clone())
    }
}

// ---------------------------------------------------------------------------
// RecordingObserver
// ---------------------------------------------------------------------------

/// Observer capturing an ordered event log for assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl BuildObserver for RecordingObserver {
    fn on_build_started(&self, _build_id: &str, version: &str) {
        self.push(format!("build.started {version}"));
    }

    fn on_build_finished(&self, _build_id: &str, success: bool) {
        self.push(format!("build.finished {success}"));
    }

    fn on_phase_started(&self, phase: &str) {
        self.push(format!("phase.started {phase}"));
    }

    fn on_phase_finished(&self, phase: &str, success: bool) {
        self.push(format!("phase.finished {phase} {success}"));
    }

    fn on_variant_started(&self, phase: &str, variant: &str, node: &NodeHandle) {
        self.push(format!("variant.started {phase}/{variant} on {}", node.id));
    }

    fn on_variant_finished(&self, phase: &str, variant: &str, success: bool) {
        self.push(format!("variant.finished {phase}/{variant} {success}"));
    }

    fn on_variant_skipped(&self, phase: &str, variant: &str) {
        self.push(format!("variant.skipped {phase}/{variant}"));
    }

    fn on_step_started(&self, phase: &str, variant: &str, step: &str) {
        self.push(format!("step.started {phase}/{variant}/{step}"));
    }

    fn on_step_finished(&self, phase: &str, variant: &str, step: &str, success: bool) {
        self.push(format!("step.finished {phase}/{variant}/{step} {success}"));
    }

    fn on_node_allocated(&self, variant: &str, node: &NodeHandle) {
        self.push(format!("node.allocated {variant} {}", node.id));
    }

    fn on_lock_acquired(&self, name: &str) {
        self.push(format!("lock.acquired {name}"));
    }

    fn on_lock_released(&self, name: &str) {
        self.push(format!("lock.released {name}"));
    }
}
