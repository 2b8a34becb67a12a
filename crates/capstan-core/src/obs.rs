//! Structured observability hooks for build lifecycle events.
//!
//! This module provides:
//! - Build-scoped tracing spans via the `BuildSpan` RAII guard
//! - Emission functions for key lifecycle events: build, phase, variant,
//!   lock and allocation transitions
//!
//! Events are emitted at `info!` level (configurable via `CAPSTAN_LOG`).
//! For JSON output, set `CAPSTAN_LOG_FORMAT=json`.

use tracing::info;

/// RAII guard that enters a build-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = BuildSpan::enter("build-12345");
/// // All tracing calls are now associated with build_id = "build-12345"
/// ```
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    /// Create and enter a span tagged with the build id.
    pub fn enter(build_id: &str) -> Self {
        let span = tracing::info_span!("capstan.build", build_id = %build_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: build started with resolved version.
pub fn emit_build_started(build_id: &str, version: &str, branch: Option<&str>) {
    info!(
        event = "build.started",
        build_id = %build_id,
        version = %version,
        branch = branch.unwrap_or(""),
    );
}

/// Emit event: build finished with duration and success status.
pub fn emit_build_finished(build_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: execution graph constructed, with its config digest.
pub fn emit_graph_built(build_id: &str, config_digest: &str, phases: usize) {
    info!(
        event = "graph.built",
        build_id = %build_id,
        config_digest = %config_digest,
        phases = phases,
    );
}

/// Emit event: phase started.
pub fn emit_phase_started(phase: &str) {
    info!(event = "phase.started", phase = %phase);
}

/// Emit event: phase finished.
pub fn emit_phase_finished(phase: &str, success: bool) {
    info!(event = "phase.finished", phase = %phase, success = success);
}

/// Emit event: variant finished within a phase.
pub fn emit_variant_finished(phase: &str, variant: &str, success: bool) {
    info!(
        event = "variant.finished",
        phase = %phase,
        variant = %variant,
        success = success,
    );
}

/// Emit event: executor allocated for a variant.
pub fn emit_node_allocated(variant: &str, node_id: &str) {
    info!(event = "node.allocated", variant = %variant, node_id = %node_id);
}

/// Emit event: named lock acquired.
pub fn emit_lock_acquired(name: &str) {
    info!(event = "lock.acquired", name = %name);
}

/// Emit event: named lock released.
pub fn emit_lock_released(name: &str) {
    info!(event = "lock.released", name = %name);
}
