//! Execution graph construction.
//!
//! Consumes the validated configuration and the resolved version, producing
//! a phase-ordered, variant-parallel graph with gating already applied and
//! version-derived variables substituted. The graph is immutable: built once
//! per invocation, read concurrently, discarded at process exit.

use crate::locks::LockKey;
use capstan_core::config::{
    ArchiveSpec, BuildConfig, CredentialRef, RunOnChange, StepConfig, VolumeSpec,
};
use capstan_core::{BuildContext, ConfigError, GraphError, VariableNamespace};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A step with substitutions applied, ready to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub name: String,
    pub command: String,
    pub image: Option<String>,
    pub volumes: Vec<VolumeSpec>,

    /// Full variable environment for the step, including per-commit
    /// variables for range-expanded instances.
    pub env: BTreeMap<String, String>,

    pub credentials: Vec<CredentialRef>,
    pub timeout: Option<u64>,
    pub archive: Option<ArchiveSpec>,
    pub junit: Vec<String>,
}

/// A variant resolved for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVariant {
    pub name: String,
    pub node_label: Option<String>,

    /// False when the variant chains into this phase on the same executor
    /// without waiting for the full previous phase.
    pub wait_on_full_previous_phase: bool,

    /// True when gating removed every step; NOP variants are reported but
    /// never allocated an executor.
    pub nop: bool,

    pub steps: Vec<ResolvedStep>,
}

/// A phase with its resolved variants and phase-scoped locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPhase {
    pub name: String,
    pub variants: Vec<ResolvedVariant>,

    /// Locks acquired when this phase begins (held onward).
    pub locks: Vec<LockKey>,
}

impl ResolvedPhase {
    pub fn variant(&self, name: &str) -> Option<&ResolvedVariant> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// The resolved, immutable execution graph for one build invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub phases: Vec<ResolvedPhase>,

    /// Locks held for the whole build.
    pub build_locks: Vec<LockKey>,

    /// Deterministic digest of the graph structure. Two invocations over the
    /// same source state produce the same digest, whether run locally or by
    /// a remote orchestrator.
    pub config_digest: String,
}

impl ExecutionGraph {
    pub fn phase(&self, name: &str) -> Option<&ResolvedPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Whether gating removed every step from every phase.
    pub fn is_empty(&self) -> bool {
        self.phases
            .iter()
            .all(|p| p.variants.iter().all(|v| v.nop))
    }
}

/// Builds the execution graph from configuration + context.
pub struct GraphBuilder<'a> {
    config: &'a BuildConfig,
    ctx: &'a BuildContext,

    /// Paths touched by the commit range, for the `only` gate.
    changed_paths: Vec<PathBuf>,

    phase_filter: Option<String>,
    variant_filter: Option<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a BuildConfig, ctx: &'a BuildContext) -> Self {
        GraphBuilder {
            config,
            ctx,
            changed_paths: Vec::new(),
            phase_filter: None,
            variant_filter: None,
        }
    }

    pub fn changed_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.changed_paths = paths;
        self
    }

    /// Restrict the graph to a single phase.
    pub fn phase(mut self, phase: Option<String>) -> Self {
        self.phase_filter = phase;
        self
    }

    /// Restrict the graph to a single variant.
    pub fn variant(mut self, variant: Option<String>) -> Self {
        self.variant_filter = variant;
        self
    }

    pub fn build(self) -> Result<ExecutionGraph, GraphError> {
        if let Some(phase) = &self.phase_filter {
            if self.config.phase(phase).is_none() {
                return Err(GraphError::UnknownPhase {
                    phase: phase.clone(),
                });
            }
        }
        if let Some(variant) = &self.variant_filter {
            let known = self
                .config
                .phases
                .iter()
                .any(|p| p.variant(variant).is_some());
            if !known {
                return Err(GraphError::UnknownVariant {
                    variant: variant.clone(),
                });
            }
        }

        let vars = self.ctx.variables();
        let mut phases = Vec::new();
        for phase in &self.config.phases {
            if self
                .phase_filter
                .as_deref()
                .is_some_and(|f| f != phase.name)
            {
                continue;
            }

            let mut variants = Vec::new();
            for variant in &phase.variants {
                if self
                    .variant_filter
                    .as_deref()
                    .is_some_and(|f| f != variant.name)
                {
                    continue;
                }

                let mut steps = Vec::new();
                for (idx, step) in variant.steps.iter().enumerate() {
                    if !self.gate_allows(step)? {
                        continue;
                    }
                    steps.extend(self.resolve_step(step, idx, &vars, &self.config.volumes)?);
                }

                let nop = steps.is_empty();
                variants.push(ResolvedVariant {
                    name: variant.name.clone(),
                    node_label: variant.node_label().map(str::to_string),
                    wait_on_full_previous_phase: variant.wait_on_full_previous_phase(),
                    nop,
                    steps,
                });
            }

            let locks = self
                .config
                .ci_locks
                .iter()
                .filter(|l| l.from_phase.as_deref() == Some(phase.name.as_str()))
                .map(|l| Ok(LockKey::new(l.lock_name()?, l.scope())))
                .collect::<Result<Vec<_>, ConfigError>>()?;

            phases.push(ResolvedPhase {
                name: phase.name.clone(),
                variants,
                locks,
            });
        }

        let build_locks = self
            .config
            .ci_locks
            .iter()
            .filter(|l| l.from_phase.is_none())
            .map(|l| Ok(LockKey::new(l.lock_name()?, l.scope())))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config_digest = digest_graph(&phases);
        Ok(ExecutionGraph {
            phases,
            build_locks,
            config_digest,
        })
    }

    /// Apply the run-on-change gate. Excluded steps never execute, not even
    /// speculatively.
    fn gate_allows(&self, step: &StepConfig) -> Result<bool, GraphError> {
        match step.run_on_change.unwrap_or_default() {
            RunOnChange::Always => Ok(true),
            RunOnChange::NewVersionOnly => Ok(self.ctx.version_is_new()),
            RunOnChange::Only => {
                if step.paths.is_empty() {
                    return Ok(!self.changed_paths.is_empty());
                }
                for pattern in &step.paths {
                    let compiled = glob::Pattern::new(pattern).map_err(|e| {
                        GraphError::Config(ConfigError::InvalidPattern {
                            pattern: pattern.clone(),
                            reason: e.to_string(),
                        })
                    })?;
                    if self
                        .changed_paths
                        .iter()
                        .any(|p| compiled.matches_path(Path::new(p)))
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Resolve one configured step into executable instances: one per commit
    /// in the range for `foreach` steps, otherwise a single instance.
    fn resolve_step(
        &self,
        step: &StepConfig,
        idx: usize,
        vars: &VariableNamespace,
        global_volumes: &[VolumeSpec],
    ) -> Result<Vec<ResolvedStep>, GraphError> {
        let base_name = step
            .name
            .clone()
            .unwrap_or_else(|| format!("step-{}", idx + 1));

        match step.foreach {
            None => Ok(vec![substitute_step(step, &base_name, vars, global_volumes)?]),
            Some(kind) => {
                let mut instances = Vec::new();
                for commit in self.ctx.range.commits() {
                    let commit_vars = vars.with(kind.variable(), commit.id.to_string());
                    let name = format!("{}@{}", base_name, commit.id.short());
                    instances.push(substitute_step(step, &name, &commit_vars, global_volumes)?);
                }
                Ok(instances)
            }
        }
    }
}

fn substitute_step(
    step: &StepConfig,
    name: &str,
    vars: &VariableNamespace,
    global_volumes: &[VolumeSpec],
) -> Result<ResolvedStep, GraphError> {
    let archive = step
        .archive
        .as_ref()
        .map(|a| {
            Ok::<_, GraphError>(ArchiveSpec {
                artifacts: a
                    .artifacts
                    .iter()
                    .map(|p| vars.substitute(p))
                    .collect::<Result<_, _>>()?,
                allow_empty: a.allow_empty,
            })
        })
        .transpose()?;

    // Global volumes first, step volumes layered after.
    let mut volumes = global_volumes.to_vec();
    volumes.extend(step.volumes.iter().cloned());

    Ok(ResolvedStep {
        name: name.to_string(),
        command: vars.substitute(&step.sh)?,
        image: step.image.clone(),
        volumes,
        env: vars.as_map().clone(),
        credentials: step.with_credentials.clone(),
        timeout: step.timeout,
        archive,
        junit: step
            .junit
            .iter()
            .map(|p| vars.substitute(p))
            .collect::<Result<_, _>>()?,
    })
}

/// Resolve a flat step list (post-submit, modality preparation) with the
/// same substitution rules but no gating.
pub fn resolve_plain_steps(
    steps: &[StepConfig],
    vars: &VariableNamespace,
) -> Result<Vec<ResolvedStep>, GraphError> {
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let name = step
                .name
                .clone()
                .unwrap_or_else(|| format!("step-{}", idx + 1));
            substitute_step(step, &name, vars, &[])
        })
        .collect()
}

/// Deterministic digest of the ordered graph structure (phase, variant and
/// step names plus commands). Environment values are excluded so the digest
/// agrees between environments.
fn digest_graph(phases: &[ResolvedPhase]) -> String {
    let mut hasher = Sha256::new();
    for phase in phases {
        hasher.update(phase.name.as_bytes());
        hasher.update(b"\0");
        for variant in &phase.variants {
            hasher.update(variant.name.as_bytes());
            hasher.update(b"\0");
            for step in &variant.steps {
                hasher.update(step.name.as_bytes());
                hasher.update(b"\0");
                hasher.update(step.command.as_bytes());
                hasher.update(b"\0");
            }
        }
    }
    hex::encode(hasher.finalize())
}
