//! Phase/variant scheduling.
//!
//! Walks the execution graph phase by phase: variants run as parallel tasks,
//! steps within a variant run strictly in order, and a phase completes only
//! when every variant in it has finished. Variants that opt out of waiting
//! on the full previous phase continue on the same executor as a chained
//! continuation of the previous phase's branch.

use crate::allocator::NodeAllocator;
use crate::graph::ExecutionGraph;
use crate::locks::LockCoordinator;
use crate::report::{BuildResult, PhaseResult, StepOutcome, VariantResult};
use crate::runner::StepRunner;
use capstan_core::{obs, BuildContext, BuildObserver, ExecError, Executor, NullObserver, SecretStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(3600);

/// One chain: a variant's consecutive segments across phases, executed as a
/// single task on one executor. `segments` holds (phase index, variant
/// index) pairs in phase order.
#[derive(Debug, Clone)]
struct ChainPlan {
    variant: String,
    start_phase: usize,
    segments: Vec<(usize, usize)>,
}

/// Group variants into chains. A variant entry extends the previous phase's
/// chain when it opted out of waiting and the same variant ran in the
/// previous phase; otherwise it starts a new chain.
fn plan_chains(graph: &ExecutionGraph) -> Vec<ChainPlan> {
    let mut chains: Vec<ChainPlan> = Vec::new();
    // variant name -> index into `chains` for chains whose last segment is
    // in the previous phase.
    let mut open: HashMap<String, usize> = HashMap::new();

    for (pi, phase) in graph.phases.iter().enumerate() {
        let mut next_open = HashMap::new();
        for (vi, variant) in phase.variants.iter().enumerate() {
            if variant.nop {
                continue;
            }
            let chained = !variant.wait_on_full_previous_phase;
            let idx = match open.get(&variant.name) {
                Some(&idx) if chained => {
                    chains[idx].segments.push((pi, vi));
                    idx
                }
                _ => {
                    chains.push(ChainPlan {
                        variant: variant.name.clone(),
                        start_phase: pi,
                        segments: vec![(pi, vi)],
                    });
                    chains.len() - 1
                }
            };
            next_open.insert(variant.name.clone(), idx);
        }
        open = next_open;
    }
    chains
}

/// Executes execution graphs.
pub struct Scheduler {
    executor: Arc<dyn Executor>,
    secrets: Arc<dyn SecretStore>,
    observer: Arc<dyn BuildObserver>,
    lock_wait: Duration,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: Option<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn Executor>, secrets: Arc<dyn SecretStore>) -> Self {
        let (tx, rx) = watch::channel(false);
        Scheduler {
            executor,
            secrets,
            observer: Arc::new(NullObserver),
            lock_wait: DEFAULT_LOCK_WAIT,
            shutdown: rx,
            _shutdown_tx: Some(tx),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use an externally driven shutdown signal (e.g. SIGINT). When it turns
    /// true the currently running step is waited for, then the build stops.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self._shutdown_tx = None;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Run the whole graph and report per-phase results.
    ///
    /// Failure policy: a failed variant fails its phase; phases that have
    /// not started are aborted, but sibling variants already running finish
    /// their current phase undisturbed. Completed phases are never rolled
    /// back.
    pub async fn run(
        &self,
        graph: Arc<ExecutionGraph>,
        ctx: &BuildContext,
    ) -> Result<BuildResult, ExecError> {
        let start = Instant::now();
        let started_at = Utc::now();
        let build_id = ctx.build_id.to_string();
        let version = ctx.resolved.version.to_string();

        obs::emit_build_started(&build_id, &version, ctx.branch.as_deref());
        self.observer.on_build_started(&build_id, &version);

        let allocator = Arc::new(NodeAllocator::new(self.executor.clone()));
        let runner = Arc::new(StepRunner::new(self.executor.clone(), self.secrets.clone()));
        let locks = LockCoordinator::new(self.lock_wait);

        // Lock guards held until the build completes or fails.
        let mut guards = Vec::new();
        if !graph.build_locks.is_empty() {
            guards.push(
                locks
                    .acquire_all(&graph.build_locks, self.observer.clone())
                    .await?,
            );
        }

        let (abort_tx, abort_rx) = watch::channel(false);
        let mut pending: HashMap<usize, Vec<ChainPlan>> = HashMap::new();
        for plan in plan_chains(&graph) {
            pending.entry(plan.start_phase).or_default().push(plan);
        }

        let mut seg_rx: HashMap<(usize, String), oneshot::Receiver<bool>> = HashMap::new();
        let mut handles = Vec::new();
        let mut started_phases = 0;
        let mut failed = false;

        for (pi, phase) in graph.phases.iter().enumerate() {
            if failed || *self.shutdown.borrow() {
                break;
            }

            if !phase.locks.is_empty() {
                guards.push(
                    locks
                        .acquire_all(&phase.locks, self.observer.clone())
                        .await?,
                );
            }

            started_phases = pi + 1;
            obs::emit_phase_started(&phase.name);
            self.observer.on_phase_started(&phase.name);

            for plan in pending.remove(&pi).unwrap_or_default() {
                let mut senders = Vec::with_capacity(plan.segments.len());
                for &(spi, svi) in &plan.segments {
                    let (tx, rx) = oneshot::channel();
                    let name = graph.phases[spi].variants[svi].name.clone();
                    seg_rx.insert((spi, name), rx);
                    senders.push(Some(tx));
                }
                let task = ChainTask {
                    graph: graph.clone(),
                    plan,
                    senders,
                    allocator: allocator.clone(),
                    runner: runner.clone(),
                    observer: self.observer.clone(),
                    abort: abort_rx.clone(),
                    shutdown: self.shutdown.clone(),
                };
                handles.push(tokio::spawn(task.run()));
            }

            // Join barrier: the phase completes when every non-NOP variant's
            // segment for this phase has finished.
            let mut phase_ok = true;
            for variant in &phase.variants {
                if variant.nop {
                    info!(phase = %phase.name, variant = %variant.name, "variant has no runnable steps, skipping");
                    self.observer.on_variant_skipped(&phase.name, &variant.name);
                    continue;
                }
                if let Some(rx) = seg_rx.remove(&(pi, variant.name.clone())) {
                    phase_ok &= rx.await.unwrap_or(false);
                }
            }

            obs::emit_phase_finished(&phase.name, phase_ok);
            self.observer.on_phase_finished(&phase.name, phase_ok);
            if !phase_ok {
                failed = true;
                let _ = abort_tx.send(true);
            }
        }

        let interrupted = *self.shutdown.borrow();
        if interrupted {
            warn!("build interrupted, waiting for running steps to finish");
            let _ = abort_tx.send(true);
        }

        // Chains running ahead finish their current phase; collect everything.
        let mut collected: HashMap<(usize, String), VariantResult> = HashMap::new();
        for outcome in futures::future::join_all(handles).await {
            match outcome {
                Ok(results) => {
                    for (pi, result) in results {
                        collected.insert((pi, result.variant.clone()), result);
                    }
                }
                Err(e) => warn!(error = %e, "variant task panicked"),
            }
        }

        if let Err(e) = allocator.release_all().await {
            warn!(error = %e, "failed to release executors");
        }
        drop(guards);

        let phases = assemble_results(&graph, started_phases, collected);
        let all_phases_ran = started_phases == graph.phases.len();
        let success =
            !failed && !interrupted && all_phases_ran && phases.iter().all(|p| p.success);

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_build_finished(&build_id, duration_ms, success);
        self.observer.on_build_finished(&build_id, success);

        Ok(BuildResult {
            build_id,
            version,
            config_digest: graph.config_digest.clone(),
            started_at,
            phases,
            duration_ms,
            success,
            interrupted,
        })
    }
}

/// Assemble per-phase results in graph order from the collected chain
/// outputs. Variants with no recorded result were aborted before starting.
fn assemble_results(
    graph: &ExecutionGraph,
    started_phases: usize,
    mut collected: HashMap<(usize, String), VariantResult>,
) -> Vec<PhaseResult> {
    let mut phases = Vec::with_capacity(graph.phases.len());
    for (pi, phase) in graph.phases.iter().enumerate() {
        let started = pi < started_phases;
        let mut variants = Vec::with_capacity(phase.variants.len());
        let mut success = started;
        for variant in &phase.variants {
            let result = if variant.nop {
                VariantResult::skipped(&variant.name)
            } else if let Some(result) = collected.remove(&(pi, variant.name.clone())) {
                result
            } else {
                VariantResult::aborted(&variant.name)
            };
            success &= result.success;
            variants.push(result);
        }
        phases.push(PhaseResult {
            phase: phase.name.clone(),
            variants,
            skipped: !started,
            success,
        });
    }
    phases
}

/// One spawned task executing a chain's segments in order.
struct ChainTask {
    graph: Arc<ExecutionGraph>,
    plan: ChainPlan,
    senders: Vec<Option<oneshot::Sender<bool>>>,
    allocator: Arc<NodeAllocator>,
    runner: Arc<StepRunner>,
    observer: Arc<dyn BuildObserver>,
    abort: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl ChainTask {
    async fn run(mut self) -> Vec<(usize, VariantResult)> {
        let name = self.plan.variant.clone();
        let mut results = Vec::with_capacity(self.plan.segments.len());

        // One executor for the whole chain; the allocator also serves later
        // chains of the same variant the identical handle.
        let (first_pi, first_vi) = self.plan.segments[0];
        let label = self.graph.phases[first_pi].variants[first_vi]
            .node_label
            .clone();
        let node = match self
            .allocator
            .allocate(&name, label.as_deref(), self.observer.as_ref())
            .await
        {
            Ok(node) => node,
            Err(e) => {
                warn!(variant = %name, error = %e, "executor allocation failed");
                for (i, &(pi, _)) in self.plan.segments.clone().iter().enumerate() {
                    self.finish_segment(i, false);
                    let mut result = VariantResult::aborted(&name);
                    if i == 0 {
                        result.skipped = false;
                        result.steps = vec![StepOutcome::failed("allocate", &e.to_string(), 0)];
                    }
                    results.push((pi, result));
                }
                return results;
            }
        };

        let mut aborted = false;
        for i in 0..self.plan.segments.len() {
            let (pi, vi) = self.plan.segments[i];
            let phase_name = self.graph.phases[pi].name.clone();

            // Chained continuations check the abort signal before entering
            // the next phase, never mid-step.
            if aborted || (i > 0 && (*self.abort.borrow() || *self.shutdown.borrow())) {
                self.finish_segment(i, false);
                results.push((pi, VariantResult::aborted(&name)));
                continue;
            }

            let variant = &self.graph.phases[pi].variants[vi];
            self.observer.on_variant_started(&phase_name, &name, &node);

            let mut steps = Vec::with_capacity(variant.steps.len());
            let mut ok = true;
            for step in &variant.steps {
                if *self.shutdown.borrow() {
                    ok = false;
                    break;
                }
                self.observer.on_step_started(&phase_name, &name, &step.name);
                let started = Instant::now();
                let outcome = match self.runner.run_step(&node, step).await {
                    Ok(outcome) => outcome,
                    Err(e) => StepOutcome::failed(
                        &step.name,
                        &e.to_string(),
                        started.elapsed().as_millis() as u64,
                    ),
                };
                let passed = outcome.passed();
                self.observer
                    .on_step_finished(&phase_name, &name, &step.name, passed);
                steps.push(outcome);
                if !passed {
                    ok = false;
                    break;
                }
            }

            obs::emit_variant_finished(&phase_name, &name, ok);
            self.observer.on_variant_finished(&phase_name, &name, ok);
            self.finish_segment(i, ok);
            results.push((
                pi,
                VariantResult {
                    variant: name.clone(),
                    node: Some(node.clone()),
                    steps,
                    skipped: false,
                    success: ok,
                },
            ));
            if !ok {
                aborted = true;
            }
        }

        results
    }

    fn finish_segment(&mut self, idx: usize, ok: bool) {
        if let Some(tx) = self.senders[idx].take() {
            let _ = tx.send(ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use capstan_core::fakes::{FakeExecutor, MemorySecretStore, RecordingObserver};
    use capstan_core::version::{BumpLevel, ResolvedVersion, TagPattern};
    use capstan_core::{BuildConfig, CommitId, CommitRange, Version};
    use uuid::Uuid;

    fn context() -> BuildContext {
        BuildContext {
            build_id: Uuid::new_v4(),
            branch: Some("main".to_string()),
            range: CommitRange::empty(CommitId::new("abc123")),
            resolved: ResolvedVersion {
                version: Version::new(1, 0, 1),
                base: Version::new(1, 0, 0),
                bump: BumpLevel::Patch,
            },
            tag_pattern: TagPattern::default(),
            last_published: None,
            may_publish: false,
            environment: Default::default(),
        }
    }

    fn graph(yaml: &str, ctx: &BuildContext) -> Arc<ExecutionGraph> {
        let config = BuildConfig::load_str(yaml).unwrap();
        Arc::new(GraphBuilder::new(&config, ctx).build().unwrap())
    }

    #[test]
    fn test_plan_chains_groups_consecutive_optouts() {
        let ctx = context();
        let graph = graph(
            r#"
phases:
  a:
    x:
      - sh: one
    y:
      - sh: two
  b:
    x:
      - sh: three
        wait-on-full-previous-phase: false
  c:
    x:
      - sh: four
"#,
            &ctx,
        );
        let chains = plan_chains(&graph);
        // x spans a+b (chained), y is alone in a, x starts fresh in c.
        assert_eq!(chains.len(), 3);
        let x_chain = chains.iter().find(|c| c.variant == "x" && c.start_phase == 0).unwrap();
        assert_eq!(x_chain.segments, vec![(0, 0), (1, 0)]);
        let x_tail = chains.iter().find(|c| c.variant == "x" && c.start_phase == 2).unwrap();
        assert_eq!(x_tail.segments, vec![(2, 0)]);
    }

    #[tokio::test]
    async fn test_phase_barrier_before_next_phase() {
        let ctx = context();
        let graph = graph(
            r#"
phases:
  a:
    x:
      - sh: a-x
    y:
      - sh: a-y
  b:
    x:
      - sh: b-x
"#,
            &ctx,
        );
        let executor = Arc::new(FakeExecutor::new());
        let observer = Arc::new(RecordingObserver::new());
        let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()))
            .with_observer(observer.clone());

        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(result.success);

        // Phase b's x must start only after both of phase a's variants
        // finished.
        let events = observer.events();
        let b_start = events
            .iter()
            .position(|e| e == "phase.started b")
            .expect("phase b started");
        for finished in ["variant.finished a/x true", "variant.finished a/y true"] {
            let pos = events.iter().position(|e| e == finished).expect(finished);
            assert!(pos < b_start, "{finished} should precede phase b start");
        }

        // y is absent from phase b: exactly one allocation per variant.
        assert_eq!(executor.allocations().len(), 2);
    }

    #[tokio::test]
    async fn test_variant_failure_aborts_remaining_phases() {
        let ctx = context();
        let graph = graph(
            r#"
phases:
  a:
    x:
      - sh: make broken
    y:
      - sh: make fine
  b:
    x:
      - sh: never-runs
"#,
            &ctx,
        );
        let executor = Arc::new(FakeExecutor::failing_on("broken"));
        let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));

        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(!result.success);

        // Phase a ran both variants; the sibling finished its phase.
        assert!(!result.phases[0].success);
        let y = result.phases[0]
            .variants
            .iter()
            .find(|v| v.variant == "y")
            .unwrap();
        assert!(y.success);

        // Phase b never started.
        assert!(result.phases[1].skipped);
        assert!(!executor.commands().contains(&"never-runs".to_string()));
    }

    #[tokio::test]
    async fn test_steps_run_in_declared_order_and_stop_on_failure() {
        let ctx = context();
        let graph = graph(
            r#"
phases:
  a:
    x:
      - sh: step-one
      - sh: broken-step
      - sh: step-three
"#,
            &ctx,
        );
        let executor = Arc::new(FakeExecutor::failing_on("broken"));
        let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));

        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(executor.commands(), vec!["step-one", "broken-step"]);
        assert_eq!(result.phases[0].variants[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn test_chained_variant_reuses_node_without_reallocation() {
        let ctx = context();
        let graph = graph(
            r#"
phases:
  a:
    x:
      - sh: a-x
  b:
    x:
      - sh: b-x
        wait-on-full-previous-phase: false
"#,
            &ctx,
        );
        let executor = Arc::new(FakeExecutor::new());
        let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));

        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(executor.allocations(), vec!["x"]);

        let runs = executor.runs();
        assert_eq!(runs[0].0, runs[1].0, "chained phases share the executor");
    }

    #[tokio::test]
    async fn test_nop_variants_are_never_allocated() {
        let mut ctx = context();
        ctx.last_published = Some(Version::new(1, 0, 1));
        let graph = graph(
            r#"
phases:
  publish:
    release:
      - sh: make publish
        run-on-change: new-version-only
    docs:
      - sh: make docs
"#,
            &ctx,
        );
        let executor = Arc::new(FakeExecutor::new());
        let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));

        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(executor.allocations(), vec!["docs"]);
        let release = result.phases[0]
            .variants
            .iter()
            .find(|v| v.variant == "release")
            .unwrap();
        assert!(release.skipped);
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds_trivially() {
        let ctx = context();
        let graph = Arc::new(ExecutionGraph {
            phases: Vec::new(),
            build_locks: Vec::new(),
            config_digest: "none".to_string(),
        });
        let scheduler = Scheduler::new(
            Arc::new(FakeExecutor::new()),
            Arc::new(MemorySecretStore::new()),
        );
        let result = scheduler.run(graph, &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.phases.is_empty());
    }
}
