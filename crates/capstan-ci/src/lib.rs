//! Capstan CI - execution layer of the capstan CI orchestration engine
//!
//! Provides:
//! - `GraphBuilder`: turns a validated configuration + resolved version into
//!   an immutable, phase-ordered execution graph with gating applied
//! - `Scheduler`: runs the graph with parallel variants, join barriers,
//!   chained continuations, and named locks
//! - `NodeAllocator` / `LockCoordinator`: the only mutable shared state

pub mod allocator;
pub mod graph;
pub mod locks;
pub mod report;
pub mod runner;
pub mod scheduler;

// Re-export key types
pub use allocator::NodeAllocator;
pub use graph::{
    resolve_plain_steps, ExecutionGraph, GraphBuilder, ResolvedPhase, ResolvedStep,
    ResolvedVariant,
};
pub use locks::{LockCoordinator, LockGuard, LockKey};
pub use report::{BuildResult, PhaseResult, StepOutcome, VariantResult};
pub use runner::StepRunner;
pub use scheduler::Scheduler;
