//! Build, phase, variant and step result records.

use capstan_core::NodeHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step name.
    pub name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StepOutcome {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Synthetic failed outcome for a step that never produced an exit code
    /// (timeout, allocation failure, missing artifact).
    pub fn failed(name: &str, error: &str, duration_ms: u64) -> Self {
        StepOutcome {
            name: name.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms,
            success: false,
        }
    }
}

/// Result of a variant within one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant: String,

    /// Executor the variant ran on; absent for skipped variants.
    pub node: Option<NodeHandle>,

    pub steps: Vec<StepOutcome>,

    /// Whether the variant was gated out (NOP) or aborted before starting.
    pub skipped: bool,

    pub success: bool,
}

impl VariantResult {
    pub fn skipped(variant: &str) -> Self {
        VariantResult {
            variant: variant.to_string(),
            node: None,
            steps: Vec::new(),
            skipped: true,
            success: true,
        }
    }

    pub fn aborted(variant: &str) -> Self {
        VariantResult {
            variant: variant.to_string(),
            node: None,
            steps: Vec::new(),
            skipped: true,
            success: false,
        }
    }
}

/// Result of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub variants: Vec<VariantResult>,

    /// True when the phase never started (an earlier phase failed).
    pub skipped: bool,

    pub success: bool,
}

/// Result of a complete build invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    /// Build invocation id.
    pub build_id: String,

    /// Resolved version the build ran with.
    pub version: String,

    /// Digest of the execution graph structure.
    pub config_digest: String,

    pub started_at: DateTime<Utc>,

    pub phases: Vec<PhaseResult>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Whether every phase passed.
    pub success: bool,

    /// Whether the build was stopped by an interrupt.
    pub interrupted: bool,
}

impl BuildResult {
    /// Number of steps that passed across all phases.
    pub fn passed_count(&self) -> usize {
        self.steps().filter(|s| s.passed()).count()
    }

    /// Number of steps that failed across all phases.
    pub fn failed_count(&self) -> usize {
        self.steps().filter(|s| !s.passed()).count()
    }

    fn steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.phases
            .iter()
            .flat_map(|p| &p.variants)
            .flat_map(|v| &v.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, exit_code: i32) -> StepOutcome {
        StepOutcome {
            name: name.to_string(),
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
            success: exit_code == 0,
        }
    }

    #[test]
    fn test_build_result_counts() {
        let result = BuildResult {
            build_id: "b1".to_string(),
            version: "1.2.3".to_string(),
            config_digest: "abc".to_string(),
            started_at: Utc::now(),
            phases: vec![PhaseResult {
                phase: "build".to_string(),
                variants: vec![VariantResult {
                    variant: "linux".to_string(),
                    node: None,
                    steps: vec![step("compile", 0), step("test", 1)],
                    skipped: false,
                    success: false,
                }],
                skipped: false,
                success: false,
            }],
            duration_ms: 20,
            success: false,
            interrupted: false,
        };
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
    }

    #[test]
    fn test_synthetic_failure_outcome() {
        let outcome = StepOutcome::failed("publish", "timed out", 5000);
        assert!(!outcome.passed());
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.stderr.contains("timed out"));
    }

    #[test]
    fn test_result_serde_roundtrip() {
        let result = VariantResult::skipped("windows");
        let json = serde_json::to_string(&result).expect("serialize");
        let back: VariantResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.variant, "windows");
        assert!(back.skipped);
    }
}
