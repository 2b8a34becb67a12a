//! Domain-level error taxonomy for capstan.

use crate::version::BumpLevel;

/// Errors produced by version resolution.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("no version found: no tag reachable from history and no initial version configured")]
    NoVersionFound,

    #[error("commit {commit} does not follow the conventional commit format")]
    InvalidBumpInRange { commit: String },

    #[error("branch '{branch}' does not allow {required} changes")]
    RestrictedChange { branch: String, required: BumpLevel },

    #[error("invalid hotfix identifier '{id}': {reason}")]
    InvalidHotfixIdentifier { id: String, reason: String },

    #[error("cannot parse version from '{input}'")]
    InvalidVersion { input: String },

    #[error("tag '{tag}' does not match the configured tag pattern")]
    InvalidTag { tag: String },
}

/// Errors produced by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate phase name: {phase}")]
    DuplicatePhaseName { phase: String },

    #[error("variant '{variant}' declares conflicting run-on-change settings ({first} vs {second})")]
    ConflictingRunOnChange {
        variant: String,
        first: String,
        second: String,
    },

    #[error("credential '{id}' of type {kind} does not accept field '{field}'")]
    CredentialTypeMismatch {
        id: String,
        kind: String,
        field: String,
    },

    #[error("lock declaration needs a name, a repo-name, or a branch")]
    IncompleteLock,

    #[error("phase '{phase}' variant '{variant}': {reason}")]
    InvalidStep {
        phase: String,
        variant: String,
        reason: String,
    },

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while building the execution graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("step references undefined variable '{name}'")]
    UnknownVariable { name: String },

    #[error("phase '{phase}' not present in configuration")]
    UnknownPhase { phase: String },

    #[error("variant '{variant}' not present in configuration")]
    UnknownVariant { variant: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors crossing the capability boundary (source control, executors, secrets).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("source provider error: {0}")]
    Source(String),

    #[error("executor allocation failed for variant '{variant}': {reason}")]
    Allocation { variant: String, reason: String },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("credential '{id}' not found")]
    CredentialNotFound { id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capability providers.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors produced while running the execution graph.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("step '{step}' timed out after {secs} seconds")]
    StepTimeout { step: String, secs: u64 },

    #[error("lock '{name}' not acquired within {secs} seconds")]
    LockTimeout { name: String, secs: u64 },

    #[error("archive pattern '{pattern}' matched no files for step '{step}'")]
    MissingArtifact { step: String, pattern: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
