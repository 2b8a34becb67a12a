//! Capstan Core Library
//!
//! Domain model for the capstan CI orchestration engine: the commit model,
//! deterministic version resolution, the validated build configuration, and
//! the capability traits the execution layer is built on.

pub mod commit;
pub mod config;
pub mod context;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod providers;
pub mod vars;
pub mod version;

pub use commit::{Commit, CommitId, CommitMessage, CommitRange, ConventionalCommit, MessageParser};

pub use config::{
    ArchiveSpec, BuildConfig, CredentialRef, CredentialType, ForeachKind, LockConfig, LockScope,
    NamedSteps, PhaseConfig, RunOnChange, StepConfig, TagSetting, VariantConfig, VersionConfig,
    VolumeSpec,
};

pub use context::BuildContext;

pub use error::{
    ConfigError, ExecError, GraphError, ProviderError, ProviderResult, VersionError,
};

pub use providers::{
    BuildObserver, CredentialValue, ExecOutcome, ExecRequest, Executor, NodeHandle, NullObserver,
    SecretStore, SourceProvider,
};

pub use vars::VariableNamespace;

pub use version::{
    BranchPolicy, BumpLevel, BumpPolicy, BumpPolicyKind, HotfixContext, ResolvedVersion,
    TagPattern, Version, VersionFormat, VersionResolver,
};
