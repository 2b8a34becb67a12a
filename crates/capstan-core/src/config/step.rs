//! Step descriptors: commands, credentials, volumes, gates, outputs.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Run-on-change gate for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOnChange {
    /// Run unconditionally.
    #[default]
    Always,

    /// Run only when the resolved version differs from the last published
    /// version.
    NewVersionOnly,

    /// Run only when the commit range touches files matching the step's
    /// `paths` filters (any change when no filter is declared).
    Only,
}

impl RunOnChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOnChange::Always => "always",
            RunOnChange::NewVersionOnly => "new-version-only",
            RunOnChange::Only => "only",
        }
    }
}

/// Credential kinds the secret store can materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialType {
    UsernamePassword,
    SecretText,
    File,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::UsernamePassword => "username-password",
            CredentialType::SecretText => "secret-text",
            CredentialType::File => "file",
        }
    }
}

/// Reference to a credential, scoped to a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CredentialRef {
    /// Identifier in the secret store.
    pub id: String,

    /// Declared credential type; must match what the store holds.
    #[serde(rename = "type")]
    pub kind: CredentialType,

    #[serde(default)]
    pub username_variable: Option<String>,

    #[serde(default)]
    pub password_variable: Option<String>,

    #[serde(default)]
    pub text_variable: Option<String>,

    #[serde(default)]
    pub filename_variable: Option<String>,
}

impl CredentialRef {
    /// Reject variable declarations that do not belong to the declared type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mismatch = |field: &str| ConfigError::CredentialTypeMismatch {
            id: self.id.clone(),
            kind: self.kind.as_str().to_string(),
            field: field.to_string(),
        };
        match self.kind {
            CredentialType::UsernamePassword => {
                if self.text_variable.is_some() {
                    return Err(mismatch("text-variable"));
                }
                if self.filename_variable.is_some() {
                    return Err(mismatch("filename-variable"));
                }
            }
            CredentialType::SecretText => {
                if self.username_variable.is_some() {
                    return Err(mismatch("username-variable"));
                }
                if self.password_variable.is_some() {
                    return Err(mismatch("password-variable"));
                }
                if self.filename_variable.is_some() {
                    return Err(mismatch("filename-variable"));
                }
            }
            CredentialType::File => {
                if self.username_variable.is_some() {
                    return Err(mismatch("username-variable"));
                }
                if self.password_variable.is_some() {
                    return Err(mismatch("password-variable"));
                }
                if self.text_variable.is_some() {
                    return Err(mismatch("text-variable"));
                }
            }
        }
        Ok(())
    }

    pub fn username_variable(&self) -> &str {
        self.username_variable.as_deref().unwrap_or("USERNAME")
    }

    pub fn password_variable(&self) -> &str {
        self.password_variable.as_deref().unwrap_or("PASSWORD")
    }

    pub fn text_variable(&self) -> &str {
        self.text_variable.as_deref().unwrap_or("SECRET")
    }

    pub fn filename_variable(&self) -> &str {
        self.filename_variable.as_deref().unwrap_or("SECRET_FILE")
    }
}

/// A mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeSpec {
    pub source: String,
    pub target: String,

    #[serde(default)]
    pub read_only: bool,
}

/// Archive output declaration: glob patterns collected after the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ArchiveSpec {
    pub artifacts: Vec<String>,

    /// A pattern matching nothing is a step failure unless set.
    #[serde(default)]
    pub allow_empty: bool,
}

/// Range-repeat marker: the step runs once per commit in the range, exposing
/// the named per-commit variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeachKind {
    AutosquashedCommit,
    SourceCommit,
}

impl ForeachKind {
    /// Name of the per-commit variable the expansion exposes.
    pub fn variable(&self) -> &'static str {
        match self {
            ForeachKind::AutosquashedCommit => "AUTOSQUASHED_COMMIT",
            ForeachKind::SourceCommit => "SOURCE_COMMIT",
        }
    }
}

/// One unit of work inside a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StepConfig {
    /// Shell command, with `${VAR}` substitutions applied at graph build.
    pub sh: String,

    /// Optional display name; defaults to a positional name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub with_credentials: Vec<CredentialRef>,

    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// Timeout in seconds; absent means unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub run_on_change: Option<RunOnChange>,

    /// Path filters consulted by the `only` gate.
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub foreach: Option<ForeachKind>,

    #[serde(default)]
    pub archive: Option<ArchiveSpec>,

    /// Test-report paths collected after the step.
    #[serde(default)]
    pub junit: Vec<String>,

    #[serde(default)]
    pub node_label: Option<String>,

    /// When false, the variant continues into the next phase on the same
    /// executor without waiting for the full previous phase.
    #[serde(default)]
    pub wait_on_full_previous_phase: Option<bool>,
}

/// Lock scope: serialized against other builds of the same branch, or of the
/// whole repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockScope {
    Branch,
    Repo,
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Branch => write!(f, "branch"),
            LockScope::Repo => write!(f, "repo"),
        }
    }
}

/// A `ci-locks` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub repo_name: Option<String>,

    /// When set, the lock is acquired at the named phase and held onward;
    /// otherwise it covers the whole build.
    #[serde(default)]
    pub from_phase: Option<String>,
}

impl LockConfig {
    /// Effective lock name: explicit name, or repo-name[/branch].
    pub fn lock_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = &self.name {
            return Ok(name.clone());
        }
        match (&self.repo_name, &self.branch) {
            (Some(repo), Some(branch)) => Ok(format!("{repo}/{branch}")),
            (Some(repo), None) => Ok(repo.clone()),
            (None, Some(branch)) => Ok(branch.clone()),
            (None, None) => Err(ConfigError::IncompleteLock),
        }
    }

    pub fn scope(&self) -> LockScope {
        if self.branch.is_some() {
            LockScope::Branch
        } else {
            LockScope::Repo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_minimal_yaml() {
        let step: StepConfig = serde_yaml::from_str("sh: make build").unwrap();
        assert_eq!(step.sh, "make build");
        assert!(step.run_on_change.is_none());
        assert!(step.with_credentials.is_empty());
    }

    #[test]
    fn test_step_full_yaml() {
        let yaml = r#"
sh: make publish
image: debian:12
timeout: 600
run-on-change: new-version-only
with-credentials:
  - id: registry
    type: username-password
    username-variable: REG_USER
    password-variable: REG_PASS
archive:
  artifacts: ["dist/*.tar.gz"]
junit: ["reports/junit.xml"]
node-label: linux-docker
"#;
        let step: StepConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.run_on_change, Some(RunOnChange::NewVersionOnly));
        assert_eq!(step.with_credentials[0].username_variable(), "REG_USER");
        assert_eq!(step.timeout, Some(600));
        assert_eq!(step.node_label.as_deref(), Some("linux-docker"));
    }

    #[test]
    fn test_unknown_step_key_rejected() {
        let result: Result<StepConfig, _> = serde_yaml::from_str("sh: make\nbogus: 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_foreach_variable_names() {
        let step: StepConfig =
            serde_yaml::from_str("sh: ./check.sh\nforeach: AUTOSQUASHED_COMMIT").unwrap();
        assert_eq!(step.foreach.unwrap().variable(), "AUTOSQUASHED_COMMIT");
    }

    #[test]
    fn test_credential_type_mismatch() {
        let cred = CredentialRef {
            id: "token".to_string(),
            kind: CredentialType::SecretText,
            username_variable: Some("USER".to_string()),
            password_variable: None,
            text_variable: None,
            filename_variable: None,
        };
        assert!(matches!(
            cred.validate(),
            Err(ConfigError::CredentialTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_credential_default_variables() {
        let cred = CredentialRef {
            id: "registry".to_string(),
            kind: CredentialType::UsernamePassword,
            username_variable: None,
            password_variable: None,
            text_variable: None,
            filename_variable: None,
        };
        assert!(cred.validate().is_ok());
        assert_eq!(cred.username_variable(), "USERNAME");
        assert_eq!(cred.password_variable(), "PASSWORD");
    }

    #[test]
    fn test_lock_name_fallbacks() {
        let lock = LockConfig {
            repo_name: Some("capstan".to_string()),
            branch: Some("main".to_string()),
            ..LockConfig::default()
        };
        assert_eq!(lock.lock_name().unwrap(), "capstan/main");
        assert_eq!(lock.scope(), LockScope::Branch);

        assert!(matches!(
            LockConfig::default().lock_name(),
            Err(ConfigError::IncompleteLock)
        ));
    }
}
