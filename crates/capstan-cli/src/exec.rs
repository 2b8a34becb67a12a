//! Local process executor and environment-backed secret store.
//!
//! The local executor runs steps as `sh -c` child processes in the
//! workspace. Declared images and volumes are accepted (the graph carries
//! them for container-backed executors) but execution happens on the host.

use async_trait::async_trait;
use capstan_core::{
    CredentialType, CredentialValue, ExecOutcome, ExecRequest, Executor, NodeHandle,
    ProviderError, ProviderResult, SecretStore,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tracing::debug;

pub struct ProcessExecutor {
    workdir: PathBuf,
    counter: AtomicU64,
}

impl ProcessExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        ProcessExecutor {
            workdir: workdir.into(),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn allocate(&self, variant: &str, label: Option<&str>) -> ProviderResult<NodeHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(NodeHandle {
            id: format!("local-{variant}-{n}"),
            label: label.map(str::to_string),
        })
    }

    async fn run(&self, node: &NodeHandle, request: ExecRequest) -> ProviderResult<ExecOutcome> {
        if let Some(image) = &request.image {
            debug!(node = %node.id, image = %image, "image declared; running on host");
        }

        // The child inherits the invoking environment (PATH and friends);
        // step variables and credentials are layered on top. Terminal
        // signals reach the child through the foreground process group, so
        // an interrupt lets the command terminate gracefully before the
        // scheduler exits.
        let output = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&self.workdir)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::Execution(format!("failed to spawn step: {e}")))?
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Execution(format!("failed to wait for step: {e}")))?;

        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn collect(&self, _node: &NodeHandle, pattern: &str) -> ProviderResult<Vec<PathBuf>> {
        let absolute = self.workdir.join(pattern);
        let pattern = absolute.to_string_lossy().to_string();
        let paths = glob::glob(&pattern)
            .map_err(|e| ProviderError::Execution(format!("invalid output pattern: {e}")))?
            .filter_map(Result::ok)
            .collect();
        Ok(paths)
    }

    async fn release(&self, _node: NodeHandle) -> ProviderResult<()> {
        Ok(())
    }
}

/// Secret store resolving credentials from the process environment:
/// `CAPSTAN_SECRET_<ID>_USERNAME` / `_PASSWORD` / `_TEXT` / `_FILE`, where
/// `<ID>` is the uppercased identifier with non-alphanumerics replaced by
/// underscores. A missing variable is an error, never an empty value.
#[derive(Debug, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn new() -> Self {
        EnvSecretStore
    }

    fn env_key(id: &str, field: &str) -> String {
        let id: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("CAPSTAN_SECRET_{id}_{field}")
    }

    fn lookup(id: &str, field: &str) -> ProviderResult<String> {
        std::env::var(Self::env_key(id, field))
            .map_err(|_| ProviderError::CredentialNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, id: &str, kind: CredentialType) -> ProviderResult<CredentialValue> {
        match kind {
            CredentialType::UsernamePassword => Ok(CredentialValue::UsernamePassword {
                username: Self::lookup(id, "USERNAME")?,
                password: Self::lookup(id, "PASSWORD")?,
            }),
            CredentialType::SecretText => Ok(CredentialValue::SecretText {
                text: Self::lookup(id, "TEXT")?,
            }),
            CredentialType::File => Ok(CredentialValue::File {
                path: PathBuf::from(Self::lookup(id, "FILE")?),
            }),
        }
    }
}
