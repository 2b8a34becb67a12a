//! Single-step execution through the executor capability.

use crate::graph::ResolvedStep;
use crate::report::StepOutcome;
use capstan_core::{
    CredentialValue, ExecError, ExecRequest, Executor, NodeHandle, SecretStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Runs one resolved step on an allocated executor: credentials are
/// materialized into the environment just before execution (and never
/// logged), the configured timeout is enforced, and declared outputs are
/// checked afterwards.
pub struct StepRunner {
    executor: Arc<dyn Executor>,
    secrets: Arc<dyn SecretStore>,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn Executor>, secrets: Arc<dyn SecretStore>) -> Self {
        StepRunner { executor, secrets }
    }

    pub async fn run_step(
        &self,
        node: &NodeHandle,
        step: &ResolvedStep,
    ) -> Result<StepOutcome, ExecError> {
        let start = Instant::now();

        let mut env = step.env.clone();
        for cred in &step.credentials {
            match self.secrets.resolve(&cred.id, cred.kind).await? {
                CredentialValue::UsernamePassword { username, password } => {
                    env.insert(cred.username_variable().to_string(), username);
                    env.insert(cred.password_variable().to_string(), password);
                }
                CredentialValue::SecretText { text } => {
                    env.insert(cred.text_variable().to_string(), text);
                }
                CredentialValue::File { path } => {
                    env.insert(
                        cred.filename_variable().to_string(),
                        path.display().to_string(),
                    );
                }
            }
        }

        debug!(step = %step.name, node = %node.id, "running step");
        let request = ExecRequest {
            command: step.command.clone(),
            image: step.image.clone(),
            volumes: step.volumes.clone(),
            env,
        };

        let outcome = match step.timeout {
            Some(secs) => tokio::time::timeout(
                Duration::from_secs(secs),
                self.executor.run(node, request),
            )
            .await
            .map_err(|_| ExecError::StepTimeout {
                step: step.name.clone(),
                secs,
            })??,
            None => self.executor.run(node, request).await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let success = outcome.success();

        if success {
            self.check_outputs(node, step).await?;
        }

        Ok(StepOutcome {
            name: step.name.clone(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms,
            success,
        })
    }

    /// Verify declared outputs exist. An archive pattern matching nothing is
    /// a step failure unless `allow-empty`; a missing test report is always
    /// a failure.
    async fn check_outputs(&self, node: &NodeHandle, step: &ResolvedStep) -> Result<(), ExecError> {
        if let Some(archive) = &step.archive {
            for pattern in &archive.artifacts {
                let matched = self.executor.collect(node, pattern).await?;
                if matched.is_empty() && !archive.allow_empty {
                    return Err(ExecError::MissingArtifact {
                        step: step.name.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        for report in &step.junit {
            let matched = self.executor.collect(node, report).await?;
            if matched.is_empty() {
                return Err(ExecError::MissingArtifact {
                    step: step.name.clone(),
                    pattern: report.clone(),
                });
            }
        }
        Ok(())
    }
}
