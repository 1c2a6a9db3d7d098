//! Container backend adapter.
//!
//! Shells out to a container runtime CLI via `tokio::process::Command` —
//! the same technique [`super::LocalProcessBackend`] uses for its own
//! instances.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::instrument;

use crate::runner::{Runner, RunnerStatus};

use super::{Backend, BackendError, sanitize_label_value};

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerConfig {
    /// Container image to run.
    pub image: String,
    /// Container runtime binary, e.g. `docker` or `podman`.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

fn default_runtime() -> String {
    "docker".to_string()
}

pub struct ContainerBackend {
    config: ContainerConfig,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn container_name(runner: &Runner) -> String {
        runner.name.clone()
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, BackendError> {
        Command::new(&self.config.runtime)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::BackendUnavailable(e.to_string()))
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn create(&self, manager: &str, mut runner: Runner) -> Result<Runner, BackendError> {
        let jit_config = runner
            .encoded_jit_config
            .clone()
            .ok_or_else(|| BackendError::InvalidConfig("runner has no jit config".into()))?;

        let name = Self::container_name(&runner);
        let label_manager = format!("manager={}", sanitize_label_value(&serde_json::Value::String(manager.to_string())));
        let label_group = format!("group={}", sanitize_label_value(&serde_json::Value::String(runner.group.clone())));
        let env_jit = format!("RUNNER_JIT_CONFIG={jit_config}");

        let mut args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &name,
            "--label",
            &label_manager,
            "--label",
            &label_group,
            "--env",
            &env_jit,
        ];
        let mut env_strings = Vec::new();
        for (k, v) in &self.config.env {
            env_strings.push(format!("{k}={v}"));
        }
        for env in &env_strings {
            args.push("--env");
            args.push(env.as_str());
        }
        args.push(&self.config.image);

        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(BackendError::BackendUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        runner.instance_id = Some(container_id);
        runner.status = RunnerStatus::Offline;
        runner.encoded_jit_config = None;
        Ok(runner)
    }

    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn delete(&self, manager: &str, runner: &Runner) -> Result<(), BackendError> {
        let Some(instance_id) = &runner.instance_id else {
            return Ok(());
        };
        // Refuse to delete any container not carrying our manager label;
        // `get` already filters `list` by that label, so a `NotFound` here
        // covers both "already gone" and "not ours".
        match self.get(manager, instance_id).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        // `rm -f` is idempotent: removing an already-gone container succeeds.
        let _ = self.run(&["rm", "-f", instance_id]).await?;
        Ok(())
    }

    async fn update(&self, _manager: &str, runner: &Runner) -> Result<Runner, BackendError> {
        Ok(runner.clone())
    }

    async fn get(&self, manager: &str, instance_id: &str) -> Result<Runner, BackendError> {
        self.list(manager, "")
            .await?
            .into_iter()
            .find(|r| r.instance_id.as_deref() == Some(instance_id))
            .ok_or_else(|| BackendError::NotFound(instance_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn list(&self, manager: &str, group: &str) -> Result<Vec<Runner>, BackendError> {
        let filter = format!("label=manager={manager}");
        let output = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.Label \"group\"}}\t{{.State}}",
            ])
            .await?;
        if !output.status.success() {
            return Err(BackendError::BackendUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut runners = Vec::new();
        for line in text.lines() {
            let mut fields = line.splitn(4, '\t');
            let (Some(id), Some(name), Some(container_group), Some(state)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !group.is_empty() && container_group != group {
                continue;
            }
            let mut runner = Runner::new_provisioning(
                name.to_string(),
                container_group.to_string(),
                String::new(),
                vec![],
            );
            runner.instance_id = Some(id.to_string());
            runner.status = if state == "running" {
                RunnerStatus::Online
            } else {
                RunnerStatus::Offline
            };
            runners.push(runner);
        }
        Ok(runners)
    }
}
