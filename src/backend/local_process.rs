//! Local-process backend adapter: spawns a subprocess as a stand-in compute
//! instance. Used for integration tests and single-host deployments where
//! there is no cloud provider at all.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::instrument;

use crate::runner::{Runner, RunnerStatus};

use super::{Backend, BackendError};

#[derive(Clone, Debug, Deserialize)]
pub struct LocalProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Tracks spawned children in-process. A real cloud backend's "instance
/// list" is the provider's API; here it's just our own child-process table,
/// which is why `list`/`get` never fail with `BackendUnavailable`.
pub struct LocalProcessBackend {
    config: LocalProcessConfig,
    children: Mutex<HashMap<String, (Child, String)>>,
}

impl LocalProcessBackend {
    pub fn new(config: LocalProcessConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Backend for LocalProcessBackend {
    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn create(&self, _manager: &str, mut runner: Runner) -> Result<Runner, BackendError> {
        let jit_config = runner.encoded_jit_config.clone().unwrap_or_default();
        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env("RUNNER_JIT_CONFIG", jit_config)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;

        let instance_id = format!("local-{}", runner.name);
        runner.instance_id = Some(instance_id.clone());
        runner.status = RunnerStatus::Offline;
        runner.encoded_jit_config = None;

        self.children
            .lock()
            .insert(instance_id, (child, runner.group.clone()));
        Ok(runner)
    }

    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn delete(&self, _manager: &str, runner: &Runner) -> Result<(), BackendError> {
        let Some(instance_id) = &runner.instance_id else {
            return Ok(());
        };
        if let Some((mut child, _)) = self.children.lock().remove(instance_id) {
            let _ = child.start_kill();
        }
        Ok(())
    }

    async fn update(&self, _manager: &str, runner: &Runner) -> Result<Runner, BackendError> {
        Ok(runner.clone())
    }

    async fn get(&self, _manager: &str, instance_id: &str) -> Result<Runner, BackendError> {
        let children = self.children.lock();
        let (_, group) = children
            .get(instance_id)
            .ok_or_else(|| BackendError::NotFound(instance_id.to_string()))?;
        let mut runner = Runner::new_provisioning(
            instance_id.trim_start_matches("local-").to_string(),
            group.clone(),
            String::new(),
            vec![],
        );
        runner.instance_id = Some(instance_id.to_string());
        runner.status = RunnerStatus::Online;
        Ok(runner)
    }

    async fn list(&self, _manager: &str, group: &str) -> Result<Vec<Runner>, BackendError> {
        let children = self.children.lock();
        Ok(children
            .iter()
            .filter(|(_, (_, g))| group.is_empty() || g == group)
            .map(|(instance_id, (_, g))| {
                let mut runner = Runner::new_provisioning(
                    instance_id.trim_start_matches("local-").to_string(),
                    g.clone(),
                    String::new(),
                    vec![],
                );
                runner.instance_id = Some(instance_id.clone());
                runner.status = RunnerStatus::Online;
                runner
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(name: &str) -> Runner {
        let mut r = Runner::new_provisioning(name.into(), "default".into(), "octo-org".into(), vec!["self-hosted".into()]);
        r.encoded_jit_config = Some("jit-blob".into());
        r
    }

    #[tokio::test]
    async fn create_assigns_instance_id_and_clears_jit_config() {
        let backend = LocalProcessBackend::new(LocalProcessConfig {
            command: "sleep".into(),
            args: vec!["30".into()],
        });
        let created = backend.create("mgr", runner("gha-abcde")).await.unwrap();
        assert!(created.instance_id.is_some());
        assert!(created.encoded_jit_config.is_none());
        backend.delete("mgr", &created).await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = LocalProcessBackend::new(LocalProcessConfig {
            command: "sleep".into(),
            args: vec!["30".into()],
        });
        let created = backend.create("mgr", runner("gha-fghij")).await.unwrap();
        backend.delete("mgr", &created).await.unwrap();
        backend.delete("mgr", &created).await.unwrap();
    }
}
