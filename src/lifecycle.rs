//! The lifecycle manager: the state machine and transitions for a single
//! runner across creation, registration, pickup, completion, timeout, and
//! deletion.
//!
//! Per-runner and per-group async locks serialize concurrent transitions
//! on the same runner or group, since webhook delivery, reconciler ticks,
//! and startup provisioning can all race to touch the same record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use octocrab::models::actions::SelfHostedRunner;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::instrument;

use crate::backend::Backend;
use crate::error::TransitionError;
use crate::github::GitHubClient;
use crate::runner::{Runner, RunnerStatus};
use crate::runner_group::RunnerGroup;
use crate::store::RunnerStore;

/// Bound on retrying a `workflow_job.in_progress` event that arrives before
/// the runner's record has reached `idle`: 5 attempts, fixed 2-second
/// spacing, then discard and log.
const PICKUP_RETRY_ATTEMPTS: u32 = 5;
const PICKUP_RETRY_SPACING: Duration = Duration::from_secs(2);

/// A map of async mutexes keyed by an arbitrary string, used for both the
/// per-runner and per-group locks. Entries are never removed:
/// the key space (runner names, group names) is bounded by the fleet size,
/// so leaking a handful of bytes per ever-seen key is cheaper than coping
/// with use-after-free on a removed lock that's still held elsewhere.
#[derive(Default)]
struct KeyedLocks {
    inner: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = {
            let mut guard = self.inner.lock();
            guard
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        handle.lock_owned().await
    }
}

/// A configured group bound to its concrete backend adapter.
pub struct GroupHandle {
    pub config: RunnerGroup,
    pub backend: Arc<dyn Backend>,
}

/// Generate a manager-assigned runner identity: a `gha-` prefix followed by
/// five lowercase alphanumeric characters.
pub fn generate_runner_name() -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase())
        .take(5)
        .collect();
    format!("gha-{suffix}")
}

pub struct LifecycleManager {
    manager_name: String,
    store: Arc<dyn RunnerStore>,
    github: Arc<GitHubClient>,
    groups: HashMap<String, GroupHandle>,
    runner_locks: KeyedLocks,
    group_locks: KeyedLocks,
}

impl LifecycleManager {
    pub fn new(
        manager_name: String,
        store: Arc<dyn RunnerStore>,
        github: Arc<GitHubClient>,
        groups: HashMap<String, GroupHandle>,
    ) -> Self {
        Self {
            manager_name,
            store,
            github,
            groups,
            runner_locks: KeyedLocks::default(),
            group_locks: KeyedLocks::default(),
        }
    }

    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    pub fn store(&self) -> &Arc<dyn RunnerStore> {
        &self.store
    }

    pub fn github(&self) -> &Arc<GitHubClient> {
        &self.github
    }

    pub fn groups(&self) -> &HashMap<String, GroupHandle> {
        &self.groups
    }

    fn group(&self, name: &str) -> Result<&GroupHandle, TransitionError> {
        self.groups
            .get(name)
            .ok_or_else(|| TransitionError::InvariantViolation(format!("unknown group {name:?}")))
    }

    /// Transition 1: create. Allocates an identity and a just-in-time
    /// config via the hosting-service client, persists a provisioning
    /// record, invokes backend `create`, and persists the returned
    /// instance id.
    ///
    /// On backend failure the provisioning record is rolled back so that
    /// nothing durable remains; on hosting-service failure nothing was
    /// persisted yet.
    #[instrument(skip(self), fields(group = %group_name))]
    pub async fn create(&self, group_name: &str) -> Result<Runner, TransitionError> {
        let group = self.group(group_name)?;
        let _group_guard = self.group_locks.lock(group_name).await;

        let name = generate_runner_name();
        let jit = self
            .github
            .generate_jit_config(
                &group.config.organization,
                name.clone(),
                group.config.github_runner_group_id,
                group.config.labels.clone(),
            )
            .await?;

        let mut runner = Runner::new_provisioning(
            name.clone(),
            group_name.to_string(),
            group.config.organization.clone(),
            group.config.labels.clone(),
        );
        runner.encoded_jit_config = Some(jit.encoded_jit_config.clone());

        let _runner_guard = self.runner_locks.lock(&name).await;
        self.store
            .save(runner.clone())
            .await
            .map_err(|e| TransitionError::InvariantViolation(e.to_string()))?;

        match group.backend.create(&self.manager_name, runner).await {
            Ok(created) => {
                self.store
                    .save(created.clone())
                    .await
                    .map_err(|e| TransitionError::InvariantViolation(e.to_string()))?;
                tracing::info!(runner = %created.name, instance_id = ?created.instance_id, "created runner");
                Ok(created)
            }
            Err(e) => {
                self.store.delete(&name).await;
                tracing::warn!(runner = %name, error = %e, "backend create failed, rolled back provisioning record");
                Err(TransitionError::Backend(e))
            }
        }
    }

    /// Transition 2: register completion. Called by a reconciler with the
    /// hosting service's runner listing; promotes any matching
    /// provisioning record to `idle`.
    #[instrument(skip(self, external))]
    pub async fn observe_registration(&self, external: &[SelfHostedRunner]) -> usize {
        let mut promoted = 0;
        for ext in external {
            let Some(snapshot) = self.store.find(&ext.name).await else {
                continue;
            };
            if !snapshot.is_provisioning() {
                continue;
            }

            let _guard = self.runner_locks.lock(&snapshot.name).await;
            let Some(mut runner) = self.store.find(&snapshot.name).await else {
                continue;
            };
            if !runner.is_provisioning() || !runner.status.allows_transition_to(RunnerStatus::Idle) {
                continue;
            }

            runner.status = RunnerStatus::Idle;
            runner.external_id = Some(ext.id.0 as i64);
            match self.store.save(runner).await {
                Ok(()) => {
                    promoted += 1;
                    tracing::info!(runner = %ext.name, external_id = ext.id.0, "runner registered");
                }
                Err(e) => tracing::warn!(runner = %ext.name, error = %e, "failed to persist registration"),
            }
        }
        promoted
    }

    /// Transition 3: pickup. A `workflow_job.in_progress` event may arrive
    /// before the runner's record has reached `idle` (the runner itself
    /// registers asynchronously at boot); retry with bounded backoff before
    /// discarding.
    #[instrument(skip(self, workflow, repository), fields(runner = %runner_name))]
    pub async fn pickup(
        &self,
        runner_name: &str,
        workflow: Option<String>,
        repository: Option<String>,
    ) -> Result<(), TransitionError> {
        for attempt in 0..PICKUP_RETRY_ATTEMPTS {
            let _guard = self.runner_locks.lock(runner_name).await;
            let Some(mut runner) = self.store.find(runner_name).await else {
                drop(_guard);
                tokio::time::sleep(PICKUP_RETRY_SPACING).await;
                continue;
            };

            if runner.status == RunnerStatus::Busy {
                // Duplicate delivery of the same event: no-op, pickup_at is
                // not overwritten.
                return Ok(());
            }
            if runner.status != RunnerStatus::Idle {
                if !runner.status.allows_transition_to(RunnerStatus::Busy) {
                    tracing::info!(attempt, "dropping out-of-order in_progress event");
                    return Ok(());
                }
                drop(_guard);
                tokio::time::sleep(PICKUP_RETRY_SPACING).await;
                continue;
            }

            runner.status = RunnerStatus::Busy;
            runner.busy = true;
            runner.pickup_at = Some(chrono::Utc::now());
            runner.workflow = workflow;
            runner.repository = repository;
            self.store
                .save(runner)
                .await
                .map_err(|e| TransitionError::InvariantViolation(e.to_string()))?;
            tracing::info!("runner picked up a job");
            return Ok(());
        }

        tracing::warn!(
            attempts = PICKUP_RETRY_ATTEMPTS,
            "discarding in_progress event: runner never reached idle"
        );
        Ok(())
    }

    /// Transition 4: finish. `workflow_job.completed` matching → busy →
    /// completed.
    #[instrument(skip(self), fields(runner = %runner_name))]
    pub async fn finish(&self, runner_name: &str) -> Result<(), TransitionError> {
        let _guard = self.runner_locks.lock(runner_name).await;
        let Some(mut runner) = self.store.find(runner_name).await else {
            return Ok(());
        };

        if runner.status == RunnerStatus::Completed {
            return Ok(());
        }
        if !runner.status.allows_transition_to(RunnerStatus::Completed) {
            tracing::info!("dropping out-of-order completed event");
            return Ok(());
        }

        runner.status = RunnerStatus::Completed;
        runner.completed_at = Some(chrono::Utc::now());
        self.store
            .save(runner)
            .await
            .map_err(|e| TransitionError::InvariantViolation(e.to_string()))?;
        tracing::info!("runner finished its job");
        Ok(())
    }

    /// Transition 5: delete. Deregisters from the hosting service (ignoring
    /// NotFound), deletes the backend instance, then removes the record
    /// from the store — in that order, so the hosting service stops
    /// advertising the runner before the instance dies.
    ///
    /// Idempotent across all error paths: a runner already missing from
    /// the store is treated as already deleted.
    #[instrument(skip(self), fields(runner = %runner_name))]
    pub async fn delete(&self, runner_name: &str) -> Result<(), TransitionError> {
        self.delete_inner(runner_name, true).await
    }

    /// Variant of [`Self::delete`] used by the healthcheck reconciler for a
    /// runner whose backend instance it has already confirmed is gone
    /// (`get` returned `NotFound`): deregister and drop the store record
    /// without issuing a redundant backend `delete` call.
    #[instrument(skip(self), fields(runner = %runner_name))]
    pub async fn delete_skip_backend(&self, runner_name: &str) -> Result<(), TransitionError> {
        self.delete_inner(runner_name, false).await
    }

    async fn delete_inner(&self, runner_name: &str, call_backend: bool) -> Result<(), TransitionError> {
        let _guard = self.runner_locks.lock(runner_name).await;
        let Some(runner) = self.store.find(runner_name).await else {
            return Ok(());
        };

        if let Some(external_id) = runner.external_id {
            self.github
                .deregister(&runner.organization, external_id)
                .await?;
        }

        if call_backend {
            if let Some(group) = self.groups.get(&runner.group) {
                group.backend.delete(&self.manager_name, &runner).await?;
            }
        }

        self.store.delete(runner_name).await;
        tracing::info!("runner deleted");
        Ok(())
    }

    /// Transition 5 variant used by the indexing reconciler for a backend
    /// instance carrying the manager's label but with no store record:
    /// deletes directly from the backend without consulting the store.
    #[instrument(skip(self, group_name), fields(group = %group_name))]
    pub async fn delete_orphan_instance(
        &self,
        group_name: &str,
        runner: &Runner,
    ) -> Result<(), TransitionError> {
        if let Some(group) = self.groups.get(group_name) {
            group.backend.delete(&self.manager_name, runner).await?;
        }
        Ok(())
    }

    /// Transition 6: timeout. Evaluated by the healthcheck reconciler: a
    /// runner stuck in `provisioning` beyond `timeout_runner`, or
    /// `idle`/`busy` older than `time_to_live`, is moved to delete.
    pub fn is_timed_out(runner: &Runner, timeout_runner: Duration, time_to_live: Duration) -> bool {
        let age = runner.age();
        if runner.is_provisioning() {
            return age > chrono::Duration::from_std(timeout_runner).unwrap_or_default();
        }
        matches!(runner.status, RunnerStatus::Idle | RunnerStatus::Busy)
            && age > chrono::Duration::from_std(time_to_live).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, LocalProcessConfig};
    use crate::github::GitHubConfig;
    use crate::store::InMemoryStore;

    fn group_handle(min: u32, max: u32) -> GroupHandle {
        let config = RunnerGroup {
            name: "default".into(),
            organization: "octo-org".into(),
            backend: BackendConfig::LocalProcess(LocalProcessConfig {
                command: "sleep".into(),
                args: vec!["30".into()],
            }),
            labels: vec!["self-hosted".into()],
            min,
            max,
            allow_list: vec![],
            github_runner_group_id: 1,
            spot: false,
        };
        let backend = config.backend.build().unwrap();
        GroupHandle {
            config,
            backend: Arc::from(backend),
        }
    }

    fn manager(groups: HashMap<String, GroupHandle>) -> LifecycleManager {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let github = Arc::new(GitHubClient::new(
            GitHubConfig {
                base_url: None,
                token: Some("tok".into()),
                app_id: None,
                installation_id: None,
                private_key: None,
                client_id: None,
                client_secret: None,
                webhook_secret: Some("secret".into()),
            },
            "test-manager",
        ));
        LifecycleManager::new("test-manager".into(), store, github, groups)
    }

    #[tokio::test]
    async fn delete_of_unknown_runner_is_idempotent_noop() {
        let mut groups = HashMap::new();
        groups.insert("default".into(), group_handle(0, 1));
        let mgr = manager(groups);
        mgr.delete("gha-missing").await.unwrap();
        mgr.delete("gha-missing").await.unwrap();
    }

    #[tokio::test]
    async fn finish_is_a_noop_once_completed() {
        let mut groups = HashMap::new();
        groups.insert("default".into(), group_handle(0, 1));
        let mgr = manager(groups);

        let mut runner = Runner::new_provisioning(
            "gha-aaaaa".into(),
            "default".into(),
            "octo-org".into(),
            vec!["self-hosted".into()],
        );
        runner.status = RunnerStatus::Busy;
        runner.busy = true;
        runner.external_id = Some(1);
        mgr.store.save(runner).await.unwrap();

        mgr.finish("gha-aaaaa").await.unwrap();
        mgr.finish("gha-aaaaa").await.unwrap();

        let r = mgr.store.find("gha-aaaaa").await.unwrap();
        assert_eq!(r.status, RunnerStatus::Completed);
    }

    #[tokio::test]
    async fn finish_drops_out_of_order_event_after_completion() {
        let mut groups = HashMap::new();
        groups.insert("default".into(), group_handle(0, 1));
        let mgr = manager(groups);

        let mut runner = Runner::new_provisioning(
            "gha-bbbbb".into(),
            "default".into(),
            "octo-org".into(),
            vec!["self-hosted".into()],
        );
        runner.status = RunnerStatus::Completed;
        runner.busy = false;
        runner.external_id = Some(2);
        mgr.store.save(runner).await.unwrap();

        // A stray in_progress->completed replay must not un-terminal the
        // runner; finish() keeps it at completed, never regresses.
        mgr.finish("gha-bbbbb").await.unwrap();
        let r = mgr.store.find("gha-bbbbb").await.unwrap();
        assert_eq!(r.status, RunnerStatus::Completed);
    }

    #[test]
    fn timeout_applies_to_stuck_provisioning_runners() {
        let mut runner = Runner::new_provisioning(
            "gha-ccccc".into(),
            "default".into(),
            "octo-org".into(),
            vec!["self-hosted".into()],
        );
        runner.created_at = chrono::Utc::now() - chrono::Duration::minutes(20);
        assert!(LifecycleManager::is_timed_out(
            &runner,
            Duration::from_secs(15 * 60),
            Duration::from_secs(12 * 3600),
        ));
    }

    #[test]
    fn timeout_does_not_apply_to_fresh_runners() {
        let runner = Runner::new_provisioning(
            "gha-ddddd".into(),
            "default".into(),
            "octo-org".into(),
            vec!["self-hosted".into()],
        );
        assert!(!LifecycleManager::is_timed_out(
            &runner,
            Duration::from_secs(15 * 60),
            Duration::from_secs(12 * 3600),
        ));
    }
}
