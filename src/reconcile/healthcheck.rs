//! Healthcheck reconciler (default interval 15 min): for each persisted
//! runner, evaluate age-based timeout and move expired ones to delete;
//! additionally, runners whose backend `get` returns `NotFound` and whose
//! status is not `provisioning` are reconciled as orphans.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backend::BackendError;
use crate::lifecycle::LifecycleManager;
use crate::runner::RunnerStatus;

use super::run_periodic;

#[instrument(skip(lifecycle))]
async fn tick(lifecycle: &LifecycleManager, timeout_runner: Duration, time_to_live: Duration) {
    for runner in lifecycle.store().all().await {
        if matches!(runner.status, RunnerStatus::Completed) {
            // Already terminal; the finish()->delete() path (or the next
            // indexing pass) will remove it. Healthcheck only evaluates age.
            continue;
        }

        if LifecycleManager::is_timed_out(&runner, timeout_runner, time_to_live) {
            tracing::info!(runner = %runner.name, age_seconds = runner.age().num_seconds(), "runner timed out");
            if let Err(e) = lifecycle.delete(&runner.name).await {
                tracing::error!(runner = %runner.name, error = %e, "failed to delete timed-out runner");
            }
            continue;
        }

        if runner.is_provisioning() {
            // Not timed out yet and has no instance_id invariant issue to
            // check against the backend.
            continue;
        }

        let Some(group) = lifecycle.groups().get(&runner.group) else {
            continue;
        };
        let Some(instance_id) = &runner.instance_id else {
            continue;
        };

        match group.backend.get(lifecycle.manager_name(), instance_id).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => {
                tracing::info!(runner = %runner.name, "backend instance missing, reconciling as orphan");
                if let Err(e) = lifecycle.delete_skip_backend(&runner.name).await {
                    tracing::error!(runner = %runner.name, error = %e, "failed to reconcile orphaned runner");
                }
            }
            Err(e) => {
                tracing::warn!(runner = %runner.name, error = %e, "backend get failed, will retry next tick");
            }
        }
    }
}

pub async fn run_healthcheck(
    lifecycle: &LifecycleManager,
    interval: Duration,
    timeout_runner: Duration,
    time_to_live: Duration,
    shutdown: CancellationToken,
) {
    run_periodic(interval, shutdown, || tick(lifecycle, timeout_runner, time_to_live)).await;
}
