//! Indexing reconciler (default interval 1 h): three-way reconciliation
//! between the hosting service's runner list, the backend's instance list
//! (filtered by manager label), and the store, per runner group.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::lifecycle::LifecycleManager;

use super::run_periodic;

#[instrument(skip(lifecycle))]
async fn tick(lifecycle: &LifecycleManager, timeout_runner: Duration) {
    for (group_name, group) in lifecycle.groups() {
        let hosting = match lifecycle
            .github()
            .list(&group.config.organization, Some(group.config.primary_label()))
            .await
        {
            Ok(runners) => runners,
            Err(e) => {
                tracing::warn!(group = %group_name, error = %e, "failed to list hosting-service runners, skipping group this tick");
                continue;
            }
        };
        let backend_runners = match group.backend.list(lifecycle.manager_name(), group_name).await {
            Ok(runners) => runners,
            Err(e) => {
                tracing::warn!(group = %group_name, error = %e, "failed to list backend instances, skipping group this tick");
                continue;
            }
        };
        let store_runners = lifecycle.store().find_by_group(group_name).await;

        let hosting_names: HashSet<&str> = hosting.iter().map(|r| r.name.as_str()).collect();
        let backend_names: HashSet<&str> = backend_runners.iter().map(|r| r.name.as_str()).collect();
        let store_names: HashSet<&str> = store_runners.iter().map(|r| r.name.as_str()).collect();

        let all_names: HashSet<&str> = hosting_names
            .iter()
            .chain(backend_names.iter())
            .chain(store_names.iter())
            .copied()
            .collect();

        for name in all_names {
            let in_hosting = hosting_names.contains(name);
            let in_backend = backend_names.contains(name);
            let in_store = store_names.contains(name);

            match (in_store, in_backend, in_hosting) {
                (true, true, true) => {}
                (true, true, false) => {
                    let Some(runner) = store_runners.iter().find(|r| r.name == name) else {
                        continue;
                    };
                    let timeout = chrono::Duration::from_std(timeout_runner).unwrap_or_default();
                    if runner.age() > timeout {
                        tracing::info!(runner = %name, group = %group_name, "absent from hosting service beyond timeout, deleting");
                        if let Err(e) = lifecycle.delete(name).await {
                            tracing::error!(runner = %name, error = %e, "indexing delete failed");
                        }
                    }
                }
                (false, false, true) => {
                    let Some(ext) = hosting.iter().find(|r| r.name == name) else {
                        continue;
                    };
                    tracing::info!(runner = %name, group = %group_name, "present only in hosting service, deregistering");
                    if let Err(e) = lifecycle.github().deregister(&group.config.organization, ext.id.0 as i64).await {
                        tracing::error!(runner = %name, error = %e, "failed to deregister orphaned hosting-service runner");
                    }
                }
                (false, true, false) => {
                    let Some(runner) = backend_runners.iter().find(|r| r.name == name) else {
                        continue;
                    };
                    tracing::info!(runner = %name, group = %group_name, "present only in backend, deleting instance");
                    if let Err(e) = lifecycle.delete_orphan_instance(group_name, runner).await {
                        tracing::error!(runner = %name, error = %e, "failed to delete orphaned backend instance");
                    }
                }
                (true, false, false) => {
                    tracing::info!(runner = %name, group = %group_name, "present only in store, dropping record");
                    lifecycle.store().delete(name).await;
                }
                _ => {
                    tracing::debug!(
                        runner = %name, group = %group_name, in_store, in_backend, in_hosting,
                        "unreconciled combination, leaving for next tick"
                    );
                }
            }
        }
    }
}

pub async fn run_indexing(
    lifecycle: &LifecycleManager,
    interval: Duration,
    timeout_runner: Duration,
    shutdown: CancellationToken,
) {
    run_periodic(interval, shutdown, || tick(lifecycle, timeout_runner)).await;
}
