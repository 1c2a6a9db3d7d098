//! Startup reconciler: runs once on boot and whenever group configuration
//! changes. For every group, computes
//! `need = max(0, min_runners - current_count)` and issues that many
//! create transitions.

use futures::{StreamExt, stream};
use tracing::instrument;

use crate::lifecycle::LifecycleManager;

/// Concurrency cap on in-flight `create` calls per invocation.
const CREATE_CONCURRENCY: usize = 4;

#[instrument(skip(lifecycle))]
pub async fn run_startup_once(lifecycle: &LifecycleManager) {
    for (name, handle) in lifecycle.groups() {
        let current = lifecycle
            .store()
            .find_by_group(name)
            .await
            .iter()
            .filter(|r| !matches!(r.status, crate::runner::RunnerStatus::Completed))
            .count();

        let need = handle.config.min.saturating_sub(current as u32);
        if need == 0 {
            tracing::debug!(group = %name, current, min = handle.config.min, "group already at minimum");
            continue;
        }

        tracing::info!(group = %name, need, current, min = handle.config.min, "provisioning to minimum");

        let results = stream::iter(0..need)
            .map(|_| lifecycle.create(name))
            .buffer_unordered(CREATE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(group = %name, failed, requested = need, "some startup creates failed, will retry next tick");
        }
    }
}
