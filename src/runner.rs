//! The `Runner` entity and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A runner's position in the lifecycle state machine.
///
/// Transitions are driven exclusively by [`crate::lifecycle::LifecycleManager`];
/// every other component only reads this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Offline,
    Online,
    Idle,
    Busy,
    Completed,
}

impl RunnerStatus {
    /// Forward progress order used to discard out-of-order webhook events.
    fn rank(self) -> u8 {
        match self {
            RunnerStatus::Offline => 0,
            RunnerStatus::Online => 1,
            RunnerStatus::Idle => 1,
            RunnerStatus::Busy => 2,
            RunnerStatus::Completed => 3,
        }
    }

    /// Whether `self -> next` is a forward (or same-state, idempotent)
    /// transition. A strictly backward transition must be discarded.
    pub fn allows_transition_to(self, next: RunnerStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerStatus::Offline => "offline",
            RunnerStatus::Online => "online",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A runner entity, persisted in the [`crate::store::RunnerStore`].
///
/// Field invariants, enforced by [`crate::lifecycle::LifecycleManager`]
/// rather than by the store:
/// - `busy == true` implies `status` is `Online` or `Busy` and `external_id` is set.
/// - `status` in `{Online, Idle, Busy}` implies `external_id` is set.
/// - `status != Offline` implies `instance_id` is set.
/// - `pickup_at >= created_at`, `completed_at >= pickup_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    /// Manager-assigned identity; stable for the runner's whole life.
    pub name: String,
    pub group: String,
    pub organization: String,
    pub labels: Vec<String>,
    pub status: RunnerStatus,
    pub busy: bool,

    /// Hosting-service identifier, assigned at registration.
    pub external_id: Option<i64>,
    /// Backend instance identifier, assigned at create.
    pub instance_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Single-use just-in-time config blob. Cleared once the backend `create`
    /// call that consumes it returns.
    pub encoded_jit_config: Option<String>,

    /// Labels captured off the `workflow_job` webhook at pickup time, kept
    /// for operational visibility (not part of the state machine).
    pub workflow: Option<String>,
    pub repository: Option<String>,
}

impl Runner {
    /// Construct a runner freshly entering `provisioning`: no external id,
    /// no instance id yet (the backend `create` call assigns the latter).
    pub fn new_provisioning(name: String, group: String, organization: String, labels: Vec<String>) -> Self {
        Self {
            name,
            group,
            organization,
            labels,
            status: RunnerStatus::Offline,
            busy: false,
            external_id: None,
            instance_id: None,
            created_at: Utc::now(),
            pickup_at: None,
            completed_at: None,
            encoded_jit_config: None,
            workflow: None,
            repository: None,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn is_provisioning(&self) -> bool {
        self.status == RunnerStatus::Offline
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(RunnerStatus::Idle.allows_transition_to(RunnerStatus::Busy));
        assert!(RunnerStatus::Busy.allows_transition_to(RunnerStatus::Completed));
        assert!(RunnerStatus::Busy.allows_transition_to(RunnerStatus::Busy));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!RunnerStatus::Completed.allows_transition_to(RunnerStatus::Busy));
        assert!(!RunnerStatus::Busy.allows_transition_to(RunnerStatus::Idle));
    }

    #[test]
    fn new_provisioning_runner_satisfies_invariants() {
        let r = Runner::new_provisioning(
            "gha-abcde".into(),
            "default".into(),
            "octo-org".into(),
            vec!["self-hosted".into()],
        );
        assert_eq!(r.status, RunnerStatus::Offline);
        assert!(!r.busy);
        assert!(r.external_id.is_none());
        assert!(r.instance_id.is_none());
    }
}
