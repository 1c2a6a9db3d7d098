//! Runner store: a persisted index of runner entities keyed by identity,
//! with secondary lookup by status, group, instance id, external id, and
//! label.
//!
//! The store contract models a process-external index; the only concrete
//! implementation shipped here is in-process, guarded by `parking_lot`, and
//! reached through the same async trait a networked store would implement.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::runner::{Runner, RunnerStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("runner {0:?} already exists")]
    DuplicateName(String),

    #[error("instance id {0:?} already in use by another runner")]
    DuplicateInstanceId(String),

    #[error("external id {0} already in use by another runner")]
    DuplicateExternalId(i64),
}

/// The store enforces identity/instance-id/external-id uniqueness but not
/// the lifecycle invariants — those are the lifecycle manager's job.
#[async_trait]
pub trait RunnerStore: Send + Sync {
    async fn save(&self, runner: Runner) -> Result<(), StoreError>;
    async fn find(&self, name: &str) -> Option<Runner>;
    async fn delete(&self, name: &str) -> Option<Runner>;
    async fn all(&self) -> Vec<Runner>;

    async fn find_by_group(&self, group: &str) -> Vec<Runner>;
    async fn find_by_status(&self, status: RunnerStatus) -> Vec<Runner>;
    async fn find_by_instance_id(&self, instance_id: &str) -> Option<Runner>;
    async fn find_by_external_id(&self, external_id: i64) -> Option<Runner>;
    async fn find_by_label(&self, label: &str) -> Vec<Runner>;
}

#[derive(Default)]
struct Index {
    runners: HashMap<String, Runner>,
}

pub struct InMemoryStore {
    inner: RwLock<Index>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Index::default()),
        }
    }
}

#[async_trait]
impl RunnerStore for InMemoryStore {
    async fn save(&self, runner: Runner) -> Result<(), StoreError> {
        let mut index = self.inner.write();

        if let Some(instance_id) = &runner.instance_id {
            if let Some(existing) = index
                .runners
                .values()
                .find(|r| r.name != runner.name && r.instance_id.as_deref() == Some(instance_id.as_str()))
            {
                let _ = existing;
                return Err(StoreError::DuplicateInstanceId(instance_id.clone()));
            }
        }
        if let Some(external_id) = runner.external_id {
            if index
                .runners
                .values()
                .any(|r| r.name != runner.name && r.external_id == Some(external_id))
            {
                return Err(StoreError::DuplicateExternalId(external_id));
            }
        }

        index.runners.insert(runner.name.clone(), runner);
        Ok(())
    }

    async fn find(&self, name: &str) -> Option<Runner> {
        self.inner.read().runners.get(name).cloned()
    }

    async fn delete(&self, name: &str) -> Option<Runner> {
        self.inner.write().runners.remove(name)
    }

    async fn all(&self) -> Vec<Runner> {
        self.inner.read().runners.values().cloned().collect()
    }

    async fn find_by_group(&self, group: &str) -> Vec<Runner> {
        self.inner
            .read()
            .runners
            .values()
            .filter(|r| r.group == group)
            .cloned()
            .collect()
    }

    async fn find_by_status(&self, status: RunnerStatus) -> Vec<Runner> {
        self.inner
            .read()
            .runners
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    async fn find_by_instance_id(&self, instance_id: &str) -> Option<Runner> {
        self.inner
            .read()
            .runners
            .values()
            .find(|r| r.instance_id.as_deref() == Some(instance_id))
            .cloned()
    }

    async fn find_by_external_id(&self, external_id: i64) -> Option<Runner> {
        self.inner
            .read()
            .runners
            .values()
            .find(|r| r.external_id == Some(external_id))
            .cloned()
    }

    async fn find_by_label(&self, label: &str) -> Vec<Runner> {
        self.inner
            .read()
            .runners
            .values()
            .filter(|r| r.has_label(label))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(name: &str, group: &str) -> Runner {
        Runner::new_provisioning(name.into(), group.into(), "octo-org".into(), vec!["self-hosted".into()])
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let store = InMemoryStore::new();
        store.save(runner("gha-abcde", "default")).await.unwrap();
        assert!(store.find("gha-abcde").await.is_some());
        assert!(store.find("gha-zzzzz").await.is_none());
    }

    #[tokio::test]
    async fn rejects_duplicate_instance_id() {
        let store = InMemoryStore::new();
        let mut a = runner("gha-aaaaa", "default");
        a.instance_id = Some("i-1".into());
        store.save(a).await.unwrap();

        let mut b = runner("gha-bbbbb", "default");
        b.instance_id = Some("i-1".into());
        assert!(matches!(store.save(b).await, Err(StoreError::DuplicateInstanceId(_))));
    }

    #[tokio::test]
    async fn secondary_indexes_filter_correctly() {
        let store = InMemoryStore::new();
        let mut a = runner("gha-aaaaa", "pool-a");
        a.status = RunnerStatus::Idle;
        a.external_id = Some(7);
        store.save(a).await.unwrap();
        let mut b = runner("gha-bbbbb", "pool-b");
        b.status = RunnerStatus::Busy;
        store.save(b).await.unwrap();

        assert_eq!(store.find_by_group("pool-a").await.len(), 1);
        assert_eq!(store.find_by_status(RunnerStatus::Busy).await.len(), 1);
        assert_eq!(store.find_by_external_id(7).await.unwrap().name, "gha-aaaaa");
        assert_eq!(store.find_by_label("self-hosted").await.len(), 2);
    }
}
