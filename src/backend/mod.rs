//! The backend contract: an abstract create/update/delete/get/list over a
//! compute provider, plus the tagged-variant configuration that picks a
//! concrete adapter.

mod container;
mod local_process;
mod openstack;

pub use container::{ContainerBackend, ContainerConfig};
pub use local_process::{LocalProcessBackend, LocalProcessConfig};
pub use openstack::{OpenstackBackend, OpenstackConfig};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid instance configuration: {0}")]
    InvalidConfig(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("instance not found: {0}")]
    NotFound(String),
}

/// Abstract contract every compute-provider adapter implements.
///
/// Implementations MUST stamp every provisioned instance with the manager
/// name and group name as provider labels, and MUST refuse to delete any
/// instance not carrying the manager name.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create(&self, manager: &str, runner: Runner) -> Result<Runner, BackendError>;
    async fn delete(&self, manager: &str, runner: &Runner) -> Result<(), BackendError>;
    async fn update(&self, manager: &str, runner: &Runner) -> Result<Runner, BackendError>;
    async fn get(&self, manager: &str, instance_id: &str) -> Result<Runner, BackendError>;
    async fn list(&self, manager: &str, group: &str) -> Result<Vec<Runner>, BackendError>;
}

/// Tagged variant over the known backend kinds; selected by the `kind`
/// discriminator in each group's YAML `backend:` block.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Openstack(OpenstackConfig),
    Container(ContainerConfig),
    LocalProcess(LocalProcessConfig),
}

impl BackendConfig {
    /// Build the concrete adapter this configuration selects. Adapters are
    /// cheap to construct (no network I/O happens here); the OpenStack
    /// adapter lazily authenticates on first use.
    pub fn build(&self) -> Result<Box<dyn Backend>, crate::error::ConfigError> {
        Ok(match self {
            BackendConfig::Openstack(cfg) => Box::new(OpenstackBackend::new(cfg.clone())?),
            BackendConfig::Container(cfg) => Box::new(ContainerBackend::new(cfg.clone())),
            BackendConfig::LocalProcess(cfg) => Box::new(LocalProcessBackend::new(cfg.clone())),
        })
    }
}

/// Sanitize a provider label value.
///
/// Non-finite numbers and null map to the empty string; numerics are
/// printed in canonical form; leading/trailing hyphens and underscores are
/// stripped. Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize_label_value(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => {
                if let Some(i) = n.as_i64() {
                    i.to_string()
                } else {
                    f.to_string()
                }
            }
            _ => String::new(),
        },
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    raw.trim_matches(|c| c == '-' || c == '_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitizes_null_and_nan_to_empty_string() {
        assert_eq!(sanitize_label_value(&json!(null)), "");
        assert_eq!(sanitize_label_value(&serde_json::Value::from(f64::NAN)), "");
    }

    #[test]
    fn sanitizes_numerics_to_canonical_form() {
        assert_eq!(sanitize_label_value(&json!(42)), "42");
        assert_eq!(sanitize_label_value(&json!(42.0)), "42");
    }

    #[test]
    fn strips_leading_and_trailing_separators() {
        assert_eq!(sanitize_label_value(&json!("-test-")), "test");
        assert_eq!(sanitize_label_value(&json!("__test__")), "test");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for v in [json!("-test-"), json!(42), json!(42.0), json!(null), json!("test")] {
            let once = sanitize_label_value(&v);
            let twice = sanitize_label_value(&serde_json::Value::String(once.clone()));
            assert_eq!(once, twice);
        }
    }
}
