//! `RunnerGroup`: a named pool with a backend, a label set, sizing, and
//! group-local policy.

use serde::Deserialize;

use crate::backend::BackendConfig;
use crate::error::ConfigError;

/// Configuration for a single runner group, as parsed from the `runner_groups`
/// sequence in the YAML config.
#[derive(Clone, Debug, Deserialize)]
pub struct RunnerGroup {
    pub name: String,
    pub organization: String,
    pub backend: BackendConfig,
    pub labels: Vec<String>,
    pub min: u32,
    pub max: u32,
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// GitHub runner-group id this pool registers new runners into.
    pub github_runner_group_id: u64,
    #[serde(default)]
    pub spot: bool,
}

impl RunnerGroup {
    /// Parse-then-construct validation: invariants are checked once at
    /// startup rather than at each read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.labels.is_empty() {
            return Err(ConfigError::EmptyLabels(self.name.clone()));
        }
        if self.min > self.max {
            return Err(ConfigError::MinExceedsMax {
                group: self.name.clone(),
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn allows_repository(&self, repo: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.iter().any(|r| r == repo)
    }

    /// The label used to scope hosting-service runner listings to this
    /// group.
    pub fn primary_label(&self) -> &str {
        &self.labels[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, LocalProcessConfig};

    fn group(min: u32, max: u32, labels: Vec<&str>) -> RunnerGroup {
        RunnerGroup {
            name: "default".into(),
            organization: "octo-org".into(),
            backend: BackendConfig::LocalProcess(LocalProcessConfig {
                command: "true".into(),
                args: vec![],
            }),
            labels: labels.into_iter().map(String::from).collect(),
            min,
            max,
            allow_list: vec![],
            github_runner_group_id: 1,
            spot: false,
        }
    }

    #[test]
    fn rejects_empty_labels() {
        assert!(matches!(
            group(0, 1, vec![]).validate(),
            Err(ConfigError::EmptyLabels(_))
        ));
    }

    #[test]
    fn rejects_min_over_max() {
        assert!(matches!(
            group(2, 1, vec!["self-hosted"]).validate(),
            Err(ConfigError::MinExceedsMax { .. })
        ));
    }

    #[test]
    fn allow_list_empty_means_any_repository() {
        let g = group(0, 1, vec!["self-hosted"]);
        assert!(g.allows_repository("octo-org/anything"));
    }
}
