//! Hosting-service client: registration, deregistration, listing, and
//! just-in-time config issuance against the Git hosting service, with
//! token or app-installation authentication.
//!
//! The organization is per-[`crate::runner_group::RunnerGroup`], not
//! global, so every operation here takes it as a parameter rather than
//! storing one in [`GitHubConfig`].

use std::time::Duration;

use backoff::{ExponentialBackoff, future::retry};
use jsonwebtoken::EncodingKey;
use octocrab::{
    Octocrab,
    models::{
        AppId, InstallationId, RunnerGroupId,
        actions::{SelfHostedRunner, SelfHostedRunnerJitConfig},
    },
};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum HostingServiceError {
    #[error("transient hosting-service error: {0}")]
    Transient(String),

    #[error("hosting service rejected the request: {0}")]
    UpstreamRejected(String),

    #[error("no hosting-service authentication configured")]
    ConfigMissingAuth,

    #[error("invalid app-installation credentials: {0}")]
    InvalidAppCredentials(String),

    #[error("hosting-service resource not found: {0}")]
    NotFound(String),
}

/// Token or app-installation auth; app-installation is preferred when all
/// three required fields are present. Field names match the flat
/// `github_*` configuration keys via `serde(rename)`.
#[derive(Clone, Debug, Deserialize)]
pub struct GitHubConfig {
    #[serde(default, rename = "github_base_url")]
    pub base_url: Option<String>,
    #[serde(default, rename = "github_token")]
    pub token: Option<String>,
    #[serde(default, rename = "github_app_id")]
    pub app_id: Option<u64>,
    #[serde(default, rename = "github_installation_id")]
    pub installation_id: Option<u64>,
    #[serde(default, rename = "github_private_key")]
    pub private_key: Option<String>,
    #[serde(default, rename = "github_client_id")]
    pub client_id: Option<String>,
    #[serde(default, rename = "github_client_secret")]
    pub client_secret: Option<String>,
    #[serde(default, rename = "github_webhook_secret")]
    pub webhook_secret: Option<String>,
}

impl GitHubConfig {
    fn prefers_app_installation(&self) -> bool {
        self.app_id.is_some() && self.installation_id.is_some() && self.private_key.is_some()
    }

    pub fn validate(&self) -> Result<(), HostingServiceError> {
        if !self.prefers_app_installation() && self.token.is_none() {
            return Err(HostingServiceError::ConfigMissingAuth);
        }
        Ok(())
    }
}

pub struct GitHubClient {
    config: GitHubConfig,
    /// Name prefix used to scope org-wide runner listings to this manager
    /// (GitHub's runner-list API has no manager-ownership tag of its own).
    manager_prefix: String,
}

const RETRY_BUDGET: Duration = Duration::from_secs(60);

impl GitHubClient {
    pub fn new(config: GitHubConfig, manager_name: &str) -> Self {
        Self {
            config,
            manager_prefix: format!("{manager_name}-"),
        }
    }

    fn client(&self) -> Result<Octocrab, HostingServiceError> {
        let mut builder = Octocrab::builder();
        if let Some(base_url) = &self.config.base_url {
            builder = builder
                .base_uri(base_url.as_str())
                .map_err(|e| HostingServiceError::InvalidAppCredentials(e.to_string()))?;
        }

        if self.config.prefers_app_installation() {
            let app_id = self.config.app_id.expect("checked by prefers_app_installation");
            let installation_id = self
                .config
                .installation_id
                .expect("checked by prefers_app_installation");
            let private_key = self
                .config
                .private_key
                .as_ref()
                .expect("checked by prefers_app_installation");
            let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
                .map_err(|e| HostingServiceError::InvalidAppCredentials(e.to_string()))?;

            let app_client = builder
                .app(AppId(app_id), key)
                .build()
                .map_err(|e| HostingServiceError::InvalidAppCredentials(e.to_string()))?;
            return Ok(app_client.installation(InstallationId(installation_id)));
        }

        if let Some(token) = &self.config.token {
            return builder
                .personal_token(token.clone())
                .build()
                .map_err(|e| HostingServiceError::InvalidAppCredentials(e.to_string()));
        }

        Err(HostingServiceError::ConfigMissingAuth)
    }

    fn classify(err: octocrab::Error) -> backoff::Error<HostingServiceError> {
        if let octocrab::Error::GitHub { source, .. } = &err {
            let status = source.status_code;
            if status.is_server_error() || status.as_u16() == 429 {
                return backoff::Error::transient(HostingServiceError::Transient(err.to_string()));
            }
            if status.as_u16() == 404 {
                return backoff::Error::permanent(HostingServiceError::NotFound(err.to_string()));
            }
        }
        backoff::Error::permanent(HostingServiceError::UpstreamRejected(err.to_string()))
    }

    fn backoff_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(RETRY_BUDGET),
            ..Default::default()
        }
    }

    /// List runners registered under this manager in `org`, optionally
    /// filtered to those carrying `filter_label` (a reconciler scoping a
    /// listing to one group's label).
    #[instrument(skip(self), fields(org = %org))]
    pub async fn list(&self, org: &str, filter_label: Option<&str>) -> Result<Vec<SelfHostedRunner>, HostingServiceError> {
        let org = org.to_string();
        let prefix = self.manager_prefix.clone();
        let filter_label = filter_label.map(str::to_string);

        retry(Self::backoff_policy(), || {
            let org = org.clone();
            let prefix = prefix.clone();
            let filter_label = filter_label.clone();
            async move {
                let octocrab = self.client().map_err(backoff::Error::permanent)?;
                let mut runners = vec![];
                let mut page = octocrab
                    .actions()
                    .list_org_self_hosted_runners(&org)
                    .send()
                    .await
                    .map_err(Self::classify)?;

                loop {
                    for runner in &page.items {
                        if !runner.name.starts_with(&prefix) {
                            continue;
                        }
                        if filter_label.is_none()
                            || filter_label.as_ref().is_some_and(|label| {
                                runner.labels.iter().any(|l| &l.name == label)
                            })
                        {
                            runners.push(runner.clone());
                        }
                    }
                    page = match octocrab.get_page(&page.next).await.map_err(Self::classify)? {
                        Some(next) => next,
                        None => break,
                    };
                }
                Ok(runners)
            }
        })
        .await
    }

    /// Issue a just-in-time config blob for a new runner being created.
    #[instrument(skip(self, labels), fields(org = %org, name = %name, group_id = %group_id))]
    pub async fn generate_jit_config(
        &self,
        org: &str,
        name: String,
        group_id: u64,
        labels: Vec<String>,
    ) -> Result<SelfHostedRunnerJitConfig, HostingServiceError> {
        let org = org.to_string();
        retry(Self::backoff_policy(), || {
            let org = org.clone();
            let name = name.clone();
            let labels = labels.clone();
            async move {
                let octocrab = self.client().map_err(backoff::Error::permanent)?;
                octocrab
                    .actions()
                    .create_org_jit_runner_config(&org, name, RunnerGroupId(group_id), labels)
                    .send()
                    .await
                    .map_err(Self::classify)
            }
        })
        .await
    }

    /// Deregister a runner by its hosting-service id. Idempotent: NotFound
    /// is treated as success.
    #[instrument(skip(self), fields(org = %org, external_id = %external_id))]
    pub async fn deregister(&self, org: &str, external_id: i64) -> Result<(), HostingServiceError> {
        let org = org.to_string();
        let result = retry(Self::backoff_policy(), || {
            let org = org.clone();
            async move {
                let octocrab = self.client().map_err(backoff::Error::permanent)?;
                octocrab
                    .actions()
                    .delete_org_runner(&org, external_id)
                    .await
                    .map_err(Self::classify)
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(HostingServiceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>, app_id: Option<u64>, installation_id: Option<u64>, key: Option<&str>) -> GitHubConfig {
        GitHubConfig {
            base_url: None,
            token: token.map(String::from),
            app_id,
            installation_id,
            private_key: key.map(String::from),
            client_id: None,
            client_secret: None,
            webhook_secret: None,
        }
    }

    #[test]
    fn app_installation_preferred_when_all_fields_present() {
        let cfg = config(Some("tok"), Some(1), Some(2), Some("key"));
        assert!(cfg.prefers_app_installation());
    }

    #[test]
    fn falls_back_to_token_when_app_fields_incomplete() {
        let cfg = config(Some("tok"), Some(1), None, None);
        assert!(!cfg.prefers_app_installation());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_both_auth_methods_fails_validation() {
        let cfg = config(None, None, None, None);
        assert!(matches!(cfg.validate(), Err(HostingServiceError::ConfigMissingAuth)));
    }
}
