//! Virtual-machine backend adapter over OpenStack Compute.
//!
//! Maintains a lazily-authenticated session (auth on first use, token
//! refresh near expiry) and maps instance metadata to and from the
//! `Runner`/`Backend` contract.

use std::borrow::Cow;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::TimeDelta;
use openstack_sdk::{
    AsyncOpenStack,
    api::{self, QueryAsync, compute::v2::server::{create_20, delete, list_detailed}},
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use openstack_types::compute::v2::server::response::{
    create::ServerResponse as CreateServerResponse,
    list_detailed::ServerResponse as ListServerResponse,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::instrument;

use crate::cloud_config;
use crate::error::ConfigError;
use crate::runner::{Runner, RunnerStatus};

use super::{Backend, BackendError, sanitize_label_value};

#[derive(Clone, Debug, Deserialize)]
pub struct OpenstackConfig {
    /// Name of the `clouds.yaml` profile to authenticate with.
    pub cloud: String,
    pub image: String,
    pub flavor: String,
    pub network: String,
    pub key_name: String,
    pub runner_user: String,
    pub runner_group: String,
}

/// Lazily-authenticated OpenStack session, guarded for interior mutability
/// since [`Backend`] methods take `&self`.
pub struct OpenstackBackend {
    config: OpenstackConfig,
    session: Mutex<Option<AsyncOpenStack>>,
}

impl OpenstackBackend {
    pub fn new(config: OpenstackConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config,
            session: Mutex::new(None),
        })
    }

    #[instrument(skip(self), fields(cloud = %self.config.cloud))]
    async fn authenticated_session(&self) -> Result<AsyncOpenStack, BackendError> {
        // Sessions aren't `Clone`-cheap across await points under a sync
        // mutex, so we re-authenticate (or refresh) under the lock each
        // call; `AsyncOpenStack::authorize` is itself cheap when the token
        // isn't near expiry.
        let profile = ConfigFile::new()
            .and_then(|f| f.get_cloud_config(&self.config.cloud))
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?
            .ok_or_else(|| BackendError::InvalidConfig(format!("unknown cloud {:?}", self.config.cloud)))?;

        let existing = self.session.lock().take();
        let mut session = match existing {
            Some(s) => s,
            None => AsyncOpenStack::new(&profile)
                .await
                .map_err(|e| BackendError::BackendUnavailable(e.to_string()))?,
        };

        match session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) | None => {
                session
                    .authorize(None, false, true)
                    .await
                    .map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;
                session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await
                    .map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;
            }
            _ => {}
        }

        Ok(session)
    }

    fn put_back(&self, session: AsyncOpenStack) {
        *self.session.lock() = Some(session);
    }

    fn instance_name(&self, runner: &Runner) -> String {
        runner.name.clone()
    }

    fn from_server(&self, manager: &str, group: &str, server: &ListServerResponse) -> Runner {
        let status = match server.status.as_deref() {
            Some("ACTIVE") => RunnerStatus::Online,
            _ => RunnerStatus::Offline,
        };
        let mut runner = Runner::new_provisioning(
            server.name.clone(),
            group.to_string(),
            String::new(),
            vec![],
        );
        runner.instance_id = Some(server.id.clone());
        runner.status = status;
        let _ = manager;
        runner
    }
}

#[async_trait]
impl Backend for OpenstackBackend {
    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn create(&self, manager: &str, mut runner: Runner) -> Result<Runner, BackendError> {
        let jit_config = runner
            .encoded_jit_config
            .clone()
            .ok_or_else(|| BackendError::InvalidConfig("runner has no jit config".into()))?;

        let cloud_init = cloud_config::Data::from_jit_config(&jit_config, &self.config);
        let user_data = cloud_init
            .to_user_data()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;

        let mut labels = std::collections::BTreeMap::new();
        labels.insert(
            "manager".to_string(),
            sanitize_label_value(&serde_json::Value::String(manager.to_string())),
        );
        labels.insert(
            "group".to_string(),
            sanitize_label_value(&serde_json::Value::String(runner.group.clone())),
        );

        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(self.instance_name(&runner))
                    .image_ref(&self.config.image)
                    .flavor_ref(&self.config.flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default()
                            .uuid(&self.config.network)
                            .build()
                            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?,
                    ])
                    .key_name(&self.config.key_name)
                    .metadata(labels)
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()
                    .map_err(|e| BackendError::InvalidConfig(e.to_string()))?,
            )
            .build()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;

        let session = self.authenticated_session().await?;
        let response: Result<CreateServerResponse, _> = ep.query_async(&session).await;
        self.put_back(session);
        let response = response.map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;

        runner.instance_id = Some(response.id.clone());
        runner.status = RunnerStatus::Offline;
        runner.encoded_jit_config = None;
        tracing::info!(instance_id = %response.id, "spawned openstack instance");
        Ok(runner)
    }

    #[instrument(skip(self, runner), fields(runner_name = %runner.name))]
    async fn delete(&self, manager: &str, runner: &Runner) -> Result<(), BackendError> {
        let Some(instance_id) = &runner.instance_id else {
            // Idempotent: nothing was ever provisioned.
            return Ok(());
        };

        match self.get(manager, instance_id).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let session = self.authenticated_session().await?;
        let ep = delete::Request::builder()
            .id(instance_id)
            .build()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        let result = api::ignore(ep).query_async(&session).await;
        self.put_back(session);
        result.map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, _manager: &str, runner: &Runner) -> Result<Runner, BackendError> {
        // Labels are fixed at spawn time and never re-applied post-create,
        // so update is a pass-through.
        Ok(runner.clone())
    }

    #[instrument(skip(self))]
    async fn get(&self, manager: &str, instance_id: &str) -> Result<Runner, BackendError> {
        let instances = self.list(manager, "").await?;
        instances
            .into_iter()
            .find(|r| r.instance_id.as_deref() == Some(instance_id))
            .ok_or_else(|| BackendError::NotFound(instance_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn list(&self, manager: &str, group: &str) -> Result<Vec<Runner>, BackendError> {
        let session = self.authenticated_session().await?;
        let ep = list_detailed::Request::builder()
            .build()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        let data: Result<Vec<ListServerResponse>, _> = ep.query_async(&session).await;
        self.put_back(session);
        let data = data.map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;

        Ok(data
            .iter()
            .filter(|s| s.metadata.get("manager").map(String::as_str) == Some(manager))
            .filter(|s| group.is_empty() || s.metadata.get("group").map(String::as_str) == Some(group))
            .map(|s| self.from_server(manager, group, s))
            .collect())
    }
}
