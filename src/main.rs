//! Process bootstrap: configuration loading, logging, wiring the lifecycle
//! manager and its backends/hosting-service client, and supervising the
//! reconciler loops, the webhook intake, and the management API until a
//! shutdown signal arrives.

mod backend;
mod cloud_config;
mod config;
mod error;
mod github;
mod lifecycle;
mod management;
mod reconcile;
mod runner;
mod runner_group;
mod store;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use crate::github::GitHubClient;
use crate::lifecycle::{GroupHandle, LifecycleManager};
use crate::store::InMemoryStore;

/// Graceful-shutdown deadline for in-flight reconciler ticks and the
/// webhook queue drain.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    init_logging(&settings);

    let github = Arc::new(GitHubClient::new(settings.github.clone(), &settings.name));

    let mut groups = HashMap::with_capacity(settings.runner_groups.len());
    for group in &settings.runner_groups {
        let backend = group.backend.build().context("building backend adapter")?;
        groups.insert(
            group.name.clone(),
            GroupHandle {
                config: group.clone(),
                backend: Arc::from(backend),
            },
        );
    }

    let store: Arc<dyn store::RunnerStore> = Arc::new(InMemoryStore::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        settings.name.clone(),
        store,
        github,
        groups,
    ));

    let shutdown = CancellationToken::new();

    reconcile::run_startup_once(&lifecycle).await;

    let (sender, receiver) = webhook::channel();
    let events = Arc::new(webhook::EventLog::default());

    let webhook_state = webhook::WebhookState {
        sender,
        events: events.clone(),
    };
    let management_state = management::ManagementState {
        lifecycle: lifecycle.clone(),
        events: events.clone(),
        api_key: Arc::from(settings.api_key.as_str()),
    };

    let app = Router::new()
        .route("/webhook", axum::routing::post(webhook::handle))
        .with_state(webhook_state)
        .merge(management::router(management_state));

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown.clone();
        let interval = settings.healthcheck_interval.as_duration();
        let timeout_runner = settings.timeout_runner.as_duration();
        let time_to_live = settings.time_to_live.as_duration();
        async move {
            reconcile::run_healthcheck(&lifecycle, interval, timeout_runner, time_to_live, shutdown).await;
        }
    });

    tasks.spawn({
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown.clone();
        let interval = settings.indexing_interval.as_duration();
        let timeout_runner = settings.timeout_runner.as_duration();
        async move {
            reconcile::run_indexing(&lifecycle, interval, timeout_runner, shutdown).await;
        }
    });

    tasks.spawn({
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown.clone();
        async move {
            webhook::run_consumer(lifecycle, receiver, shutdown).await;
        }
    });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .context("binding webhook/management listener")?;

    let serve_shutdown = shutdown.clone();
    tasks.spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server exited with error");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining in-flight work");
    shutdown.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        tracing::warn!("shutdown grace period elapsed, forcing remaining tasks to abort");
        tasks.shutdown().await;
    }

    Ok(())
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_filter_directive()));

    let file_appender = tracing_appender::rolling::daily("logs", "runner-manager.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive the process for buffered
    // writes to flush, and this is the process's only logging init.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_level(true))
        .with(fmt::layer().json().with_writer(file_writer).with_ansi(false))
        .init();
}
