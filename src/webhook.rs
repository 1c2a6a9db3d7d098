//! Webhook intake: validates signed `workflow_job` events from the hosting
//! service and dispatches lifecycle transitions.
//!
//! Signature verification is delegated to the `axum_github_hooks::GithubWebhook`
//! extractor rather than hand-rolled here. The bounded queue and dedicated
//! consumer task decouple the HTTP response from slow cloud calls.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum_github_hooks::GithubWebhook;
use chrono::{DateTime, Utc};
use octocrab::models::webhook_events::payload::WorkflowJobWebhookEventAction;
use octocrab::models::webhook_events::{WebhookEvent, WebhookEventPayload};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::LifecycleManager;

/// Bound on the in-process webhook queue: once full, the HTTP handler
/// returns 503 so the hosting service retries delivery later rather than
/// the handler blocking on a slow cloud call.
const WEBHOOK_QUEUE_CAPACITY: usize = 256;

/// How many recently-processed events the management API's `GET /events`
/// surfaces.
const EVENT_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
pub struct QueuedJobEvent {
    pub action: JobAction,
    pub runner_name: Option<String>,
    pub labels: Vec<String>,
    pub repository: String,
    pub workflow_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub received_at: DateTime<Utc>,
    pub action: JobAction,
    pub runner_name: Option<String>,
    pub repository: String,
}

/// A ring buffer of recently-dispatched webhook events, for the read-only
/// management API. Bounded so a busy fleet can't grow it without limit.
#[derive(Default)]
pub struct EventLog {
    inner: SyncMutex<VecDeque<EventRecord>>,
}

impl EventLog {
    pub fn record(&self, event: &QueuedJobEvent) {
        let mut log = self.inner.lock();
        if log.len() == EVENT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(EventRecord {
            received_at: Utc::now(),
            action: event.action,
            runner_name: event.runner_name.clone(),
            repository: event.repository.clone(),
        });
    }

    pub fn recent(&self) -> Vec<EventRecord> {
        self.inner.lock().iter().cloned().collect()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub sender: mpsc::Sender<QueuedJobEvent>,
    pub events: Arc<EventLog>,
}

/// Construct the bounded channel and its sender/receiver pair; the
/// receiver is handed to [`run_consumer`], the sender to the axum router
/// state.
pub fn channel() -> (mpsc::Sender<QueuedJobEvent>, mpsc::Receiver<QueuedJobEvent>) {
    mpsc::channel(WEBHOOK_QUEUE_CAPACITY)
}

/// The `/webhook` POST handler. Signature verification happens inside the
/// `GithubWebhook` extractor before this function ever runs; an invalid
/// signature never reaches here (the extractor itself returns 400).
pub async fn handle(State(state): State<WebhookState>, GithubWebhook(event): GithubWebhook) -> impl IntoResponse {
    let WebhookEvent { repository, specific, .. } = event;
    let repository = repository.map(|r| r.full_name.unwrap_or(r.name)).unwrap_or_default();

    let WebhookEventPayload::WorkflowJob(payload) = specific else {
        // Other event types are acknowledged without side effects.
        return StatusCode::ACCEPTED;
    };

    let action = match payload.action {
        WorkflowJobWebhookEventAction::Queued => JobAction::Queued,
        WorkflowJobWebhookEventAction::InProgress => JobAction::InProgress,
        WorkflowJobWebhookEventAction::Completed => JobAction::Completed,
        // `waiting` and any future action variants are acknowledged
        // without a lifecycle transition.
        _ => return StatusCode::ACCEPTED,
    };

    let job = payload.workflow_job;
    let queued_event = QueuedJobEvent {
        action,
        runner_name: job.runner_name.clone(),
        labels: job.labels.clone(),
        repository,
        workflow_name: Some(job.workflow_name.clone()),
    };

    state.events.record(&queued_event);

    match state.sender.try_send(queued_event) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => {
            tracing::warn!("webhook queue full, rejecting event for retry");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Find the group whose label set is satisfied by a queued job's labels,
/// so a queued job can trigger scale-up for the matching group.
fn matching_group<'a>(lifecycle: &'a LifecycleManager, labels: &[String]) -> Option<&'a str> {
    lifecycle
        .groups()
        .iter()
        .find(|(_, group)| group.config.labels.iter().all(|l| labels.contains(l)))
        .map(|(name, _)| name.as_str())
}

async fn dispatch(lifecycle: &LifecycleManager, event: QueuedJobEvent) {
    match event.action {
        JobAction::Queued => {
            let Some(group_name) = matching_group(lifecycle, &event.labels) else {
                tracing::debug!(labels = ?event.labels, "queued job matched no configured group");
                return;
            };
            let Some(group) = lifecycle.groups().get(group_name) else {
                return;
            };
            let current = lifecycle.store().find_by_group(group_name).await.len() as u32;
            if current >= group.config.max {
                tracing::debug!(group = %group_name, current, max = group.config.max, "group at max, not scaling up");
                return;
            }
            if let Err(e) = lifecycle.create(group_name).await {
                tracing::error!(group = %group_name, error = %e, "scale-up create failed");
            }
        }
        JobAction::InProgress => {
            let Some(name) = event.runner_name else {
                return;
            };
            if let Err(e) = lifecycle
                .pickup(&name, event.workflow_name, Some(event.repository))
                .await
            {
                tracing::error!(runner = %name, error = %e, "pickup transition failed");
            }
        }
        JobAction::Completed => {
            let Some(name) = event.runner_name else {
                return;
            };
            if let Err(e) = lifecycle.finish(&name).await {
                tracing::error!(runner = %name, error = %e, "finish transition failed");
                return;
            }
            if let Err(e) = lifecycle.delete(&name).await {
                tracing::error!(runner = %name, error = %e, "post-completion delete failed");
            }
        }
    }
}

/// Drains queued events into lifecycle transitions. On shutdown, stops
/// accepting new events, finishes whatever is already queued, then exits.
pub async fn run_consumer(
    lifecycle: Arc<LifecycleManager>,
    mut receiver: mpsc::Receiver<QueuedJobEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => dispatch(&lifecycle, event).await,
                    None => return,
                }
            }
            _ = shutdown.cancelled() => {
                receiver.close();
                while let Ok(event) = receiver.try_recv() {
                    dispatch(&lifecycle, event).await;
                }
                tracing::info!("webhook consumer drained queue, shutting down");
                return;
            }
        }
    }
}
