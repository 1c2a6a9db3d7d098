//! Management API: a read-only HTTP surface exposing the configured
//! groups, the current runner index, and recent webhook events, guarded by
//! a static API key compared in constant time.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::lifecycle::LifecycleManager;
use crate::runner::RunnerStatus;
use crate::webhook::EventLog;

#[derive(Clone)]
pub struct ManagementState {
    pub lifecycle: Arc<LifecycleManager>,
    pub events: Arc<EventLog>,
    pub api_key: Arc<str>,
}

pub fn router(state: ManagementState) -> Router {
    Router::new()
        .route("/groups", get(list_groups))
        .route("/runners", get(list_runners))
        .route("/events", get(list_events))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn require_api_key(State(state): State<ManagementState>, headers: HeaderMap, request: Request, next: Next) -> Response {
    let provided = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided.as_bytes().ct_eq(state.api_key.as_bytes()).into() {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

#[derive(Serialize)]
struct GroupView {
    name: String,
    organization: String,
    labels: Vec<String>,
    min: u32,
    max: u32,
    current: usize,
}

async fn list_groups(State(state): State<ManagementState>) -> Json<Vec<GroupView>> {
    let mut views = Vec::with_capacity(state.lifecycle.groups().len());
    for (name, handle) in state.lifecycle.groups() {
        let current = state.lifecycle.store().find_by_group(name).await.len();
        views.push(GroupView {
            name: name.clone(),
            organization: handle.config.organization.clone(),
            labels: handle.config.labels.clone(),
            min: handle.config.min,
            max: handle.config.max,
            current,
        });
    }
    Json(views)
}

#[derive(Deserialize)]
struct RunnerFilter {
    group: Option<String>,
    status: Option<String>,
}

async fn list_runners(State(state): State<ManagementState>, Query(filter): Query<RunnerFilter>) -> impl IntoResponse {
    let mut runners = match &filter.group {
        Some(group) => state.lifecycle.store().find_by_group(group).await,
        None => state.lifecycle.store().all().await,
    };

    if let Some(status) = &filter.status {
        let Some(status) = parse_status(status) else {
            return (StatusCode::BAD_REQUEST, format!("unknown status {status:?}")).into_response();
        };
        runners.retain(|r| r.status == status);
    }

    Json(runners).into_response()
}

fn parse_status(raw: &str) -> Option<RunnerStatus> {
    Some(match raw.to_ascii_lowercase().as_str() {
        "offline" => RunnerStatus::Offline,
        "online" => RunnerStatus::Online,
        "idle" => RunnerStatus::Idle,
        "busy" => RunnerStatus::Busy,
        "completed" => RunnerStatus::Completed,
        _ => return None,
    })
}

async fn list_events(State(state): State<ManagementState>) -> Json<Vec<crate::webhook::EventRecord>> {
    Json(state.events.recent())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_statuses_case_insensitively() {
        assert_eq!(parse_status("IDLE"), Some(RunnerStatus::Idle));
        assert_eq!(parse_status("busy"), Some(RunnerStatus::Busy));
    }

    #[test]
    fn rejects_unknown_status() {
        assert_eq!(parse_status("not-a-status"), None);
    }
}
