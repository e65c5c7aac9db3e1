#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;

use crate::module::{Module, ModuleCtx};
use warden_core::admin;
use warden_core::clock::{Clock, SystemClock};
use warden_core::coordinator::ExecutionCoordinator;
use warden_core::memory::{MemorySampler, ProcessSampler};
use warden_core::registry::EntryStatus;

#[derive(Clone)]
struct AppState {
    coordinator: ExecutionCoordinator,
    started: Instant,
}

#[derive(Serialize)]
struct JobView {
    id: String,
    schedule: String,
    enabled: bool,
    status: String,
    in_flight: bool,
}

/// Read-only view of the running daemon.
pub struct StatusServer {
    addr: SocketAddr,
    coordinator: ExecutionCoordinator,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, coordinator: ExecutionCoordinator) -> Self { Self { addr, coordinator } }
}

impl Module for StatusServer {
    fn name(&self) -> &'static str { "status" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let state = AppState { coordinator: self.coordinator, started: Instant::now() };

            let app = Router::new()
                .route("/status", get(status))
                .route("/jobs", get(jobs))
                .route("/jobs/overdue", get(overdue))
                .with_state(state);

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                })
                .await?;

            Ok(())
        })
    }
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.coordinator.store();
    match admin::status_summary(store.as_ref(), state.coordinator.detector(), SystemClock.now()) {
        Ok(mut summary) => {
            summary.resident_bytes = ProcessSampler::current().resident_bytes();
            Json(json!({
                "uptime_ms": state.started.elapsed().as_millis() as u64,
                "in_flight": state.coordinator.in_flight(),
                "summary": summary,
            }))
            .into_response()
        }
        Err(e) => internal(e),
    }
}

async fn jobs(State(state): State<AppState>) -> impl IntoResponse {
    let in_flight = state.coordinator.in_flight();
    let registry = state.coordinator.registry();
    let registry = registry.read().await;
    let out: Vec<JobView> = registry
        .iter()
        .map(|(id, entry)| JobView {
            id: id.clone(),
            schedule: entry.spec.schedule.to_string(),
            enabled: entry.spec.enabled,
            status: match &entry.status {
                EntryStatus::Active => "active".to_string(),
                EntryStatus::Removed => "removed".to_string(),
                EntryStatus::Invalid(reason) => format!("invalid: {reason}"),
            },
            in_flight: in_flight.contains(id),
        })
        .collect();
    Json(out)
}

async fn overdue(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.coordinator.store();
    match admin::list_overdue(store.as_ref(), state.coordinator.detector(), SystemClock.now()) {
        Ok(list) => Json(list).into_response(),
        Err(e) => internal(e),
    }
}
