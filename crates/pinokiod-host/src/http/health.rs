use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::http::ServerState;

#[derive(Default)]
pub struct HealthState {
    platform_ready: AtomicBool,
    registry_ready: AtomicBool,
    meta: parking_lot::Mutex<HealthMeta>,
}

#[derive(Default, Clone)]
struct HealthMeta {
    started_at: Option<OffsetDateTime>,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        let state = Self::default();
        state.meta.lock().started_at = Some(OffsetDateTime::now_utc());
        state
    }

    pub fn mark_platform_ready(&self) {
        self.platform_ready.store(true, Ordering::SeqCst);
    }

    pub fn mark_registry_ready(&self) {
        self.registry_ready.store(true, Ordering::SeqCst);
    }

    pub fn record_error(&self, err: &str) {
        self.meta.lock().last_error = Some(err.to_string());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let meta = self.meta.lock().clone();
        HealthSnapshot {
            platform_ready: self.platform_ready.load(Ordering::SeqCst),
            registry_ready: self.registry_ready.load(Ordering::SeqCst),
            started_at: meta.started_at,
            last_error: meta.last_error,
        }
    }
}

pub struct HealthSnapshot {
    pub platform_ready: bool,
    pub registry_ready: bool,
    pub started_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

pub async fn handler(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.health.snapshot();
    let apps = state.lifecycle.list();
    let running = apps
        .iter()
        .filter(|r| r.state == pinokiod_core::AppState::Running)
        .count();
    let status = if snapshot.platform_ready && snapshot.registry_ready {
        "ok"
    } else {
        "degraded"
    };
    let started_at = snapshot.started_at.and_then(|ts| ts.format(&Rfc3339).ok());
    Json(serde_json::json!({
        "status": status,
        "platform": state.lifecycle.platform().profile().host.as_str(),
        "apps": apps.len(),
        "running": running,
        "started_at": started_at,
        "last_error": snapshot.last_error,
    }))
}
