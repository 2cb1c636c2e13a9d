//! HTTP command surface and SSE event stream consumed by UIs and the
//! notebook launcher. JSON over HTTP for commands, server-sent events for
//! the subscription stream; per-subscriber ordering follows the event bus.

pub mod api;
pub mod health;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Router, serve};
use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::lifecycle::LifecycleManager;
use health::HealthState;

#[derive(Clone)]
pub struct ServerState {
    pub lifecycle: Arc<LifecycleManager>,
    pub health: Arc<HealthState>,
}

pub struct HostServer {
    addr: SocketAddr,
    router: Router,
}

impl HostServer {
    pub fn new(port: u16, lifecycle: Arc<LifecycleManager>, health: Arc<HealthState>) -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let state = ServerState { lifecycle, health };
        let router = Router::new()
            .route("/healthz", get(health::handler))
            .route("/api/install", post(api::install))
            .route("/api/start", post(api::start))
            .route("/api/stop", post(api::stop))
            .route("/api/uninstall", post(api::uninstall))
            .route("/api/reset", post(api::reset))
            .route("/api/status/{app_id}", get(api::status))
            .route("/api/list", get(api::list))
            .route("/api/input/{request_id}", post(api::input_reply))
            .route("/api/events", get(events))
            .with_state(state);
        Self { addr, router }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!(addr = %self.addr, "starting host server");
        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, self.router.into_make_service()).await?;
        Ok(())
    }
}

async fn events(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.lifecycle.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(sse) = SseEvent::default().json_data(&event) else {
                        continue;
                    };
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                // Slow consumers drop from the head and keep going.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
