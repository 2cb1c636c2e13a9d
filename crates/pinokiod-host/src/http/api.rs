//! Command handlers. Every response echoes the request's `command` id when
//! one was supplied; the same id rides on the events the operation emits.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pinokiod_core::{AppDescriptor, HostError};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::cancel::CancelToken;
use crate::http::ServerState;

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub command: Option<String>,
    pub descriptor: AppDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub command: Option<String>,
    pub app_id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct AppRequest {
    #[serde(default)]
    pub command: Option<String>,
    pub app_id: String,
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputReply {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub cancel: bool,
}

fn failure(command: Option<String>, err: &HostError) -> Response {
    let status = match err.kind() {
        "illegal-state" => StatusCode::CONFLICT,
        "unknown-method" | "script-parse" | "unbound-variable" | "path-escape" => {
            StatusCode::BAD_REQUEST
        }
        "timeout" | "readiness-timeout" => StatusCode::GATEWAY_TIMEOUT,
        "cancelled" | "input-cancelled" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "command": command,
            "error": { "kind": err.kind(), "message": err.to_string() },
        })),
    )
        .into_response()
}

pub async fn install(
    State(state): State<ServerState>,
    Json(request): Json<InstallRequest>,
) -> Response {
    let command = request.command.clone();
    match state
        .lifecycle
        .install(request.descriptor, command.clone(), CancelToken::never())
        .await
    {
        Ok(record) => Json(json!({ "command": command, "record": record })).into_response(),
        Err(err) => failure(command, &err),
    }
}

pub async fn start(
    State(state): State<ServerState>,
    Json(request): Json<StartRequest>,
) -> Response {
    let command = request.command.clone();
    match state
        .lifecycle
        .start(&request.app_id, request.args, command.clone(), CancelToken::never())
        .await
    {
        Ok(outcome) => Json(json!({
            "command": command,
            "state": outcome.state,
            "local_port": outcome.local_port,
            "public_url": outcome.public_url,
        }))
        .into_response(),
        Err(err) => failure(command, &err),
    }
}

pub async fn stop(State(state): State<ServerState>, Json(request): Json<AppRequest>) -> Response {
    let command = request.command.clone();
    match state.lifecycle.stop(&request.app_id, command.clone()).await {
        Ok(record) => Json(json!({ "command": command, "record": record })).into_response(),
        Err(err) => failure(command, &err),
    }
}

pub async fn uninstall(
    State(state): State<ServerState>,
    Json(request): Json<AppRequest>,
) -> Response {
    let command = request.command.clone();
    match state
        .lifecycle
        .uninstall(&request.app_id, request.purge, command.clone())
        .await
    {
        Ok(()) => Json(json!({ "command": command, "uninstalled": request.app_id })).into_response(),
        Err(err) => failure(command, &err),
    }
}

pub async fn reset(State(state): State<ServerState>, Json(request): Json<AppRequest>) -> Response {
    let command = request.command.clone();
    match state.lifecycle.reset(&request.app_id, command.clone()).await {
        Ok(record) => Json(json!({ "command": command, "record": record })).into_response(),
        Err(err) => failure(command, &err),
    }
}

pub async fn status(State(state): State<ServerState>, Path(app_id): Path<String>) -> Response {
    match state.lifecycle.status(&app_id) {
        Some(record) => Json(json!({ "record": record })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "illegal-state", "message": format!("unknown app '{app_id}'") } })),
        )
            .into_response(),
    }
}

pub async fn list(State(state): State<ServerState>) -> Response {
    Json(json!({ "apps": state.lifecycle.list() })).into_response()
}

pub async fn input_reply(
    State(state): State<ServerState>,
    Path(request_id): Path<String>,
    Json(reply): Json<InputReply>,
) -> Response {
    let value = if reply.cancel { None } else { reply.value };
    match state.lifecycle.inputs().reply(&request_id, value) {
        Ok(()) => Json(json!({ "accepted": request_id })).into_response(),
        Err(err) => failure(None, &err),
    }
}
