use crate::error::ErrorInfo;
use crate::record::AppState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One entry on the server → client event stream. Events carry `app_id`
/// where applicable and echo the originating command id when the operation
/// supplied one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    StateChanged {
        app_id: String,
        from: AppState,
        to: AppState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    StepProgress {
        app_id: String,
        script: String,
        index: usize,
        total: usize,
        method: String,
        status: String,
    },
    LogLine {
        app_id: String,
        stream: String,
        line: String,
    },
    InputRequest {
        app_id: String,
        request_id: String,
        kind: String,
        title: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
    TunnelOpened {
        app_id: String,
        provider: String,
        local_port: u16,
        public_url: String,
    },
    TunnelClosed {
        app_id: String,
        provider: String,
        public_url: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
        error: ErrorInfo,
    },
    Notice {
        app_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        href: Option<String>,
    },
    OpenUrl {
        app_id: String,
        url: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            command: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_command(mut self, command: Option<String>) -> Self {
        self.command = command;
        self
    }

    pub fn app_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::StateChanged { app_id, .. }
            | EventKind::StepProgress { app_id, .. }
            | EventKind::LogLine { app_id, .. }
            | EventKind::InputRequest { app_id, .. }
            | EventKind::TunnelOpened { app_id, .. }
            | EventKind::TunnelClosed { app_id, .. }
            | EventKind::Notice { app_id, .. }
            | EventKind::OpenUrl { app_id, .. } => Some(app_id),
            EventKind::Error { app_id, .. } => app_id.as_deref(),
        }
    }

    /// Serialize a `Value` for clients that want untyped payloads.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
