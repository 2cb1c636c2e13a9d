use crate::descriptor::AppDescriptor;
use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use time::OffsetDateTime;

/// Lifecycle states of an app. Only the transitions enforced by the
/// lifecycle manager are legal; anything else fails with `illegal-state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppState {
    Absent,
    Installing,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Which script dialect the installer was written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    Js,
    Json,
}

/// How a virtual environment is activated when a shell step references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenvKind {
    Python,
    Node,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenvHandle {
    pub path: PathBuf,
    pub kind: VenvKind,
}

/// Handle to a supervised process, as persisted in the registry. The live
/// child is owned by the process supervisor; this is bookkeeping only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub pgid: i32,
    pub log_path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelHealth {
    Healthy,
    Degraded,
    Dead,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub provider: String,
    pub local_port: u16,
    pub public_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub health: TunnelHealth,
    /// Name of the credential source used at open time; never the secret itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_ref: Option<String>,
}

/// Durable per-app record, persisted as JSON between sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    pub descriptor: AppDescriptor,
    pub install_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<VenvHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_kind: Option<InstallerKind>,
    pub state: AppState,
    #[serde(with = "time::serde::rfc3339")]
    pub state_changed_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelRecord>,
    /// Script-visible variables written by `local.set`; survive across runs.
    #[serde(default)]
    pub local_vars: Map<String, Value>,
}

impl AppRecord {
    pub fn new(descriptor: AppDescriptor, install_root: PathBuf) -> Self {
        Self {
            id: descriptor.id.clone(),
            descriptor,
            install_root,
            venv: None,
            installer_kind: None,
            state: AppState::Absent,
            state_changed_at: OffsetDateTime::now_utc(),
            last_error: None,
            process: None,
            local_port: None,
            tunnel: None,
            local_vars: Map::new(),
        }
    }

    /// `tunnel != null` requires a live process and running state.
    pub fn exposure_invariant_holds(&self) -> bool {
        self.tunnel.is_none() || (self.process.is_some() && self.state == AppState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AppDescriptor;

    #[test]
    fn record_round_trips_through_json() {
        let mut record = AppRecord::new(
            AppDescriptor::git("hello", "https://example.com/hello.git"),
            PathBuf::from("/pinokio/apps/hello"),
        );
        record.state = AppState::Installed;
        record
            .local_vars
            .insert("n".into(), Value::String("done".into()));

        let text = serde_json::to_string(&record).unwrap();
        let back: AppRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "hello");
        assert_eq!(back.state, AppState::Installed);
        assert_eq!(back.local_vars["n"], Value::String("done".into()));
        assert!(back.exposure_invariant_holds());
    }

    #[test]
    fn exposure_invariant_rejects_tunnel_without_process() {
        let mut record = AppRecord::new(
            AppDescriptor::git("x", "https://example.com/x.git"),
            PathBuf::from("/pinokio/apps/x"),
        );
        record.state = AppState::Running;
        record.tunnel = Some(TunnelRecord {
            provider: "localtunnel".into(),
            local_port: 7860,
            public_url: "https://x.loca.lt".into(),
            created_at: OffsetDateTime::now_utc(),
            health: TunnelHealth::Healthy,
            auth_ref: None,
        });
        assert!(!record.exposure_invariant_holds());
    }
}
