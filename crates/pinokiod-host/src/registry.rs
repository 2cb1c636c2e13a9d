//! Durable app registry: the single source of truth for `AppRecord`s,
//! persisted as one JSON document rewritten atomically on every state
//! transition. All writes funnel through the lifecycle manager; readers
//! get consistent snapshots.

use parking_lot::RwLock;
use pinokiod_core::{AppRecord, AppState, HostError, HostResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct Registry {
    path: PathBuf,
    inner: RwLock<HashMap<String, AppRecord>>,
}

impl Registry {
    /// Load from disk, reconciling stale records: installs whose directory
    /// vanished are dropped, and process-bearing states are demoted to
    /// stopped because no process survives a host restart.
    pub fn load(path: PathBuf) -> HostResult<Self> {
        let mut records: HashMap<String, AppRecord> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|err| HostError::Internal {
                reason: format!("corrupt registry {}: {err}", path.display()),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(HostError::io(err)),
        };

        records.retain(|id, record| {
            let present = record.install_root.is_dir();
            if !present {
                tracing::warn!(app = %id, "install root missing, dropping record");
            }
            present
        });
        for record in records.values_mut() {
            if matches!(
                record.state,
                AppState::Installing | AppState::Starting | AppState::Running | AppState::Stopping
            ) {
                record.state = AppState::Stopped;
                record.state_changed_at = time::OffsetDateTime::now_utc();
                record.process = None;
                record.tunnel = None;
                record.local_port = None;
            }
        }

        let registry = Self {
            path,
            inner: RwLock::new(records),
        };
        registry.persist()?;
        Ok(registry)
    }

    pub fn get(&self, app_id: &str) -> Option<AppRecord> {
        self.inner.read().get(app_id).cloned()
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.inner.read().contains_key(app_id)
    }

    pub fn snapshot(&self) -> Vec<AppRecord> {
        let mut records: Vec<AppRecord> = self.inner.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn upsert(&self, record: AppRecord) -> HostResult<()> {
        {
            let mut guard = self.inner.write();
            guard.insert(record.id.clone(), record);
        }
        self.persist()
    }

    pub fn remove(&self, app_id: &str) -> HostResult<Option<AppRecord>> {
        let removed = {
            let mut guard = self.inner.write();
            guard.remove(app_id)
        };
        self.persist()?;
        Ok(removed)
    }

    fn persist(&self) -> HostResult<()> {
        let text = {
            let guard = self.inner.read();
            serde_json::to_string_pretty(&*guard)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(HostError::io)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(HostError::io)?;
        std::fs::rename(&tmp, &self.path).map_err(HostError::io)?;
        Ok(())
    }
}
