//! Application lifecycle manager.
//!
//! One state machine per app, `absent → installing → installed → starting →
//! running → stopping → stopped` with `error` as a terminal-until-reset
//! branch. Operations for one app serialize on a per-app mutex; different
//! apps proceed concurrently. Cancellation tears partial work down before
//! returning the state to the last stable rung.

use crate::cancel::CancelToken;
use crate::config::HostConfig;
use crate::detector::ServerDetector;
use crate::engine::{
    EngineServices, ExecutionFrame, HostHooks, ScriptEngine, find_script, load_script_file,
};
use crate::events::EventBus;
use crate::fsapi::FsApi;
use crate::input::InputBroker;
use crate::platform::Platform;
use crate::registry::Registry;
use crate::shell::{ShellRequest, ShellRunner};
use crate::supervisor::{ProcessSupervisor, SupervisedProcess};
use crate::tunnel::TunnelBroker;
use crate::venv::VenvManager;
use parking_lot::Mutex;
use pinokiod_core::{
    AppDescriptor, AppRecord, AppState, ErrorInfo, EventKind, HostError, HostResult,
    InstallerKind, PlatformProfile, SourceLocator,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, Weak};
use tokio::sync::broadcast;

/// Fallback readiness pattern: most served apps announce a URL on stdout.
static URL_READINESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+:(\d+)").expect("static pattern"));

const INSTALL_CANDIDATES: &[&str] = &["install.js", "install.json"];
const START_CANDIDATES: &[&str] = &["start.js", "start.json"];

#[derive(Debug)]
pub struct StartOutcome {
    pub state: AppState,
    pub local_port: Option<u16>,
    pub public_url: Option<String>,
}

pub struct LifecycleManager {
    config: HostConfig,
    platform: Arc<dyn Platform>,
    profile: Arc<PlatformProfile>,
    registry: Arc<Registry>,
    fs: Arc<FsApi>,
    shell: Arc<ShellRunner>,
    venvs: Arc<VenvManager>,
    supervisor: Arc<ProcessSupervisor>,
    detector: Arc<ServerDetector>,
    broker: Arc<TunnelBroker>,
    events: EventBus,
    inputs: InputBroker,
    http: reqwest::Client,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    weak_self: Mutex<Weak<LifecycleManager>>,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HostConfig,
        platform: Arc<dyn Platform>,
        registry: Arc<Registry>,
        fs: Arc<FsApi>,
        shell: Arc<ShellRunner>,
        venvs: Arc<VenvManager>,
        supervisor: Arc<ProcessSupervisor>,
        detector: Arc<ServerDetector>,
        broker: Arc<TunnelBroker>,
        events: EventBus,
        inputs: InputBroker,
    ) -> HostResult<Arc<Self>> {
        let profile = Arc::new(platform.profile().clone());
        let http = reqwest::Client::builder()
            .timeout(config.timeouts.http)
            .build()
            .map_err(|err| HostError::internal(err))?;
        let manager = Arc::new(Self {
            config,
            platform,
            profile,
            registry,
            fs,
            shell,
            venvs,
            supervisor,
            detector,
            broker,
            events,
            inputs,
            http,
            locks: Mutex::new(HashMap::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *manager.weak_self.lock() = Arc::downgrade(&manager);
        Ok(manager)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn inputs(&self) -> &InputBroker {
        &self.inputs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<pinokiod_core::Event> {
        self.events.subscribe()
    }

    pub fn status(&self, app_id: &str) -> Option<AppRecord> {
        self.registry.get(app_id)
    }

    pub fn list(&self) -> Vec<AppRecord> {
        self.registry.snapshot()
    }

    fn app_lock(&self, app_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Install an app from its descriptor. Idempotent when a matching
    /// descriptor is already installed.
    pub async fn install(
        &self,
        descriptor: AppDescriptor,
        command: Option<String>,
        cancel: CancelToken,
    ) -> HostResult<AppRecord> {
        let app_id = descriptor.id.clone();
        let lock = self.app_lock(&app_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.get(&app_id) {
            if existing.state == AppState::Installed && existing.descriptor == descriptor {
                tracing::info!(app = %app_id, "install is a no-op, descriptor already installed");
                return Ok(existing);
            }
            return Err(HostError::illegal(format!(
                "app '{app_id}' is {} and cannot be installed",
                existing.state.as_str()
            )));
        }

        let install_root = self.profile.apps_dir().join(&app_id);
        let mut record = AppRecord::new(descriptor, install_root);
        self.transition(&mut record, AppState::Installing, command.as_deref(), None)?;

        match self.install_inner(&mut record, command.as_deref(), &cancel).await {
            Ok(kind) => {
                record.installer_kind = Some(kind);
                self.refresh_local_vars(&mut record);
                self.transition(&mut record, AppState::Installed, command.as_deref(), None)?;
                Ok(record)
            }
            Err(HostError::Cancelled) => {
                self.teardown_install(&record, command.as_deref()).await;
                Err(HostError::Cancelled)
            }
            Err(err) => {
                record.last_error = Some(ErrorInfo::from(&err));
                self.transition(
                    &mut record,
                    AppState::Error,
                    command.as_deref(),
                    Some(err.kind().to_string()),
                )?;
                self.emit_error(Some(&record.id), &err, command.as_deref());
                Err(err)
            }
        }
    }

    async fn install_inner(
        &self,
        record: &mut AppRecord,
        command: Option<&str>,
        cancel: &CancelToken,
    ) -> HostResult<InstallerKind> {
        self.fetch_source(record, cancel).await?;
        cancel.check()?;

        let hinted = record.descriptor.hints.installer.clone();
        let script_path = match hinted {
            Some(name) => {
                let path = record.install_root.join(&name);
                path.is_file().then_some(path).ok_or_else(|| {
                    HostError::ScriptParse {
                        reason: format!("hinted installer '{name}' not found"),
                    }
                })?
            }
            None => match find_script(&record.install_root, INSTALL_CANDIDATES) {
                Some(path) => path,
                None => {
                    // No installer is a zero-step install.
                    return Ok(InstallerKind::Json);
                }
            },
        };
        let (script, kind) = load_script_file(&script_path)?;

        let services = self.engine_services(record);
        let engine = ScriptEngine::new(&record.id, "install", services);
        let mut frame = ExecutionFrame::top(
            Arc::new(script),
            record.install_root.clone(),
            Map::new(),
            record.local_vars.clone(),
        );
        let run = engine.execute(&mut frame, cancel, command).await?;
        if record.venv.is_none() {
            record.venv = run.venv;
        }
        Ok(kind)
    }

    async fn fetch_source(&self, record: &AppRecord, cancel: &CancelToken) -> HostResult<()> {
        match &record.descriptor.source {
            SourceLocator::Git { url } => {
                if record.install_root.join(".git").is_dir() {
                    return Ok(());
                }
                tokio::fs::create_dir_all(self.profile.apps_dir())
                    .await
                    .map_err(HostError::io)?;
                let request = ShellRequest {
                    commands: vec![format!(
                        "git clone --recursive {url} {}",
                        record.install_root.display()
                    )],
                    cwd: self.profile.apps_dir(),
                    env: HashMap::new(),
                    venv: None,
                    sudo: false,
                };
                let outcome = self.shell.run(&record.id, &request, cancel).await?;
                if outcome.exit_code != 0 {
                    return Err(HostError::CloneFailed {
                        reason: format!("git clone {url} exited with {}", outcome.exit_code),
                    });
                }
                Ok(())
            }
            SourceLocator::LocalPath { path } => {
                let source = Path::new(path);
                if !source.is_dir() {
                    return Err(HostError::CloneFailed {
                        reason: format!("local source '{path}' is not a directory"),
                    });
                }
                let app_fs = self
                    .fs
                    .for_app(&record.id, record.install_root.clone());
                app_fs.copy(source, &record.install_root).await
            }
        }
    }

    async fn teardown_install(&self, record: &AppRecord, command: Option<&str>) {
        let _ = self.supervisor.terminate(&record.id).await;
        let _ = tokio::fs::remove_dir_all(&record.install_root).await;
        let _ = self.venvs.remove_all(&record.id).await;
        let _ = self.registry.remove(&record.id);
        self.events.emit(
            EventKind::StateChanged {
                app_id: record.id.clone(),
                from: AppState::Installing,
                to: AppState::Absent,
                detail: Some("cancelled".into()),
            },
            command.map(str::to_string),
        );
        self.emit_error(Some(&record.id), &HostError::Cancelled, command);
    }

    /// Start an installed (or stopped) app.
    pub async fn start(
        &self,
        app_id: &str,
        args: Map<String, Value>,
        command: Option<String>,
        cancel: CancelToken,
    ) -> HostResult<StartOutcome> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let mut record = self
            .registry
            .get(app_id)
            .ok_or_else(|| HostError::illegal(format!("app '{app_id}' is not installed")))?;
        let resume_state = record.state;
        if !matches!(resume_state, AppState::Installed | AppState::Stopped) {
            return Err(HostError::illegal(format!(
                "app '{app_id}' is {} and cannot be started",
                record.state.as_str()
            )));
        }
        record.last_error = None;
        self.transition(&mut record, AppState::Starting, command.as_deref(), None)?;

        match self.start_inner(&mut record, args, command.as_deref(), &cancel).await {
            Ok(outcome) => {
                self.refresh_local_vars(&mut record);
                self.transition(&mut record, AppState::Running, command.as_deref(), None)?;
                if let Some(process) = self.supervisor.get(app_id) {
                    self.watch_exit(app_id.to_string(), process);
                }
                Ok(StartOutcome {
                    state: AppState::Running,
                    ..outcome
                })
            }
            Err(HostError::Cancelled) => {
                self.broker.close(app_id, command.clone()).await;
                let _ = self.supervisor.terminate(app_id).await;
                record.process = None;
                record.tunnel = None;
                record.local_port = None;
                self.transition(&mut record, resume_state, command.as_deref(), Some("cancelled".into()))?;
                Err(HostError::Cancelled)
            }
            Err(err) => {
                self.broker.close(app_id, command.clone()).await;
                let _ = self.supervisor.terminate(app_id).await;
                record.process = None;
                record.tunnel = None;
                record.local_port = None;
                record.last_error = Some(ErrorInfo::from(&err));
                self.transition(
                    &mut record,
                    AppState::Error,
                    command.as_deref(),
                    Some(err.kind().to_string()),
                )?;
                self.emit_error(Some(app_id), &err, command.as_deref());
                Err(err)
            }
        }
    }

    async fn start_inner(
        &self,
        record: &mut AppRecord,
        args: Map<String, Value>,
        command: Option<&str>,
        cancel: &CancelToken,
    ) -> HostResult<StartOutcome> {
        let script_path = self.resolve_start_script(record)?;
        let (script, _) = load_script_file(&script_path)?;
        let script = Arc::new(script);

        let services = self.engine_services(record);
        let engine = ScriptEngine::new(&record.id, "start", services);
        let mut frame = ExecutionFrame::top(
            Arc::clone(&script),
            record.install_root.clone(),
            args,
            record.local_vars.clone(),
        );
        let run = engine.execute(&mut frame, cancel, command).await?;
        if record.venv.is_none() {
            record.venv = run.venv;
        }

        let Some(process) = run.last_process else {
            // Nothing kept running; the script itself is the app.
            return Ok(StartOutcome {
                state: AppState::Running,
                local_port: None,
                public_url: None,
            });
        };
        record.process = Some(process.info());

        let readiness = self
            .readiness_regex(record)?
            .unwrap_or_else(|| URL_READINESS.clone());
        // The daemon handover may already have consumed the readiness line;
        // check the captured tail before subscribing for fresh output.
        let from_tail = process.tail().iter().rev().find_map(|line| {
            readiness
                .is_match(line)
                .then(|| crate::detector::extract_port(&readiness, line))
                .flatten()
        });
        let port = match from_tail {
            Some(port) => port,
            None => {
                self.detector
                    .detect(
                        Some(&process),
                        Some(&readiness),
                        record.descriptor.hints.default_port,
                        cancel,
                    )
                    .await?
            }
        };
        record.local_port = Some(port);

        let public_url = match self
            .broker
            .open(
                &record.id,
                port,
                &self.config.tunnel_providers,
                command.map(str::to_string),
                cancel,
            )
            .await
        {
            Ok(tunnel) => {
                let url = tunnel.public_url.clone();
                record.tunnel = Some(tunnel);
                Some(url)
            }
            Err(err) => {
                // Public exposure is best-effort; the app is still running
                // locally.
                tracing::warn!(app = %record.id, error = %err, "no tunnel available");
                None
            }
        };

        Ok(StartOutcome {
            state: AppState::Running,
            local_port: Some(port),
            public_url,
        })
    }

    fn resolve_start_script(&self, record: &AppRecord) -> HostResult<std::path::PathBuf> {
        if let Some(name) = &record.descriptor.hints.starter {
            let path = record.install_root.join(name);
            return path.is_file().then_some(path).ok_or_else(|| {
                HostError::ScriptParse {
                    reason: format!("hinted start script '{name}' not found"),
                }
            });
        }
        if let Some(path) = find_script(&record.install_root, START_CANDIDATES) {
            return Ok(path);
        }
        // `pinokio.js` may declare the entry as a plain object field.
        let manifest = record.install_root.join("pinokio.js");
        if manifest.is_file() {
            if let Ok((script, _)) = load_script_file(&manifest) {
                if let Some(entry) = script.raw.get("start").and_then(Value::as_str) {
                    let path = record.install_root.join(entry);
                    if path.is_file() {
                        return Ok(path);
                    }
                }
            }
        }
        Err(HostError::ScriptParse {
            reason: format!("no start script found for '{}'", record.id),
        })
    }

    fn readiness_regex(&self, record: &AppRecord) -> HostResult<Option<Regex>> {
        match &record.descriptor.hints.readiness_regex {
            Some(raw) => Regex::new(raw.trim_matches('/'))
                .map(Some)
                .map_err(|err| HostError::ScriptParse {
                    reason: format!("bad readiness regex: {err}"),
                }),
            None => Ok(None),
        }
    }

    /// Stop a running app: tunnel released first, then the process group.
    pub async fn stop(&self, app_id: &str, command: Option<String>) -> HostResult<AppRecord> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        self.stop_locked(app_id, command, None).await
    }

    async fn stop_locked(
        &self,
        app_id: &str,
        command: Option<String>,
        detail: Option<String>,
    ) -> HostResult<AppRecord> {
        let mut record = self
            .registry
            .get(app_id)
            .ok_or_else(|| HostError::illegal(format!("app '{app_id}' is not installed")))?;
        match record.state {
            AppState::Running | AppState::Starting => {}
            AppState::Stopped => return Ok(record),
            other => {
                return Err(HostError::illegal(format!(
                    "app '{app_id}' is {} and cannot be stopped",
                    other.as_str()
                )));
            }
        }
        self.transition(&mut record, AppState::Stopping, command.as_deref(), detail.clone())?;

        self.broker.close(app_id, command.clone()).await;
        self.supervisor.terminate(app_id).await?;
        record.process = None;
        record.tunnel = None;
        record.local_port = None;
        self.transition(&mut record, AppState::Stopped, command.as_deref(), detail)?;
        Ok(record)
    }

    /// Remove an app entirely. Shared model artifacts survive unless
    /// `purge` is set.
    pub async fn uninstall(
        &self,
        app_id: &str,
        purge: bool,
        command: Option<String>,
    ) -> HostResult<()> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let record = self
            .registry
            .get(app_id)
            .ok_or_else(|| HostError::illegal(format!("app '{app_id}' is not installed")))?;
        if !matches!(
            record.state,
            AppState::Installed | AppState::Stopped | AppState::Error
        ) {
            return Err(HostError::illegal(format!(
                "app '{app_id}' is {} and cannot be uninstalled",
                record.state.as_str()
            )));
        }

        tokio::fs::remove_dir_all(&record.install_root).await.ok();
        self.venvs.remove_all(app_id).await?;
        if purge {
            let app_models = self.fs.models_root().join(app_id);
            tokio::fs::remove_dir_all(&app_models).await.ok();
        }
        self.registry.remove(app_id)?;
        self.events.emit(
            EventKind::StateChanged {
                app_id: app_id.to_string(),
                from: record.state,
                to: AppState::Absent,
                detail: None,
            },
            command,
        );
        Ok(())
    }

    /// Clear a terminal error. An app that finished installing resumes at
    /// `stopped`/`installed`; a failed install goes back to `absent`.
    pub async fn reset(&self, app_id: &str, command: Option<String>) -> HostResult<AppRecord> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let mut record = self
            .registry
            .get(app_id)
            .ok_or_else(|| HostError::illegal(format!("app '{app_id}' is not installed")))?;
        if record.state != AppState::Error {
            return Err(HostError::illegal(format!(
                "app '{app_id}' is {}, reset applies to error only",
                record.state.as_str()
            )));
        }
        record.last_error = None;
        if record.installer_kind.is_some() {
            record.process = None;
            record.tunnel = None;
            record.local_port = None;
            self.transition(&mut record, AppState::Installed, command.as_deref(), None)?;
            Ok(record)
        } else {
            // The install never completed; nothing durable to keep.
            let from = record.state;
            tokio::fs::remove_dir_all(&record.install_root).await.ok();
            self.registry.remove(app_id)?;
            self.events.emit(
                EventKind::StateChanged {
                    app_id: app_id.to_string(),
                    from,
                    to: AppState::Absent,
                    detail: None,
                },
                command,
            );
            record.state = AppState::Absent;
            Ok(record)
        }
    }

    /// Periodic tunnel health sweep; applies changed records.
    pub async fn sweep_tunnels(&self) {
        for (app_id, tunnel) in self.broker.probe_all().await {
            if let Some(mut record) = self.registry.get(&app_id) {
                record.tunnel = Some(tunnel);
                if let Err(err) = self.registry.upsert(record) {
                    tracing::warn!(app = %app_id, error = %err, "tunnel health persist failed");
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
        self.supervisor.shutdown().await;
    }

    fn watch_exit(&self, app_id: String, process: Arc<SupervisedProcess>) {
        let weak = self.weak_self.lock().clone();
        tokio::spawn(async move {
            let mut exit = process.exit_watch();
            while exit.borrow().is_none() {
                if exit.changed().await.is_err() {
                    break;
                }
            }
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let still_current = manager
                .registry
                .get(&app_id)
                .is_some_and(|record| {
                    record.state == AppState::Running
                        && record.process.as_ref().map(|p| p.pid) == Some(process.pid())
                });
            if still_current {
                tracing::info!(app = %app_id, "process exited on its own, stopping");
                let lock = manager.app_lock(&app_id);
                let _guard = lock.lock().await;
                if let Err(err) = manager
                    .stop_locked(&app_id, None, Some("process exited".into()))
                    .await
                {
                    tracing::warn!(app = %app_id, error = %err, "auto-stop failed");
                }
            }
        });
    }

    fn engine_services(&self, record: &AppRecord) -> EngineServices {
        let readiness_hint = record
            .descriptor
            .hints
            .readiness_regex
            .as_deref()
            .and_then(|raw| Regex::new(raw.trim_matches('/')).ok());
        EngineServices {
            fs: self.fs.for_app(&record.id, record.install_root.clone()),
            shell: Arc::clone(&self.shell),
            venvs: Arc::clone(&self.venvs),
            events: self.events.clone(),
            inputs: self.inputs.clone(),
            profile: Arc::clone(&self.profile),
            hooks: Arc::new(LifecycleHooks {
                registry: Arc::clone(&self.registry),
                manager: self.weak_self.lock().clone(),
            }),
            http: self.http.clone(),
            http_timeout: self.config.timeouts.http,
            cache_root: self.profile.cache_dir(),
            models_root: self.profile.models_dir(),
            readiness_hint,
        }
    }

    fn refresh_local_vars(&self, record: &mut AppRecord) {
        if let Some(stored) = self.registry.get(&record.id) {
            record.local_vars = stored.local_vars;
        }
    }

    fn transition(
        &self,
        record: &mut AppRecord,
        to: AppState,
        command: Option<&str>,
        detail: Option<String>,
    ) -> HostResult<()> {
        let from = record.state;
        record.state = to;
        record.state_changed_at = time::OffsetDateTime::now_utc();
        self.registry.upsert(record.clone())?;
        tracing::info!(
            app = %record.id,
            from = from.as_str(),
            to = to.as_str(),
            "state transition"
        );
        self.events.emit(
            EventKind::StateChanged {
                app_id: record.id.clone(),
                from,
                to,
                detail,
            },
            command.map(str::to_string),
        );
        Ok(())
    }

    fn emit_error(&self, app_id: Option<&str>, err: &HostError, command: Option<&str>) {
        self.events.emit(
            EventKind::Error {
                app_id: app_id.map(str::to_string),
                error: err.into(),
            },
            command.map(str::to_string),
        );
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }
}

struct LifecycleHooks {
    registry: Arc<Registry>,
    manager: Weak<LifecycleManager>,
}

impl HostHooks for LifecycleHooks {
    fn persist_local_vars(&self, app_id: &str, vars: &Map<String, Value>) -> HostResult<()> {
        let Some(mut record) = self.registry.get(app_id) else {
            return Ok(());
        };
        record.local_vars.extend(vars.clone());
        self.registry.upsert(record)
    }

    fn request_stop(&self, app_id: &str) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = manager.stop(&app_id, None).await {
                tracing::warn!(app = %app_id, error = %err, "script.stop failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelSource, CancelToken};
    use crate::config::DetectorConfig;
    use crate::paths::PathMapper;
    use crate::platform::Platform;
    use crate::tunnel::{TunnelProvider, tests::MockProvider};
    use pinokiod_core::{GpuInfo, HostClass, ResourceLimits};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedPlatform {
        profile: PlatformProfile,
    }

    impl Platform for FixedPlatform {
        fn profile(&self) -> &PlatformProfile {
            &self.profile
        }
    }

    struct Fixture {
        _tmp: TempDir,
        manager: Arc<LifecycleManager>,
        root: std::path::PathBuf,
    }

    fn fixture_with_providers(providers: Vec<Arc<dyn TunnelProvider>>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let profile = PlatformProfile {
            host: HostClass::GenericLinux,
            root: root.clone(),
            temp: std::env::temp_dir(),
            persistence: root.clone(),
            gpus: vec![GpuInfo {
                name: "NVIDIA T4".into(),
                memory_mib: 16384,
                cuda_version: Some("12.2".into()),
            }],
            limits: ResourceLimits::default(),
            containerized: false,
            allows_raw_signals: true,
            capabilities: Default::default(),
        };
        let platform: Arc<dyn Platform> = Arc::new(FixedPlatform {
            profile: profile.clone(),
        });
        let events = EventBus::new();
        let registry = Arc::new(Registry::load(profile.registry_path()).unwrap());
        let mapper = PathMapper::new(root.clone(), root.clone());
        let fs = Arc::new(
            FsApi::new(
                mapper,
                profile.models_dir(),
                profile.cache_dir(),
                profile.venvs_dir(),
                events.clone(),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let supervisor = Arc::new(ProcessSupervisor::new(events.clone(), Duration::from_secs(2)));
        let shell = Arc::new(ShellRunner::new(
            Arc::clone(&supervisor),
            events.clone(),
            profile.logs_dir(),
            Duration::from_secs(120),
            false,
        ));
        let venvs = Arc::new(VenvManager::new(profile.venvs_dir()));
        let detector = Arc::new(
            ServerDetector::new(
                DetectorConfig {
                    scan_range: 1..=1,
                    allow_list: vec![],
                    probe_timeout: Duration::from_millis(200),
                    sweep_pause: Duration::from_millis(100),
                },
                Duration::from_secs(10),
            )
            .unwrap(),
        );
        let broker = Arc::new(TunnelBroker::new(
            providers,
            events.clone(),
            Duration::from_secs(5),
        ));
        let inputs = InputBroker::new(events.clone());
        let mut config = HostConfig::default();
        config.tunnel_providers = vec!["localtunnel".into()];
        let manager = LifecycleManager::new(
            config,
            platform,
            registry,
            fs,
            shell,
            venvs,
            supervisor,
            detector,
            broker,
            events,
            inputs,
        )
        .unwrap();
        Fixture {
            _tmp: tmp,
            manager,
            root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_providers(vec![Arc::new(MockProvider::new(
            "localtunnel",
            vec![Ok("https://demo.loca.lt".into())],
        ))])
    }

    fn local_app(fx: &Fixture, id: &str, files: &[(&str, String)]) -> AppDescriptor {
        let source_dir = fx.root.join("sources").join(id);
        std::fs::create_dir_all(&source_dir).unwrap();
        for (name, content) in files {
            std::fs::write(source_dir.join(name), content).unwrap();
        }
        AppDescriptor::local(id, source_dir.display().to_string())
    }

    #[tokio::test]
    async fn hello_world_install_reaches_installed() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "hello",
            &[(
                "install.json",
                json!({"run": [{"method": "shell.run", "params": {"message": "echo hello"}}]})
                    .to_string(),
            )],
        );
        let record = fx
            .manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(record.state, AppState::Installed);
        assert_eq!(record.installer_kind, Some(InstallerKind::Json));
        let registry_text =
            std::fs::read_to_string(fx.root.join("registry.json")).unwrap();
        assert!(registry_text.contains("\"hello\""));
        let log_text = std::fs::read_to_string(fx.root.join("logs/hello.log")).unwrap();
        assert!(log_text.ends_with("hello\n"));
    }

    #[tokio::test]
    async fn reinstall_same_descriptor_is_a_noop_with_identical_record() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "hello",
            &[(
                "install.json",
                json!({"run": []}).to_string(),
            )],
        );
        let first = fx
            .manager
            .install(descriptor.clone(), None, CancelToken::never())
            .await
            .unwrap();
        let second = fx
            .manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn install_script_failure_lands_in_error_and_reset_clears_it() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "broken",
            &[(
                "install.json",
                json!({"run": [{"method": "shell.run", "params": {"message": "exit 9"}}]})
                    .to_string(),
            )],
        );
        let err = fx
            .manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "shell-nonzero");
        let record = fx.manager.status("broken").unwrap();
        assert_eq!(record.state, AppState::Error);
        assert_eq!(record.last_error.as_ref().unwrap().kind, "shell-nonzero");

        // Reset of a failed install returns to absent.
        let reset = fx.manager.reset("broken", None).await.unwrap();
        assert_eq!(reset.state, AppState::Absent);
        assert!(fx.manager.status("broken").is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_install_tears_down_to_absent() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "slowpoke",
            &[(
                "install.json",
                json!({"run": [
                    {"method": "fs.write", "params": {"path": "step1.txt", "text": "partial"}},
                    {"method": "shell.run", "params": {"message": "sleep 60"}},
                    {"method": "fs.write", "params": {"path": "step3.txt", "text": "never"}}
                ]})
                .to_string(),
            )],
        );
        let source = CancelSource::new();
        let token = source.token();
        let manager = Arc::clone(&fx.manager);
        let descriptor_clone = descriptor.clone();
        let task = tokio::spawn(async move {
            manager.install(descriptor_clone, None, token).await
        });
        tokio::time::sleep(Duration::from_millis(400)).await;
        source.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(fx.manager.status("slowpoke").is_none());
        assert!(!fx.root.join("apps/slowpoke").exists());

        // A subsequent install completes normally.
        let descriptor = local_app(
            &fx,
            "slowpoke",
            &[("install.json", json!({"run": []}).to_string())],
        );
        let record = fx
            .manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(record.state, AppState::Installed);
    }

    #[tokio::test]
    async fn start_stop_cycle_preserves_local_vars() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "daemon",
            &[
                (
                    "install.json",
                    json!({"run": [{"method": "local.set", "params": {"flavor": "vanilla"}}]})
                        .to_string(),
                ),
                (
                    "start.json",
                    json!({"run": [
                        {"method": "shell.run",
                         "params": {"message": "echo http://127.0.0.1:7993; sleep 30",
                                    "daemon": true, "ready": "http://\\S+:(\\d+)"}}
                    ]})
                    .to_string(),
                ),
            ],
        );
        fx.manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap();

        let outcome = fx
            .manager
            .start("daemon", Map::new(), None, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(outcome.state, AppState::Running);
        assert_eq!(outcome.local_port, Some(7993));
        assert_eq!(outcome.public_url.as_deref(), Some("https://demo.loca.lt"));

        let record = fx.manager.status("daemon").unwrap();
        assert!(record.exposure_invariant_holds());
        assert_eq!(record.local_vars["flavor"], json!("vanilla"));

        // Second start while running observes illegal-state.
        let err = fx
            .manager
            .start("daemon", Map::new(), None, CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "illegal-state");

        let stopped = fx.manager.stop("daemon", None).await.unwrap();
        assert_eq!(stopped.state, AppState::Stopped);
        assert!(stopped.process.is_none());
        assert!(stopped.tunnel.is_none());
        assert_eq!(stopped.local_vars["flavor"], json!("vanilla"));

        // Stop is idempotent once stopped.
        fx.manager.stop("daemon", None).await.unwrap();
    }

    #[tokio::test]
    async fn uninstall_removes_root_and_registry_entry() {
        let fx = fixture();
        let descriptor = local_app(
            &fx,
            "bye",
            &[("install.json", json!({"run": []}).to_string())],
        );
        fx.manager
            .install(descriptor.clone(), None, CancelToken::never())
            .await
            .unwrap();
        assert!(fx.root.join("apps/bye").is_dir());

        fx.manager.uninstall("bye", false, None).await.unwrap();
        assert!(fx.manager.status("bye").is_none());
        assert!(!fx.root.join("apps/bye").exists());

        // install → uninstall → install round-trips.
        let again = fx
            .manager
            .install(descriptor, None, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(again.state, AppState::Installed);
    }

    #[tokio::test]
    async fn concurrent_installs_of_independent_apps_proceed() {
        let fx = fixture();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let id = format!("app-{i}");
            let descriptor = local_app(
                &fx,
                &id,
                &[(
                    "install.json",
                    json!({"run": [{"method": "shell.run", "params": {"message": format!("echo {id}")}}]})
                        .to_string(),
                )],
            );
            let manager = Arc::clone(&fx.manager);
            tasks.push(tokio::spawn(async move {
                manager.install(descriptor, None, CancelToken::never()).await
            }));
        }
        for task in tasks {
            let record = task.await.unwrap().unwrap();
            assert_eq!(record.state, AppState::Installed);
        }
        assert_eq!(fx.manager.list().len(), 8);
    }
}
