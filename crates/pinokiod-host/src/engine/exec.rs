//! Step dispatch.
//!
//! The engine walks a frame's steps sequentially: `when:` gates first (a
//! false guard skips the step and its `on:` handlers never see it), then
//! the op runs with every string parameter resolved, then `on:` recovery
//! applies to failures (bounded-backoff retry, skip, or jump). `jump` is
//! the only control transfer; `script.return` ends the frame early.

use crate::cancel::CancelToken;
use crate::detector::next_free_port;
use crate::engine::frame::{ExecutionFrame, MAX_FRAME_DEPTH};
use crate::engine::{find_script, jsonops, load_script_file};
use crate::events::EventBus;
use crate::fsapi::{AppFs, atomic_write};
use crate::input::InputBroker;
use crate::platform::which;
use crate::shell::{ReadinessSpec, ShellRequest, ShellRunner};
use crate::supervisor::SupervisedProcess;
use crate::venv::VenvManager;
use crate::vars::{Resolver, SystemLookups, VarScope};
use futures::future::BoxFuture;
use pinokiod_core::{
    EventKind, HfDownloadParams, HostError, HostResult, JumpTarget, LogLevel, OnAction,
    PlatformProfile, Script, Step, VenvHandle, VenvKind,
};
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Callbacks into the lifecycle layer. Keeps the engine free of any
/// dependency on the registry or the state machine.
pub trait HostHooks: Send + Sync {
    /// Persist keys written by `local.set` into the app's durable record.
    fn persist_local_vars(&self, app_id: &str, vars: &Map<String, Value>) -> HostResult<()>;
    /// `script.stop` for the named (or current) app.
    fn request_stop(&self, app_id: &str);
}

pub struct EngineServices {
    pub fs: AppFs,
    pub shell: Arc<ShellRunner>,
    pub venvs: Arc<VenvManager>,
    pub events: EventBus,
    pub inputs: InputBroker,
    pub profile: Arc<PlatformProfile>,
    pub hooks: Arc<dyn HostHooks>,
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    pub cache_root: PathBuf,
    pub models_root: PathBuf,
    /// Descriptor-declared readiness pattern, used when a daemon step has
    /// no `ready` of its own.
    pub readiness_hint: Option<Regex>,
}

#[derive(Debug)]
pub struct ScriptRun {
    pub return_value: Value,
    pub last_process: Option<Arc<SupervisedProcess>>,
    pub venv: Option<VenvHandle>,
}

enum StepOutcome {
    Output(Value),
    Skipped,
    Jump { index: usize, params: Map<String, Value> },
    Return(Value),
    Daemon(Arc<SupervisedProcess>),
}

struct DefaultLookups;

impl SystemLookups for DefaultLookups {
    fn next_free_port(&self) -> HostResult<u16> {
        next_free_port()
    }

    fn which(&self, cmd: &str) -> Option<String> {
        which(cmd).map(|path| path.display().to_string())
    }
}

static LOOKUPS: DefaultLookups = DefaultLookups;

pub struct ScriptEngine {
    app_id: String,
    script_name: String,
    services: EngineServices,
}

impl ScriptEngine {
    pub fn new(app_id: &str, script_name: &str, services: EngineServices) -> Self {
        Self {
            app_id: app_id.to_string(),
            script_name: script_name.to_string(),
            services,
        }
    }

    /// Run a frame to completion. Boxed for `script.start` recursion.
    pub fn execute<'a>(
        &'a self,
        frame: &'a mut ExecutionFrame,
        cancel: &'a CancelToken,
        command: Option<&'a str>,
    ) -> BoxFuture<'a, HostResult<ScriptRun>> {
        Box::pin(async move {
            for name in &frame.script.env {
                if std::env::var_os(name).is_none() {
                    tracing::warn!(app = %self.app_id, var = name.as_str(), "declared env var is not set");
                }
            }

            let mut last_process: Option<Arc<SupervisedProcess>> = None;
            while frame.index < frame.script.run.len() {
                cancel.check()?;
                let step = frame.script.run[frame.index].clone();

                if let Some(when) = &step.when {
                    let scope = self.scope(frame);
                    let resolver = Resolver::new(&scope, &LOOKUPS);
                    if !resolver.eval_when(when)? {
                        self.emit_step(frame, &step, "skipped", command);
                        frame.input = Value::Null;
                        frame.index += 1;
                        continue;
                    }
                }

                let mut attempts = 0u32;
                let outcome = loop {
                    match self.run_op(&step, frame, cancel, command).await {
                        Ok(outcome) => break outcome,
                        Err(HostError::Cancelled) => return Err(HostError::Cancelled),
                        Err(err) => match recovery_for(&step, &err) {
                            Some(OnAction::Retry) if attempts < RETRY_MAX_ATTEMPTS => {
                                attempts += 1;
                                let backoff = RETRY_BASE_BACKOFF * 2u32.pow(attempts - 1);
                                tracing::warn!(
                                    app = %self.app_id,
                                    step = frame.index,
                                    error = %err,
                                    attempt = attempts,
                                    "step retry"
                                );
                                self.emit_step(frame, &step, "retry", command);
                                tokio::time::sleep(backoff).await;
                            }
                            Some(OnAction::Skip) => break StepOutcome::Skipped,
                            Some(OnAction::Jump(label)) => {
                                let index = self.target_index(&frame.script, &JumpTarget::Id(label.clone()))?;
                                break StepOutcome::Jump {
                                    index,
                                    params: Map::new(),
                                };
                            }
                            _ => {
                                self.emit_step(frame, &step, "failed", command);
                                return Err(err);
                            }
                        },
                    }
                };

                match outcome {
                    StepOutcome::Output(value) => {
                        self.emit_step(frame, &step, "ok", command);
                        frame.input = value;
                        frame.index += 1;
                    }
                    StepOutcome::Skipped => {
                        self.emit_step(frame, &step, "skipped", command);
                        frame.input = Value::Null;
                        frame.index += 1;
                    }
                    StepOutcome::Jump { index, params } => {
                        self.emit_step(frame, &step, "ok", command);
                        frame.locals.extend(params);
                        // `{{input}}` does not survive a jump.
                        frame.input = Value::Null;
                        frame.index = index;
                    }
                    StepOutcome::Return(value) => {
                        self.emit_step(frame, &step, "ok", command);
                        return Ok(ScriptRun {
                            return_value: value,
                            last_process,
                            venv: frame.venv.clone(),
                        });
                    }
                    StepOutcome::Daemon(process) => {
                        self.emit_step(frame, &step, "ok", command);
                        last_process = Some(process);
                        frame.input = Value::Null;
                        frame.index += 1;
                    }
                }
            }

            Ok(ScriptRun {
                return_value: frame.input.clone(),
                last_process,
                venv: frame.venv.clone(),
            })
        })
    }

    async fn run_op(
        &self,
        step: &Step,
        frame: &mut ExecutionFrame,
        cancel: &CancelToken,
        command: Option<&str>,
    ) -> HostResult<StepOutcome> {
        use pinokiod_core::Op;

        let scope = self.scope(frame);
        let resolver = Resolver::new(&scope, &LOOKUPS);
        let fs = &self.services.fs;

        let outcome = match &step.op {
            Op::ShellRun(params) => {
                let mut commands = Vec::with_capacity(params.message.len());
                for message in &params.message {
                    commands.push(resolver.resolve(message)?);
                }
                let cwd = match &params.cwd {
                    Some(raw) => fs.resolve(&frame.cwd, &resolver.resolve(raw)?)?,
                    None => frame.cwd.clone(),
                };
                let mut env = HashMap::new();
                for (key, value) in &params.env {
                    let text = match value {
                        Value::String(s) => resolver.resolve(s)?,
                        other => other.to_string(),
                    };
                    env.insert(key.clone(), text);
                }
                let venv = match &params.venv {
                    Some(raw) => {
                        let handle = self
                            .ensure_venv(frame, &resolver.resolve(raw)?, cancel)
                            .await?;
                        frame.venv = Some(handle.clone());
                        Some(handle)
                    }
                    None => None,
                };
                let request = ShellRequest {
                    commands,
                    cwd,
                    env,
                    venv,
                    sudo: params.sudo,
                };

                let last_step = frame.index + 1 == frame.script.run.len();
                if params.daemon || (frame.script.daemon && last_step) {
                    let readiness = self.readiness_for(step, params, &resolver)?;
                    let process = self
                        .services
                        .shell
                        .run_daemon(&self.app_id, &request, &readiness, cancel)
                        .await?;
                    StepOutcome::Daemon(process)
                } else {
                    let outcome = self
                        .services
                        .shell
                        .run(&self.app_id, &request, cancel)
                        .await?;
                    if outcome.exit_code != 0 {
                        let tail: Vec<String> = outcome
                            .lines
                            .iter()
                            .rev()
                            .take(20)
                            .rev()
                            .map(|l| l.line.clone())
                            .collect();
                        return Err(HostError::ShellNonzero {
                            code: outcome.exit_code,
                            tail: tail.join("\n"),
                        });
                    }
                    StepOutcome::Output(Value::String(outcome.stdout))
                }
            }

            Op::FsWrite { path, text } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                fs.write(&path, &resolver.resolve(text)?).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsRead { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                StepOutcome::Output(Value::String(fs.read(&path).await?))
            }
            Op::FsDownload(params) => {
                let mut resolved = params.clone();
                resolved.uri = resolver.resolve(&params.uri)?;
                resolved.path = resolver.resolve(&params.path)?;
                let dest = fs.resolve(&frame.cwd, &resolved.path)?;
                fs.download(&resolved, &dest, cancel).await?;
                StepOutcome::Output(Value::String(dest.display().to_string()))
            }
            Op::FsCopy { src, dst } => {
                let src = fs.resolve(&frame.cwd, &resolver.resolve(src)?)?;
                let dst = fs.resolve(&frame.cwd, &resolver.resolve(dst)?)?;
                fs.copy(&src, &dst).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsMove { src, dst } => {
                let src = fs.resolve(&frame.cwd, &resolver.resolve(src)?)?;
                let dst = fs.resolve(&frame.cwd, &resolver.resolve(dst)?)?;
                fs.rename(&src, &dst).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsRemove { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                fs.remove(&path).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsExists { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                StepOutcome::Output(Value::Bool(fs.exists(&path).await))
            }
            Op::FsMkdir { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                fs.mkdir(&path).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsReaddir { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let names = fs.readdir(&path).await?;
                StepOutcome::Output(Value::Array(
                    names.into_iter().map(Value::String).collect(),
                ))
            }
            Op::FsRmdir { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                fs.rmdir(&path).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::FsLink { src, dst } => {
                let src = fs.resolve(&frame.cwd, &resolver.resolve(src)?)?;
                let dst = fs.resolve(&frame.cwd, &resolver.resolve(dst)?)?;
                fs.link(&src, &dst).await?;
                StepOutcome::Output(Value::Null)
            }

            Op::JsonRead { path } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let doc: Value = serde_json::from_str(&fs.read(&path).await?)?;
                StepOutcome::Output(doc)
            }
            Op::JsonWrite { path, json } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let doc = resolver.resolve_value(json)?;
                atomic_write(&path, serde_json::to_string_pretty(&doc)?.as_bytes()).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::JsonGet { path, key } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let doc: Value = serde_json::from_str(&fs.read(&path).await?)?;
                let key = resolver.resolve(key)?;
                StepOutcome::Output(jsonops::get_path(&doc, &key).unwrap_or(Value::Null))
            }
            Op::JsonSet { path, json } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let mut doc = self.read_json_or_null(&path).await?;
                for (key, value) in json {
                    jsonops::set_path(&mut doc, key, resolver.resolve_value(value)?);
                }
                atomic_write(&path, serde_json::to_string_pretty(&doc)?.as_bytes()).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::JsonMerge { path, json } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let mut doc = self.read_json_or_null(&path).await?;
                jsonops::merge(&mut doc, &resolver.resolve_value(json)?);
                atomic_write(&path, serde_json::to_string_pretty(&doc)?.as_bytes()).await?;
                StepOutcome::Output(Value::Null)
            }
            Op::JsonRm { path, keys } => {
                let path = fs.resolve(&frame.cwd, &resolver.resolve(path)?)?;
                let mut doc = self.read_json_or_null(&path).await?;
                for key in keys {
                    jsonops::remove_path(&mut doc, &resolver.resolve(key)?);
                }
                atomic_write(&path, serde_json::to_string_pretty(&doc)?.as_bytes()).await?;
                StepOutcome::Output(Value::Null)
            }

            Op::NetRequest(params) => {
                let url = resolver.resolve(&params.url)?;
                let method = reqwest::Method::from_bytes(
                    resolver.resolve(&params.method)?.to_uppercase().as_bytes(),
                )
                .map_err(|_| HostError::parse(format!("bad http method '{}'", params.method)))?;
                let mut request = self.services.http.request(method, &url);
                for (key, value) in &params.headers {
                    let text = match value {
                        Value::String(s) => resolver.resolve(s)?,
                        other => other.to_string(),
                    };
                    request = request.header(key.as_str(), text);
                }
                if let Some(body) = &params.body {
                    let body = resolver.resolve_value(body)?;
                    request = match body {
                        Value::String(text) => request.body(text),
                        other => request.json(&other),
                    };
                }
                let response = tokio::time::timeout(self.services.http_timeout, request.send())
                    .await
                    .map_err(|_| HostError::Timeout {
                        secs: self.services.http_timeout.as_secs(),
                    })?
                    .map_err(|err| HostError::internal(err))?;
                let status = response.status();
                if status.is_client_error() || status.is_server_error() {
                    return Err(HostError::Internal {
                        reason: format!("{status} from {url}"),
                    });
                }
                let is_json = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.contains("json"));
                let text = response.text().await.map_err(|err| HostError::internal(err))?;
                let value = if is_json {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                } else {
                    Value::String(text)
                };
                StepOutcome::Output(value)
            }

            Op::Input(params) => {
                let mut resolved = params.clone();
                resolved.title = resolver.resolve(&params.title)?;
                let value = self
                    .services
                    .inputs
                    .request(&self.app_id, &resolved, command.map(str::to_string), cancel)
                    .await?;
                StepOutcome::Output(value)
            }

            Op::LocalSet { vars } => {
                let mut resolved = Map::with_capacity(vars.len());
                for (key, value) in vars {
                    resolved.insert(key.clone(), resolver.resolve_value(value)?);
                }
                frame.locals.extend(resolved.clone());
                self.services
                    .hooks
                    .persist_local_vars(&self.app_id, &resolved)?;
                StepOutcome::Output(Value::Null)
            }

            Op::Log { level, message } => {
                let message = resolver.resolve(message)?;
                match level {
                    LogLevel::Debug => tracing::debug!(app = %self.app_id, "{message}"),
                    LogLevel::Info => tracing::info!(app = %self.app_id, "{message}"),
                    LogLevel::Warn => tracing::warn!(app = %self.app_id, "{message}"),
                    LogLevel::Error => tracing::error!(app = %self.app_id, "{message}"),
                }
                self.services.events.emit(
                    EventKind::LogLine {
                        app_id: self.app_id.clone(),
                        stream: "script".into(),
                        line: message,
                    },
                    command.map(str::to_string),
                );
                StepOutcome::Output(Value::Null)
            }
            Op::Notify { message, href } => {
                self.services.events.emit(
                    EventKind::Notice {
                        app_id: self.app_id.clone(),
                        message: resolver.resolve(message)?,
                        href: href
                            .as_ref()
                            .map(|h| resolver.resolve(h))
                            .transpose()?,
                    },
                    command.map(str::to_string),
                );
                StepOutcome::Output(Value::Null)
            }
            Op::WebOpen { url } => {
                self.services.events.emit(
                    EventKind::OpenUrl {
                        app_id: self.app_id.clone(),
                        url: resolver.resolve(url)?,
                    },
                    command.map(str::to_string),
                );
                StepOutcome::Output(Value::Null)
            }

            Op::ScriptStart { uri, name, params } => {
                if frame.depth + 1 >= MAX_FRAME_DEPTH {
                    return Err(HostError::parse(format!(
                        "sub-script nesting exceeds depth {MAX_FRAME_DEPTH}"
                    )));
                }
                let args = match resolver.resolve_value(&Value::Object(params.clone()))? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let (script_path, root) = match uri {
                    Some(raw) => {
                        let dir = self.fetch_bundle(&resolver.resolve(raw)?, cancel).await?;
                        let path = find_script(
                            &dir,
                            &["start.js", "start.json", "install.js", "install.json"],
                        )
                        .ok_or_else(|| HostError::parse("no script in downloaded bundle"))?;
                        (path, dir)
                    }
                    None => {
                        let name = name.as_deref().ok_or_else(|| {
                            HostError::parse("script.start needs a name or a uri")
                        })?;
                        let path = fs.resolve(&frame.cwd, &resolver.resolve(name)?)?;
                        (path, frame.cwd.clone())
                    }
                };
                let (script, _) = load_script_file(&script_path)?;
                let mut child = frame.child(Arc::new(script), root, args);
                let run = self.execute(&mut child, cancel, command).await?;
                StepOutcome::Output(run.return_value)
            }
            Op::ScriptStop { uri } => {
                let target = match uri {
                    Some(raw) => resolver.resolve(raw)?,
                    None => self.app_id.clone(),
                };
                self.services.hooks.request_stop(&target);
                StepOutcome::Output(Value::Null)
            }
            Op::ScriptDownload { uri, dir } => {
                let uri = resolver.resolve(uri)?;
                let dest = match dir {
                    Some(raw) => fs.resolve(&frame.cwd, &resolver.resolve(raw)?)?,
                    None => self.bundle_dir(&uri),
                };
                self.clone_into(&uri, &dest, cancel).await?;
                StepOutcome::Output(Value::String(dest.display().to_string()))
            }
            Op::ScriptReturn { value } => {
                StepOutcome::Return(resolver.resolve_value(value)?)
            }

            Op::Jump { target, params } => {
                let index = self.target_index(&frame.script, target)?;
                let params = match resolver.resolve_value(&Value::Object(params.clone()))? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                StepOutcome::Jump { index, params }
            }

            Op::HfDownload(params) => {
                let value = self.hf_download(params, frame, &resolver, cancel).await?;
                StepOutcome::Output(value)
            }
        };
        Ok(outcome)
    }

    /// `hf.download`: fetch into the shared model store, then optionally
    /// link into the app tree.
    async fn hf_download(
        &self,
        params: &HfDownloadParams,
        frame: &ExecutionFrame,
        resolver: &Resolver<'_>,
        cancel: &CancelToken,
    ) -> HostResult<Value> {
        let (uri, relative) = match (&params.uri, &params.repo, &params.file) {
            (Some(uri), _, _) => {
                let uri = resolver.resolve(uri)?;
                let name = uri.rsplit('/').next().unwrap_or("artifact").to_string();
                (uri, PathBuf::from(name))
            }
            (None, Some(repo), Some(file)) => {
                let repo = resolver.resolve(repo)?;
                let file = resolver.resolve(file)?;
                (
                    format!("https://huggingface.co/{repo}/resolve/main/{file}"),
                    PathBuf::from(&repo).join(&file),
                )
            }
            _ => {
                return Err(HostError::parse(
                    "hf.download needs a uri or a repo+file pair",
                ));
            }
        };
        let base = match &params.dir {
            Some(dir) => self.services.models_root.join(resolver.resolve(dir)?),
            None => self.services.models_root.clone(),
        };
        let dest = base.join(&relative);
        let download = pinokiod_core::DownloadParams {
            uri,
            path: dest.display().to_string(),
            extract: false,
            sha256: None,
            size: None,
        };
        self.services.fs.download(&download, &dest, cancel).await?;
        if let Some(link_to) = &params.link_to {
            let link = self
                .services
                .fs
                .resolve(&frame.cwd, &resolver.resolve(link_to)?)?;
            self.services.fs.link(&dest, &link).await?;
        }
        Ok(Value::String(dest.display().to_string()))
    }

    async fn read_json_or_null(&self, path: &std::path::Path) -> HostResult<Value> {
        if self.services.fs.exists(path).await {
            Ok(serde_json::from_str(&self.services.fs.read(path).await?)?)
        } else {
            Ok(Value::Null)
        }
    }

    fn readiness_for(
        &self,
        step: &Step,
        params: &pinokiod_core::ShellRunParams,
        resolver: &Resolver<'_>,
    ) -> HostResult<ReadinessSpec> {
        let pattern = if let Some(ready) = &params.ready {
            Some(compile_pattern(&resolver.resolve(ready)?)?)
        } else if let Some(handler) = step.on.iter().find(|h| h.done) {
            Some(compile_pattern(&handler.event)?)
        } else {
            self.services.readiness_hint.clone()
        };
        Ok(ReadinessSpec {
            pattern,
            after: params.ready_after.map(Duration::from_secs),
        })
    }

    async fn ensure_venv(
        &self,
        frame: &ExecutionFrame,
        raw: &str,
        cancel: &CancelToken,
    ) -> HostResult<VenvHandle> {
        let path = if raw.contains('/') {
            self.services.fs.resolve(&frame.cwd, raw)?
        } else {
            self.services.venvs.path_for(&self.app_id, raw)
        };
        self.services.venvs.ensure(&path, VenvKind::Python, cancel).await
    }

    fn bundle_dir(&self, uri: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.services.cache_root.join(&digest[..16])
    }

    /// Fetch a script bundle for `script.start` with a uri; cached by url
    /// hash, so repeated invocations reuse the clone.
    async fn fetch_bundle(&self, uri: &str, cancel: &CancelToken) -> HostResult<PathBuf> {
        let dest = self.bundle_dir(uri);
        self.clone_into(uri, &dest, cancel).await?;
        Ok(dest)
    }

    async fn clone_into(
        &self,
        uri: &str,
        dest: &std::path::Path,
        cancel: &CancelToken,
    ) -> HostResult<()> {
        if dest.join(".git").is_dir() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
        }
        let request = ShellRequest {
            commands: vec![format!("git clone --depth 1 {uri} {}", dest.display())],
            cwd: self.services.cache_root.clone(),
            env: HashMap::new(),
            venv: None,
            sudo: false,
        };
        tokio::fs::create_dir_all(&self.services.cache_root)
            .await
            .map_err(HostError::io)?;
        let outcome = self.services.shell.run(&self.app_id, &request, cancel).await?;
        if outcome.exit_code != 0 {
            return Err(HostError::CloneFailed {
                reason: format!("git clone {uri} exited with {}", outcome.exit_code),
            });
        }
        Ok(())
    }

    fn target_index(&self, script: &Script, target: &JumpTarget) -> HostResult<usize> {
        match target {
            JumpTarget::Index(index) => {
                if *index >= script.run.len() {
                    return Err(HostError::parse(format!("jump index {index} out of range")));
                }
                Ok(*index)
            }
            JumpTarget::Id(label) => script
                .run
                .iter()
                .position(|s| s.id.as_deref() == Some(label))
                .ok_or_else(|| HostError::parse(format!("jump target '{label}' not found"))),
        }
    }

    fn scope(&self, frame: &ExecutionFrame) -> VarScope {
        let profile = &self.services.profile;
        VarScope {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            gpu: match profile.primary_gpu() {
                Some(_) => "nvidia".to_string(),
                None => "none".to_string(),
            },
            gpus: profile.gpus.iter().map(|g| g.name.clone()).collect(),
            cuda: profile.cuda_version().unwrap_or_default().to_string(),
            cwd: frame.cwd.display().to_string(),
            app: self.app_id.clone(),
            args: frame.args.clone(),
            local: frame.locals.clone(),
            envs: std::env::vars().collect(),
            input: frame.input.clone(),
            self_obj: frame.script.raw.clone(),
        }
    }

    fn emit_step(&self, frame: &ExecutionFrame, step: &Step, status: &str, command: Option<&str>) {
        self.services.events.emit(
            EventKind::StepProgress {
                app_id: self.app_id.clone(),
                script: self.script_name.clone(),
                index: frame.index,
                total: frame.script.run.len(),
                method: step.op.method_name().to_string(),
                status: status.to_string(),
            },
            command.map(str::to_string),
        );
    }
}

fn compile_pattern(raw: &str) -> HostResult<Regex> {
    let source = raw.trim().trim_matches('/');
    Regex::new(source).map_err(|err| HostError::parse(format!("bad pattern '{raw}': {err}")))
}

/// First non-done `on:` handler matching a failure. `stderr` matches any
/// failed shell step; `/regex/` matches the error text or the captured
/// output tail.
fn recovery_for<'s>(step: &'s Step, err: &HostError) -> Option<&'s OnAction> {
    for handler in &step.on {
        if handler.done {
            continue;
        }
        let Some(action) = &handler.action else {
            continue;
        };
        let matched = if handler.event == "stderr" {
            matches!(err, HostError::ShellNonzero { .. })
        } else {
            match compile_pattern(&handler.event) {
                Ok(pattern) => {
                    pattern.is_match(&err.to_string())
                        || matches!(err, HostError::ShellNonzero { tail, .. } if pattern.is_match(tail))
                }
                Err(_) => false,
            }
        };
        if matched {
            return Some(action);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::fsapi::FsApi;
    use crate::paths::PathMapper;
    use crate::supervisor::ProcessSupervisor;
    use parking_lot::Mutex;
    use pinokiod_core::{HostClass, ResourceLimits};
    use serde_json::json;
    use tempfile::TempDir;

    struct RecordingHooks {
        vars: Mutex<Map<String, Value>>,
        stops: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn new() -> Self {
            Self {
                vars: Mutex::new(Map::new()),
                stops: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostHooks for RecordingHooks {
        fn persist_local_vars(&self, _app_id: &str, vars: &Map<String, Value>) -> HostResult<()> {
            self.vars.lock().extend(vars.clone());
            Ok(())
        }

        fn request_stop(&self, app_id: &str) {
            self.stops.lock().push(app_id.to_string());
        }
    }

    struct Harness {
        _tmp: TempDir,
        engine: ScriptEngine,
        hooks: Arc<RecordingHooks>,
        install_root: PathBuf,
        events: EventBus,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let install_root = root.join("apps/hello");
        std::fs::create_dir_all(&install_root).unwrap();

        let events = EventBus::new();
        let mapper = PathMapper::new(root.clone(), root.clone());
        let fs = Arc::new(
            FsApi::new(
                mapper,
                root.join("drive/models"),
                root.join("cache"),
                root.join("venvs"),
                events.clone(),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let supervisor = Arc::new(ProcessSupervisor::new(events.clone(), Duration::from_secs(2)));
        let shell = Arc::new(ShellRunner::new(
            supervisor,
            events.clone(),
            root.join("logs"),
            Duration::from_secs(60),
            false,
        ));
        let profile = Arc::new(PlatformProfile {
            host: HostClass::GenericLinux,
            root: root.clone(),
            temp: std::env::temp_dir(),
            persistence: root.clone(),
            gpus: Vec::new(),
            limits: ResourceLimits::default(),
            containerized: false,
            allows_raw_signals: true,
            capabilities: Default::default(),
        });
        let hooks = Arc::new(RecordingHooks::new());
        let services = EngineServices {
            fs: fs.for_app("hello", install_root.clone()),
            shell,
            venvs: Arc::new(VenvManager::new(root.join("venvs"))),
            events: events.clone(),
            inputs: InputBroker::new(events.clone()),
            profile,
            hooks: hooks.clone(),
            http: reqwest::Client::new(),
            http_timeout: Duration::from_secs(5),
            cache_root: root.join("cache"),
            models_root: root.join("drive/models"),
            readiness_hint: None,
        };
        Harness {
            _tmp: tmp,
            engine: ScriptEngine::new("hello", "install", services),
            hooks,
            install_root,
            events,
        }
    }

    fn top_frame(h: &Harness, script: Value) -> ExecutionFrame {
        let script = Arc::new(Script::parse(script).unwrap());
        ExecutionFrame::top(script, h.install_root.clone(), Map::new(), Map::new())
    }

    async fn run(h: &Harness, frame: &mut ExecutionFrame) -> HostResult<ScriptRun> {
        h.engine.execute(frame, &CancelToken::never(), None).await
    }

    #[tokio::test]
    async fn stdout_flows_to_next_step_as_input() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "shell.run", "params": {"message": "echo flowing"}},
                {"method": "fs.write", "params": {"path": "out.txt", "text": "got: {{input}}"}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        let text = std::fs::read_to_string(h.install_root.join("out.txt")).unwrap();
        assert_eq!(text, "got: flowing");
    }

    #[tokio::test]
    async fn platform_conditionals_run_exactly_one_branch() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "fs.write", "params": {"path": "linux.txt", "text": "yes"},
                 "when": "{{platform === 'linux'}}"},
                {"method": "fs.write", "params": {"path": "other.txt", "text": "yes"},
                 "when": "{{platform !== 'linux'}}"}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        assert!(h.install_root.join("linux.txt").is_file());
        assert!(!h.install_root.join("other.txt").exists());
    }

    #[tokio::test]
    async fn jump_with_params_loops_bounded_by_when() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"id": "top", "method": "shell.run",
                 "params": {"message": "echo {{local.n}} >> loop.txt"},
                 "when": "{{local.n}}"},
                {"method": "local.set", "params": {"n": "done"}},
                {"method": "jump", "params": {"id": "top", "params": {"n": "again", "jumped": "yes"}},
                 "when": "{{!local.jumped}}"},
                {"method": "shell.run", "params": {"message": "echo {{local.n}} >> loop.txt"}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        let text = std::fs::read_to_string(h.install_root.join("loop.txt")).unwrap();
        assert_eq!(text, "again\ndone\n");
    }

    #[tokio::test]
    async fn local_set_persists_through_hooks() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "local.set", "params": {"token": "abc", "count": 2}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        assert_eq!(frame.locals["token"], json!("abc"));
        let persisted = h.hooks.vars.lock();
        assert_eq!(persisted["token"], json!("abc"));
        assert_eq!(persisted["count"], json!(2));
    }

    #[tokio::test]
    async fn empty_script_completes_ok() {
        let h = harness();
        let mut frame = top_frame(&h, json!({"run": []}));
        let outcome = run(&h, &mut frame).await.unwrap();
        assert_eq!(outcome.return_value, Value::Null);
    }

    #[tokio::test]
    async fn on_stderr_skip_recovers_a_failing_step() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "shell.run", "params": {"message": "echo doomed >&2; exit 1"},
                 "on": [{"event": "stderr", "return": "skip"}]},
                {"method": "fs.write", "params": {"path": "after.txt", "text": "reached"}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        assert!(h.install_root.join("after.txt").is_file());
    }

    #[tokio::test]
    async fn unrecovered_shell_failure_surfaces_shell_nonzero() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "shell.run", "params": {"message": "exit 7"}}
            ]}),
        );
        let err = run(&h, &mut frame).await.unwrap_err();
        assert_eq!(err.kind(), "shell-nonzero");
    }

    #[tokio::test]
    async fn script_return_short_circuits() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "script.return", "params": {"value": {"status": "early"}}},
                {"method": "fs.write", "params": {"path": "never.txt", "text": "x"}}
            ]}),
        );
        let outcome = run(&h, &mut frame).await.unwrap();
        assert_eq!(outcome.return_value, json!({"status": "early"}));
        assert!(!h.install_root.join("never.txt").exists());
    }

    #[tokio::test]
    async fn json_set_and_get_use_dot_paths() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "json.set", "params": {"path": "cfg.json", "json": {"server.port": 7860}}},
                {"method": "json.get", "params": {"path": "cfg.json", "key": "server.port"}},
                {"method": "fs.write", "params": {"path": "port.txt", "text": "{{input}}"}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        let doc: Value =
            serde_json::from_str(&std::fs::read_to_string(h.install_root.join("cfg.json")).unwrap())
                .unwrap();
        assert_eq!(doc, json!({"server": {"port": 7860}}));
        assert_eq!(
            std::fs::read_to_string(h.install_root.join("port.txt")).unwrap(),
            "7860"
        );
    }

    #[tokio::test]
    async fn unbound_template_fails_the_frame() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "fs.write", "params": {"path": "x.txt", "text": "{{args.missing}}"}}
            ]}),
        );
        let err = run(&h, &mut frame).await.unwrap_err();
        assert_eq!(err.kind(), "unbound-variable");
    }

    #[tokio::test]
    async fn sub_script_inherits_locals_but_never_leaks_back() {
        let h = harness();
        std::fs::write(
            h.install_root.join("sub.json"),
            json!({"run": [
                {"method": "local.set", "params": {"inner": "set-by-child"}},
                {"method": "script.return", "params": {"value": "{{args.greeting}} {{local.outer}}"}}
            ]})
            .to_string(),
        )
        .unwrap();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "local.set", "params": {"outer": "visible"}},
                {"method": "script.start", "params": {"name": "sub.json", "params": {"greeting": "hi"}}},
                {"method": "fs.write", "params": {"path": "result.txt", "text": "{{input}}"}}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(h.install_root.join("result.txt")).unwrap(),
            "hi visible"
        );
        assert!(!frame.locals.contains_key("inner"), "child locals must not leak");
    }

    #[tokio::test]
    async fn daemon_step_hands_over_last_process() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "shell.run",
                 "params": {"message": "echo serving at http://127.0.0.1:7999; sleep 20",
                            "daemon": true, "ready": "http://\\S+"}}
            ]}),
        );
        let outcome = run(&h, &mut frame).await.unwrap();
        let process = outcome.last_process.expect("daemon process");
        assert!(!process.has_exited());
        crate::supervisor::signal_group(process.info().pgid, libc::SIGKILL);
    }

    #[tokio::test]
    async fn script_stop_reaches_hooks() {
        let h = harness();
        let mut frame = top_frame(
            &h,
            json!({"run": [{"method": "script.stop", "params": {}}]}),
        );
        run(&h, &mut frame).await.unwrap();
        assert_eq!(h.hooks.stops.lock().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn step_progress_events_cover_each_step() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let mut frame = top_frame(
            &h,
            json!({"run": [
                {"method": "log", "params": {"message": "first"}},
                {"method": "log", "params": {"message": "second"}, "when": "false"}
            ]}),
        );
        run(&h, &mut frame).await.unwrap();
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventKind::StepProgress { index, status, .. } = event.kind {
                statuses.push((index, status));
            }
        }
        assert!(statuses.contains(&(0, "ok".to_string())));
        assert!(statuses.contains(&(1, "skipped".to_string())));
    }
}
