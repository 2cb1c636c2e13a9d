//! Script AST and parser.
//!
//! A script is a JSON document `{version?, run: [step, ...], daemon?, env?}`.
//! Each step carries a `method` discriminator and a typed parameter bag;
//! parsing turns the string-keyed form into the closed [`Op`] variant set so
//! the engine dispatches exhaustively. Template strings (`{{...}}`) stay raw
//! here; the variable resolver expands them at execution time.

use crate::error::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Major script versions this interpreter understands.
pub const SUPPORTED_MAJORS: std::ops::RangeInclusive<u32> = 1..=4;

#[derive(Clone, Debug, PartialEq)]
pub struct Script {
    pub version: Option<String>,
    pub run: Vec<Step>,
    /// If true the script remains "running" after its last step; the final
    /// spawned process is handed to the supervisor.
    pub daemon: bool,
    /// Names of environment variables the script requires.
    pub env: Vec<String>,
    /// The document as authored, exposed to templates as `{{self.*}}`.
    pub raw: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub op: Op,
    pub when: Option<String>,
    pub id: Option<String>,
    pub on: Vec<OnHandler>,
}

/// Recovery directive attached to a step via `on:`.
#[derive(Clone, Debug, PartialEq)]
pub struct OnHandler {
    /// `"stderr"`, or a `/regex/` matched against output lines.
    pub event: String,
    /// Marks a daemon readiness match rather than a recovery.
    pub done: bool,
    pub action: Option<OnAction>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnAction {
    Retry,
    Skip,
    Jump(String),
}

impl OnAction {
    fn parse(raw: &str) -> HostResult<Self> {
        match raw {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            _ => match raw.strip_prefix("jump:") {
                Some(label) if !label.is_empty() => Ok(Self::Jump(label.to_string())),
                _ => Err(HostError::parse(format!("unknown on-return '{raw}'"))),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JumpTarget {
    Index(usize),
    Id(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    Password,
    Number,
    Select,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ShellRunParams {
    /// A single command, or several run inside one shell session so state
    /// like `cd` persists across items.
    #[serde(deserialize_with = "one_or_many")]
    pub message: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub daemon: bool,
    /// Readiness pattern for daemon mode; overrides the descriptor hint.
    #[serde(default)]
    pub ready: Option<String>,
    /// Seconds after which a daemon is considered ready without a match.
    #[serde(default, rename = "readyAfter")]
    pub ready_after: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DownloadParams {
    pub uri: String,
    pub path: String,
    /// Extract `.zip`/`.tar`/`.tar.gz`/`.tgz` in place after download.
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NetRequestParams {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct InputParams {
    #[serde(default)]
    pub kind: InputKind,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Fixed option list; required for `select`.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

/// `hf.download` accepts exactly this shape; undeclared fields fail with
/// `unknown-method` rather than `script-parse`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HfDownloadParams {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    /// Path inside the app tree to link the shared artifact into.
    #[serde(default)]
    pub link_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    ShellRun(ShellRunParams),
    FsWrite { path: String, text: String },
    FsRead { path: String },
    FsDownload(DownloadParams),
    FsCopy { src: String, dst: String },
    FsMove { src: String, dst: String },
    FsRemove { path: String },
    FsExists { path: String },
    FsMkdir { path: String },
    FsReaddir { path: String },
    FsRmdir { path: String },
    FsLink { src: String, dst: String },
    JsonRead { path: String },
    JsonWrite { path: String, json: Value },
    JsonGet { path: String, key: String },
    JsonSet { path: String, json: Map<String, Value> },
    JsonMerge { path: String, json: Value },
    JsonRm { path: String, keys: Vec<String> },
    NetRequest(NetRequestParams),
    Input(InputParams),
    LocalSet { vars: Map<String, Value> },
    Log { level: LogLevel, message: String },
    Notify { message: String, href: Option<String> },
    ScriptStart { uri: Option<String>, name: Option<String>, params: Map<String, Value> },
    ScriptStop { uri: Option<String> },
    ScriptDownload { uri: String, dir: Option<String> },
    ScriptReturn { value: Value },
    Jump { target: JumpTarget, params: Map<String, Value> },
    WebOpen { url: String },
    HfDownload(HfDownloadParams),
}

impl Op {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::ShellRun(_) => "shell.run",
            Self::FsWrite { .. } => "fs.write",
            Self::FsRead { .. } => "fs.read",
            Self::FsDownload(_) => "fs.download",
            Self::FsCopy { .. } => "fs.copy",
            Self::FsMove { .. } => "fs.move",
            Self::FsRemove { .. } => "fs.remove",
            Self::FsExists { .. } => "fs.exists",
            Self::FsMkdir { .. } => "fs.mkdir",
            Self::FsReaddir { .. } => "fs.readdir",
            Self::FsRmdir { .. } => "fs.rmdir",
            Self::FsLink { .. } => "fs.link",
            Self::JsonRead { .. } => "json.read",
            Self::JsonWrite { .. } => "json.write",
            Self::JsonGet { .. } => "json.get",
            Self::JsonSet { .. } => "json.set",
            Self::JsonMerge { .. } => "json.merge",
            Self::JsonRm { .. } => "json.rm",
            Self::NetRequest(_) => "net.request",
            Self::Input(_) => "input",
            Self::LocalSet { .. } => "local.set",
            Self::Log { .. } => "log",
            Self::Notify { .. } => "notify",
            Self::ScriptStart { .. } => "script.start",
            Self::ScriptStop { .. } => "script.stop",
            Self::ScriptDownload { .. } => "script.download",
            Self::ScriptReturn { .. } => "script.return",
            Self::Jump { .. } => "jump",
            Self::WebOpen { .. } => "web.open",
            Self::HfDownload(_) => "hf.download",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    run: Vec<RawStep>,
    #[serde(default)]
    daemon: bool,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    on: Vec<RawHandler>,
}

#[derive(Debug, Deserialize)]
struct RawHandler {
    event: String,
    #[serde(default)]
    done: bool,
    #[serde(default, rename = "return")]
    ret: Option<String>,
}

impl Script {
    pub fn parse_str(text: &str) -> HostResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| HostError::parse(err.to_string()))?;
        Self::parse(value)
    }

    pub fn parse(value: Value) -> HostResult<Self> {
        let raw: RawScript = serde_json::from_value(value.clone())
            .map_err(|err| HostError::parse(err.to_string()))?;
        if let Some(version) = raw.version.as_deref() {
            check_version(version)?;
        }

        let mut run = Vec::with_capacity(raw.run.len());
        for (index, step) in raw.run.into_iter().enumerate() {
            run.push(parse_step(step).map_err(|err| annotate_step(err, index))?);
        }

        let script = Self {
            version: raw.version,
            run,
            daemon: raw.daemon,
            env: raw.env,
            raw: value,
        };
        script.validate_jumps()?;
        Ok(script)
    }

    pub fn step_ids(&self) -> HashSet<&str> {
        self.run.iter().filter_map(|s| s.id.as_deref()).collect()
    }

    fn validate_jumps(&self) -> HostResult<()> {
        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.run {
            if let Some(id) = step.id.as_deref() {
                if !ids.insert(id) {
                    return Err(HostError::parse(format!("duplicate step id '{id}'")));
                }
            }
        }
        for (index, step) in self.run.iter().enumerate() {
            let targets = jump_labels(step);
            for target in targets {
                match target {
                    JumpTarget::Index(i) => {
                        if *i >= self.run.len() {
                            return Err(HostError::parse(format!(
                                "step {index}: jump index {i} is out of range"
                            )));
                        }
                    }
                    JumpTarget::Id(label) => {
                        if !ids.contains(label.as_str()) {
                            return Err(HostError::parse(format!(
                                "step {index}: jump target '{label}' not found"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn jump_labels(step: &Step) -> Vec<&JumpTarget> {
    let mut out = Vec::new();
    if let Op::Jump { target, .. } = &step.op {
        out.push(target);
    }
    out
}

fn annotate_step(err: HostError, index: usize) -> HostError {
    match err {
        HostError::ScriptParse { reason } => {
            HostError::parse(format!("step {index}: {reason}"))
        }
        other => other,
    }
}

fn check_version(version: &str) -> HostResult<()> {
    let major: u32 = version
        .split('.')
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| HostError::parse(format!("unparseable script version '{version}'")))?;
    if !SUPPORTED_MAJORS.contains(&major) {
        return Err(HostError::parse(format!(
            "script version '{version}' outside supported majors {}..={}",
            SUPPORTED_MAJORS.start(),
            SUPPORTED_MAJORS.end()
        )));
    }
    Ok(())
}

fn parse_step(raw: RawStep) -> HostResult<Step> {
    let mut on = Vec::with_capacity(raw.on.len());
    for handler in raw.on {
        let action = handler.ret.as_deref().map(OnAction::parse).transpose()?;
        on.push(OnHandler {
            event: handler.event,
            done: handler.done,
            action,
        });
    }
    Ok(Step {
        op: parse_op(&raw.method, raw.params)?,
        when: raw.when,
        id: raw.id,
        on,
    })
}

fn parse_op(method: &str, params: Value) -> HostResult<Op> {
    // A step with no `params` reads as an empty bag.
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    };
    let op = match method {
        "shell.run" => Op::ShellRun(typed(params)?),
        "fs.write" => {
            let p: PathText = typed(params)?;
            Op::FsWrite {
                path: p.path,
                text: p.text,
            }
        }
        "fs.read" => Op::FsRead { path: path_only(params)? },
        "fs.download" => Op::FsDownload(typed(params)?),
        "fs.copy" => {
            let p: SrcDst = typed(params)?;
            Op::FsCopy { src: p.src, dst: p.dst }
        }
        "fs.move" => {
            let p: SrcDst = typed(params)?;
            Op::FsMove { src: p.src, dst: p.dst }
        }
        "fs.remove" => Op::FsRemove { path: path_only(params)? },
        "fs.exists" => Op::FsExists { path: path_only(params)? },
        "fs.mkdir" => Op::FsMkdir { path: path_only(params)? },
        "fs.readdir" => Op::FsReaddir { path: path_only(params)? },
        "fs.rmdir" => Op::FsRmdir { path: path_only(params)? },
        "fs.link" => {
            let p: SrcDst = typed(params)?;
            Op::FsLink { src: p.src, dst: p.dst }
        }
        "json.read" => Op::JsonRead { path: path_only(params)? },
        "json.write" => {
            let p: PathJson = typed(params)?;
            Op::JsonWrite { path: p.path, json: p.json }
        }
        "json.get" => {
            let p: PathKey = typed(params)?;
            Op::JsonGet { path: p.path, key: p.key }
        }
        "json.set" => {
            let p: PathJsonMap = typed(params)?;
            Op::JsonSet { path: p.path, json: p.json }
        }
        "json.merge" => {
            let p: PathJson = typed(params)?;
            Op::JsonMerge { path: p.path, json: p.json }
        }
        "json.rm" => {
            let p: PathKeys = typed(params)?;
            Op::JsonRm { path: p.path, keys: p.keys }
        }
        "net.request" => Op::NetRequest(typed(params)?),
        "input" => Op::Input(typed(params)?),
        "local.set" => {
            let vars = match params {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(HostError::parse(format!(
                        "local.set expects an object, got {other}"
                    )));
                }
            };
            Op::LocalSet { vars }
        }
        "log" => {
            let p: LogParams = typed(params)?;
            Op::Log { level: p.level, message: p.message }
        }
        "notify" => {
            let p: NotifyParams = typed(params)?;
            Op::Notify { message: p.message, href: p.href }
        }
        "script.start" => {
            let p: ScriptStartParams = typed(params)?;
            Op::ScriptStart { uri: p.uri, name: p.name, params: p.params }
        }
        "script.stop" => {
            let p: ScriptStopParams = typed(params)?;
            Op::ScriptStop { uri: p.uri }
        }
        "script.download" => {
            let p: ScriptDownloadParams = typed(params)?;
            Op::ScriptDownload { uri: p.uri, dir: p.dir }
        }
        "script.return" => {
            let p: ScriptReturnParams = typed(params)?;
            Op::ScriptReturn { value: p.value }
        }
        "jump" => {
            let p: JumpParams = typed(params)?;
            let target = match (p.index, p.id) {
                (Some(index), None) => JumpTarget::Index(index),
                (None, Some(id)) => JumpTarget::Id(id),
                _ => {
                    return Err(HostError::parse(
                        "jump requires exactly one of index: or id:",
                    ));
                }
            };
            Op::Jump { target, params: p.params }
        }
        "web.open" => {
            let p: WebOpenParams = typed(params)?;
            Op::WebOpen { url: p.url }
        }
        "hf.download" => {
            let parsed = serde_json::from_value::<HfDownloadParams>(params).map_err(|err| {
                let reason = err.to_string();
                if reason.contains("unknown field") {
                    HostError::UnknownMethod {
                        method: format!("hf.download ({reason})"),
                    }
                } else {
                    HostError::parse(reason)
                }
            })?;
            Op::HfDownload(parsed)
        }
        other => {
            return Err(HostError::UnknownMethod {
                method: other.to_string(),
            });
        }
    };
    Ok(op)
}

fn typed<T: serde::de::DeserializeOwned>(params: Value) -> HostResult<T> {
    serde_json::from_value(params).map_err(|err| HostError::parse(err.to_string()))
}

fn path_only(params: Value) -> HostResult<String> {
    let p: PathOnly = typed(params)?;
    Ok(p.path)
}

#[derive(Deserialize)]
struct PathOnly {
    path: String,
}

#[derive(Deserialize)]
struct PathText {
    path: String,
    text: String,
}

#[derive(Deserialize)]
struct SrcDst {
    src: String,
    dst: String,
}

#[derive(Deserialize)]
struct PathJson {
    path: String,
    json: Value,
}

#[derive(Deserialize)]
struct PathJsonMap {
    path: String,
    json: Map<String, Value>,
}

#[derive(Deserialize)]
struct PathKey {
    path: String,
    key: String,
}

#[derive(Deserialize)]
struct PathKeys {
    path: String,
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct LogParams {
    #[serde(default)]
    level: LogLevel,
    message: String,
}

#[derive(Deserialize)]
struct NotifyParams {
    message: String,
    #[serde(default)]
    href: Option<String>,
}

#[derive(Deserialize)]
struct ScriptStartParams {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
}

#[derive(Deserialize)]
struct ScriptStopParams {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Deserialize)]
struct ScriptDownloadParams {
    uri: String,
    #[serde(default)]
    dir: Option<String>,
}

#[derive(Deserialize)]
struct ScriptReturnParams {
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct JumpParams {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
}

#[derive(Deserialize)]
struct WebOpenParams {
    url: String,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(single) => vec![single],
        OneOrMany::Many(list) => list,
    })
}
