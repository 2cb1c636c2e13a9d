use pinokiod_core::{Script, VenvHandle};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Sub-script nesting cap; jumps cannot recurse but `script.start` can.
pub const MAX_FRAME_DEPTH: usize = 8;

/// One activation of the script engine: its own step cursor, locals, args,
/// working directory, and activated environment. Locals are inherited by
/// child frames by value on `script.start` and never flow back to parents;
/// the persistent bottom layer lives in the app record.
pub struct ExecutionFrame {
    pub script: Arc<Script>,
    pub index: usize,
    pub locals: Map<String, Value>,
    /// Read-only bindings from the caller.
    pub args: Map<String, Value>,
    pub cwd: PathBuf,
    pub venv: Option<VenvHandle>,
    /// Output of the previous step, exposed as `{{input}}`.
    pub input: Value,
    pub depth: usize,
}

impl ExecutionFrame {
    pub fn top(script: Arc<Script>, cwd: PathBuf, args: Map<String, Value>, locals: Map<String, Value>) -> Self {
        Self {
            script,
            index: 0,
            locals,
            args,
            cwd,
            venv: None,
            input: Value::Null,
            depth: 0,
        }
    }

    /// Copy-on-push child for a sub-script invocation.
    pub fn child(&self, script: Arc<Script>, cwd: PathBuf, args: Map<String, Value>) -> Self {
        Self {
            script,
            index: 0,
            locals: self.locals.clone(),
            args,
            cwd,
            venv: None,
            input: Value::Null,
            depth: self.depth + 1,
        }
    }
}
