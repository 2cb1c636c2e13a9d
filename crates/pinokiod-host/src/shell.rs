//! Shell execution.
//!
//! A `shell.run` step's commands (one or many) run inside a single shell
//! session so state like `cd` persists across items. Every invocation gets
//! a freshly merged environment; venv activation happens by env injection
//! (PATH prepend + interpreter variables), never by sourcing activation
//! scripts. Children start in their own session so cancellation and
//! shutdown can signal the whole group.

use crate::cancel::CancelToken;
use crate::events::EventBus;
use crate::platform::which;
use crate::supervisor::{OutputLine, ProcessSupervisor, SupervisedProcess, signal_group};
use pinokiod_core::{EventKind, HostError, HostResult, VenvHandle, VenvKind};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const OUTPUT_TAIL_LINES: usize = 1000;

#[derive(Clone, Debug)]
pub struct ShellRequest {
    pub commands: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub venv: Option<VenvHandle>,
    pub sudo: bool,
}

#[derive(Clone, Debug)]
pub struct ShellOutcome {
    pub exit_code: i32,
    /// Captured stdout, exposed to the next step as `{{input}}`.
    pub stdout: String,
    /// Tail of both streams, for `on:` handler matching.
    pub lines: Vec<OutputLine>,
}

impl ShellOutcome {
    pub fn stderr_seen(&self) -> bool {
        self.lines.iter().any(|l| l.stream == "stderr")
    }
}

/// Daemon readiness: first match of `pattern`, or `after` elapsing,
/// whichever comes first. With neither set the daemon is handed over
/// immediately and the server detector takes it from there.
#[derive(Clone, Debug, Default)]
pub struct ReadinessSpec {
    pub pattern: Option<Regex>,
    pub after: Option<Duration>,
}

pub struct ShellRunner {
    supervisor: Arc<ProcessSupervisor>,
    events: EventBus,
    logs_dir: PathBuf,
    shell_timeout: Duration,
    allow_sudo: bool,
}

impl ShellRunner {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        events: EventBus,
        logs_dir: PathBuf,
        shell_timeout: Duration,
        allow_sudo: bool,
    ) -> Self {
        Self {
            supervisor,
            events,
            logs_dir,
            shell_timeout,
            allow_sudo,
        }
    }

    /// Run to completion, streaming output to the event bus and collecting
    /// it for the caller. Non-zero exit is reported in the outcome, not as
    /// an error; the engine decides whether an `on:` handler recovers it.
    pub async fn run(
        &self,
        app_id: &str,
        request: &ShellRequest,
        cancel: &CancelToken,
    ) -> HostResult<ShellOutcome> {
        cancel.check()?;
        let env = self.merged_env(request)?;
        let mut child = spawn_session_with(&request.commands, &request.cwd, &env, request.sudo)?;
        let pgid = child.id().map(|pid| pid as i32);

        tokio::fs::create_dir_all(&self.logs_dir).await.map_err(HostError::io)?;
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_dir.join(format!("{app_id}.log")))
            .await
            .ok();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<OutputLine>();
        if let Some(out) = stdout {
            pump_lines(out, "stdout", line_tx.clone());
        }
        if let Some(err) = stderr {
            pump_lines(err, "stderr", line_tx.clone());
        }
        drop(line_tx);

        let mut lines: Vec<OutputLine> = Vec::new();
        let mut stdout_buf = String::new();
        let mut output_done = false;
        let deadline = tokio::time::sleep(self.shell_timeout);
        tokio::pin!(deadline);

        let exit_code = loop {
            tokio::select! {
                line = line_rx.recv(), if !output_done => {
                    match line {
                        Some(line) => {
                            self.record_line(app_id, &line, &mut lines, &mut stdout_buf, &mut log_file)
                                .await;
                            if lines.len() >= OUTPUT_TAIL_LINES * 2 {
                                lines.drain(..OUTPUT_TAIL_LINES);
                            }
                        }
                        // Output closed; keep waiting for the exit status.
                        None => output_done = true,
                    }
                }
                status = child.wait() => {
                    // Drain whatever the pumps still hold.
                    while let Some(line) = line_rx.recv().await {
                        self.record_line(app_id, &line, &mut lines, &mut stdout_buf, &mut log_file)
                            .await;
                    }
                    break status.map_err(HostError::io)?.code().unwrap_or(-1);
                }
                _ = cancel.cancelled() => {
                    if let Some(pgid) = pgid {
                        terminate_group(pgid, Duration::from_secs(5)).await;
                    }
                    let _ = child.wait().await;
                    return Err(HostError::Cancelled);
                }
                _ = &mut deadline => {
                    if let Some(pgid) = pgid {
                        terminate_group(pgid, Duration::from_secs(5)).await;
                    }
                    let _ = child.wait().await;
                    return Err(HostError::Timeout { secs: self.shell_timeout.as_secs() });
                }
            }
        };

        if let Some(file) = log_file.as_mut() {
            use tokio::io::AsyncWriteExt;
            let _ = file.flush().await;
        }
        if lines.len() > OUTPUT_TAIL_LINES {
            lines.drain(..lines.len() - OUTPUT_TAIL_LINES);
        }
        Ok(ShellOutcome {
            exit_code,
            stdout: stdout_buf,
            lines,
        })
    }

    /// Spawn, transfer to the supervisor, and wait for readiness.
    pub async fn run_daemon(
        &self,
        app_id: &str,
        request: &ShellRequest,
        readiness: &ReadinessSpec,
        cancel: &CancelToken,
    ) -> HostResult<Arc<SupervisedProcess>> {
        cancel.check()?;
        let env = self.merged_env(request)?;
        let child = spawn_session_with(&request.commands, &request.cwd, &env, request.sudo)?;
        let log_path = self.logs_dir.join(format!("{app_id}.log"));
        tokio::fs::create_dir_all(&self.logs_dir).await.map_err(HostError::io)?;
        let process = self.supervisor.adopt(app_id, child, log_path)?;

        match (&readiness.pattern, readiness.after) {
            (Some(pattern), _) => {
                // The line may already have landed in the tail before the
                // watcher subscribes.
                let already = process.tail().iter().any(|l| pattern.is_match(l));
                if !already {
                    let timeout = readiness.after.unwrap_or(self.shell_timeout);
                    tokio::select! {
                        matched = process.wait_for_line(pattern, timeout) => {
                            if matched.is_none() && process.has_exited() {
                                let tail = process.tail().join("\n");
                                self.supervisor.terminate(app_id).await?;
                                return Err(HostError::ShellNonzero { code: -1, tail });
                            }
                        }
                        _ = cancel.cancelled() => {
                            self.supervisor.terminate(app_id).await?;
                            return Err(HostError::Cancelled);
                        }
                    }
                }
            }
            (None, Some(after)) => {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {}
                    _ = cancel.cancelled() => {
                        self.supervisor.terminate(app_id).await?;
                        return Err(HostError::Cancelled);
                    }
                }
            }
            (None, None) => {}
        }
        Ok(process)
    }

    async fn record_line(
        &self,
        app_id: &str,
        line: &OutputLine,
        lines: &mut Vec<OutputLine>,
        stdout_buf: &mut String,
        log_file: &mut Option<tokio::fs::File>,
    ) {
        if line.stream == "stdout" {
            if !stdout_buf.is_empty() {
                stdout_buf.push('\n');
            }
            stdout_buf.push_str(&line.line);
        }
        if let Some(file) = log_file.as_mut() {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(line.line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        self.events.emit(
            EventKind::LogLine {
                app_id: app_id.to_string(),
                stream: line.stream.into(),
                line: line.line.clone(),
            },
            None,
        );
        lines.push(line.clone());
    }

    fn merged_env(&self, request: &ShellRequest) -> HostResult<HashMap<String, String>> {
        if request.sudo && !self.allow_sudo {
            return Err(HostError::illegal(
                "sudo escalation is not permitted on this platform",
            ));
        }
        let mut env: HashMap<String, String> = std::env::vars().collect();
        if let Some(venv) = &request.venv {
            apply_venv(&mut env, venv);
        }
        for (key, value) in &request.env {
            env.insert(key.clone(), value.clone());
        }
        Ok(env)
    }
}

/// Activation by env injection only.
fn apply_venv(env: &mut HashMap<String, String>, venv: &VenvHandle) {
    let bin = match venv.kind {
        VenvKind::Python => venv.path.join("bin"),
        VenvKind::Node => venv.path.join("node_modules").join(".bin"),
    };
    let path = env.get("PATH").cloned().unwrap_or_default();
    env.insert(
        "PATH".to_string(),
        format!("{}:{}", bin.display(), path),
    );
    if venv.kind == VenvKind::Python {
        env.insert("VIRTUAL_ENV".to_string(), venv.path.display().to_string());
        env.remove("PYTHONHOME");
    }
}

/// Spawn one shell session running `commands` joined by newlines, in its
/// own session/process group, with piped output.
pub fn spawn_session(
    commands: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> HostResult<Child> {
    spawn_session_with(commands, cwd, env, false)
}

fn spawn_session_with(
    commands: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    sudo: bool,
) -> HostResult<Child> {
    let shell = which("bash").unwrap_or_else(|| PathBuf::from("/bin/sh"));
    let script = commands.join("\n");
    let mut command = if sudo {
        let mut c = Command::new("sudo");
        c.arg("-n").arg(&shell);
        c
    } else {
        Command::new(&shell)
    };
    command
        .arg("-c")
        .arg(&script)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        // Fresh session; signals target the group, never a single pid.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    command.spawn().map_err(HostError::io)
}

fn pump_lines(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: &'static str,
    tx: tokio::sync::mpsc::UnboundedSender<OutputLine>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine { stream, line }).is_err() {
                break;
            }
        }
    });
}

async fn terminate_group(pgid: i32, grace: Duration) {
    signal_group(pgid, libc::SIGTERM);
    tokio::time::sleep(grace).await;
    signal_group(pgid, libc::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use tempfile::TempDir;

    fn runner(tmp: &TempDir) -> ShellRunner {
        let events = EventBus::new();
        let supervisor = Arc::new(ProcessSupervisor::new(events.clone(), Duration::from_secs(2)));
        ShellRunner::new(
            supervisor,
            events,
            tmp.path().join("logs"),
            Duration::from_secs(30),
            false,
        )
    }

    fn request(commands: &[&str], cwd: &Path) -> ShellRequest {
        ShellRequest {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env: HashMap::new(),
            venv: None,
            sudo: false,
        }
    }

    #[tokio::test]
    async fn captures_stdout_as_step_output() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let outcome = shell
            .run("t", &request(&["echo hello"], tmp.path()), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "hello");
    }

    #[tokio::test]
    async fn command_array_runs_as_one_session() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let shell = runner(&tmp);
        let outcome = shell
            .run(
                "t",
                &request(&["cd sub", "pwd"], tmp.path()),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.ends_with("/sub"), "got {}", outcome.stdout);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let outcome = shell
            .run(
                "t",
                &request(&["echo oops >&2", "exit 3"], tmp.path()),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.stderr_seen());
    }

    #[tokio::test]
    async fn env_overrides_reach_the_session() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let mut req = request(&["echo $GREETING"], tmp.path());
        req.env.insert("GREETING".into(), "bonjour".into());
        let outcome = shell.run("t", &req, &CancelToken::never()).await.unwrap();
        assert_eq!(outcome.stdout, "bonjour");
    }

    #[tokio::test]
    async fn venv_activation_prepends_path() {
        let tmp = TempDir::new().unwrap();
        let venv_dir = tmp.path().join("env");
        std::fs::create_dir_all(venv_dir.join("bin")).unwrap();
        let shell = runner(&tmp);
        let mut req = request(&["echo $PATH", "echo $VIRTUAL_ENV"], tmp.path());
        req.venv = Some(VenvHandle {
            path: venv_dir.clone(),
            kind: VenvKind::Python,
        });
        let outcome = shell.run("t", &req, &CancelToken::never()).await.unwrap();
        let text = outcome.stdout;
        assert!(text.starts_with(&format!("{}/bin:", venv_dir.display())));
        assert!(text.contains(&venv_dir.display().to_string()));
    }

    #[tokio::test]
    async fn sudo_rejected_when_platform_disallows() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let mut req = request(&["id"], tmp.path());
        req.sudo = true;
        let err = shell.run("t", &req, &CancelToken::never()).await.unwrap_err();
        assert_eq!(err.kind(), "illegal-state");
    }

    #[tokio::test]
    async fn cancellation_kills_the_session() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let source = CancelSource::new();
        let token = source.token();
        let handle = tokio::spawn({
            let req = request(&["sleep 60"], tmp.path());
            async move { shell.run("t", &req, &token).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.cancel();
        let err = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn daemon_hands_process_to_supervisor_after_ready_match() {
        let tmp = TempDir::new().unwrap();
        let shell = runner(&tmp);
        let req = request(&["echo serving on http://127.0.0.1:7860", "sleep 30"], tmp.path());
        let readiness = ReadinessSpec {
            pattern: Some(Regex::new(r"http://\S+").unwrap()),
            after: Some(Duration::from_secs(10)),
        };
        let process = shell
            .run_daemon("daemon-app", &req, &readiness, &CancelToken::never())
            .await
            .unwrap();
        assert!(!process.has_exited());
        shell.supervisor.terminate("daemon-app").await.unwrap();
    }
}
