//! Process supervision.
//!
//! Every supervised process runs in its own session/process group; signals
//! always target the group. stdout/stderr are multiplexed into a bounded
//! in-memory tail, an append-only log file, the event stream, and a
//! broadcast channel that readiness watchers subscribe to. On supervisor
//! shutdown no process outlives the grace window.

use crate::events::EventBus;
use parking_lot::Mutex;
use pinokiod_core::{EventKind, HostError, HostResult, ProcessInfo};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};

const TAIL_MAX_LINES: usize = 1000;
const OUTPUT_CHANNEL_CAPACITY: usize = 512;

#[derive(Clone, Debug)]
pub struct OutputLine {
    pub stream: &'static str,
    pub line: String,
}

#[derive(Debug)]
pub struct SupervisedProcess {
    app_id: String,
    pid: u32,
    pgid: i32,
    log_path: PathBuf,
    tail: Mutex<VecDeque<String>>,
    output_tx: broadcast::Sender<OutputLine>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl SupervisedProcess {
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            pgid: self.pgid,
            log_path: self.log_path.clone(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output_tx.subscribe()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// First output line matching `pattern`, or `None` on process exit /
    /// timeout. Each call is an independent registration and fires at most
    /// once.
    pub async fn wait_for_line(&self, pattern: &Regex, timeout: Duration) -> Option<String> {
        let mut rx = self.subscribe_output();
        let mut exit = self.exit_watch();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Ok(output) if pattern.is_match(&output.line) => {
                        return Some(output.line);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = exit.changed() => {
                    if exit.borrow().is_some() {
                        return None;
                    }
                }
                _ = &mut deadline => return None,
            }
        }
    }
}

pub struct ProcessSupervisor {
    table: Mutex<HashMap<String, Arc<SupervisedProcess>>>,
    events: EventBus,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(events: EventBus, kill_grace: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            events,
            kill_grace,
        }
    }

    pub fn get(&self, app_id: &str) -> Option<Arc<SupervisedProcess>> {
        self.table.lock().get(app_id).cloned()
    }

    /// Take ownership of a freshly spawned child. The child must have been
    /// started in its own session (see [`crate::shell`]) with piped output.
    pub fn adopt(
        &self,
        app_id: &str,
        mut child: Child,
        log_path: PathBuf,
    ) -> HostResult<Arc<SupervisedProcess>> {
        let pid = child.id().ok_or_else(|| {
            HostError::internal("child exited before supervision began")
        })?;
        let pgid = pid as i32;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let process = Arc::new(SupervisedProcess {
            app_id: app_id.to_string(),
            pid,
            pgid,
            log_path: log_path.clone(),
            tail: Mutex::new(VecDeque::new()),
            output_tx: output_tx.clone(),
            exit_rx,
        });

        if let Some(stdout) = child.stdout.take() {
            self.pump(Arc::clone(&process), stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(Arc::clone(&process), stderr, "stderr");
        }

        {
            let app_id = app_id.to_string();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(err) => {
                        tracing::warn!(app = %app_id, error = %err, "wait failed");
                        -1
                    }
                };
                tracing::info!(app = %app_id, code, "supervised process exited");
                let _ = exit_tx.send(Some(code));
            });
        }

        let mut table = self.table.lock();
        if let Some(existing) = table.get(app_id) {
            if !existing.has_exited() {
                return Err(HostError::illegal(format!(
                    "app '{app_id}' already has a supervised process"
                )));
            }
        }
        table.insert(app_id.to_string(), Arc::clone(&process));
        Ok(process)
    }

    fn pump(
        &self,
        process: Arc<SupervisedProcess>,
        reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        stream: &'static str,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut log_file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&process.log_path)
                .await
                .ok();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut tail = process.tail.lock();
                    tail.push_back(line.clone());
                    while tail.len() > TAIL_MAX_LINES {
                        tail.pop_front();
                    }
                }
                if let Some(file) = log_file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
                events.emit(
                    EventKind::LogLine {
                        app_id: process.app_id.clone(),
                        stream: stream.into(),
                        line: line.clone(),
                    },
                    None,
                );
                let _ = process.output_tx.send(OutputLine { stream, line });
            }
            if let Some(file) = log_file.as_mut() {
                let _ = file.flush().await;
            }
        });
    }

    /// SIGTERM the group, escalate to SIGKILL after the grace window, and
    /// wait until the direct child is reaped. Idempotent once gone.
    pub async fn terminate(&self, app_id: &str) -> HostResult<()> {
        let Some(process) = self.get(app_id) else {
            return Ok(());
        };
        if !process.has_exited() {
            signal_group(process.pgid, libc::SIGTERM);
            let mut exit = process.exit_watch();
            let reaped = tokio::time::timeout(self.kill_grace, async {
                while exit.borrow().is_none() {
                    if exit.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if reaped.is_err() {
                tracing::warn!(app = %app_id, "grace window elapsed, escalating to SIGKILL");
                signal_group(process.pgid, libc::SIGKILL);
                let mut exit = process.exit_watch();
                let _ = tokio::time::timeout(self.kill_grace, async {
                    while exit.borrow().is_none() {
                        if exit.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            }
        }
        self.table.lock().remove(app_id);
        Ok(())
    }

    /// Kill every group; called on host shutdown.
    pub async fn shutdown(&self) {
        let app_ids: Vec<String> = self.table.lock().keys().cloned().collect();
        for app_id in app_ids {
            if let Err(err) = self.terminate(&app_id).await {
                tracing::warn!(app = %app_id, error = %err, "terminate during shutdown failed");
            }
        }
    }
}

#[cfg(unix)]
pub fn signal_group(pgid: i32, signal: i32) {
    // Negative pid semantics via killpg: the whole group, never one pid.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: i32, _signal: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::spawn_session;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn supervisor() -> (ProcessSupervisor, EventBus) {
        let events = EventBus::new();
        (
            ProcessSupervisor::new(events.clone(), Duration::from_secs(2)),
            events,
        )
    }

    #[tokio::test]
    async fn output_reaches_tail_log_and_watchers() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("echo.log");
        let (sup, _events) = supervisor();

        let child = spawn_session(
            &["echo ready-on-7860".to_string()],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();
        let process = sup.adopt("echo", child, log_path.clone()).unwrap();

        let pattern = Regex::new(r"ready-on-(\d+)").unwrap();
        let line = process
            .wait_for_line(&pattern, Duration::from_secs(5))
            .await
            .expect("readiness line");
        assert!(line.contains("ready-on-7860"));

        // Give the pump a beat to flush the log file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("ready-on-7860"));
        assert!(process.tail().iter().any(|l| l.contains("ready-on-7860")));
    }

    #[tokio::test]
    async fn terminate_reaps_a_long_running_group() {
        let tmp = TempDir::new().unwrap();
        let (sup, _events) = supervisor();
        let child = spawn_session(
            &["sleep 60".to_string()],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();
        let process = sup.adopt("sleeper", child, tmp.path().join("sleeper.log")).unwrap();
        assert!(!process.has_exited());

        sup.terminate("sleeper").await.unwrap();
        assert!(process.has_exited());
        assert!(sup.get("sleeper").is_none());
        // Idempotent once stopped.
        sup.terminate("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn second_adoption_while_running_is_illegal_state() {
        let tmp = TempDir::new().unwrap();
        let (sup, _events) = supervisor();
        let first = spawn_session(&["sleep 30".to_string()], tmp.path(), &HashMap::new()).unwrap();
        sup.adopt("app", first, tmp.path().join("a.log")).unwrap();
        let second = spawn_session(&["sleep 30".to_string()], tmp.path(), &HashMap::new()).unwrap();
        let err = sup.adopt("app", second, tmp.path().join("b.log")).unwrap_err();
        assert_eq!(err.kind(), "illegal-state");
        sup.shutdown().await;
    }
}
