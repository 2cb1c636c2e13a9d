//! Public exposure of local ports through tunnel providers.
//!
//! Providers implement one interface (`open`/`probe`/`close`); the broker
//! walks an ordered preference list, skips providers whose credentials are
//! absent, fails over on open errors, and re-probes active tunnels on a
//! schedule. A tunnel goes `degraded` on a failed probe and `dead` after a
//! bounded run of consecutive failures, at which point the broker reopens
//! once on the same provider and then fails over.

use crate::cancel::CancelToken;
use crate::events::EventBus;
use crate::platform::which;
use async_trait::async_trait;
use parking_lot::Mutex;
use pinokiod_core::{EventKind, HostError, HostResult, TunnelHealth, TunnelRecord};
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct TunnelHandle {
    pub provider: String,
    pub public_url: String,
    pub local_port: u16,
    id: u64,
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Providers requiring credentials report false when none are
    /// available and are skipped silently.
    fn available(&self) -> bool {
        true
    }

    async fn open(&self, port: u16) -> HostResult<TunnelHandle>;
    async fn probe(&self, handle: &TunnelHandle) -> TunnelHealth;
    async fn close(&self, handle: &TunnelHandle);
}

struct ActiveTunnel {
    handle: TunnelHandle,
    prefs: Vec<String>,
    consecutive_failures: u32,
    reopened_once: bool,
    health: TunnelHealth,
    auth_ref: Option<String>,
    created_at: time::OffsetDateTime,
}

impl ActiveTunnel {
    fn record(&self) -> TunnelRecord {
        TunnelRecord {
            provider: self.handle.provider.clone(),
            local_port: self.handle.local_port,
            public_url: self.handle.public_url.clone(),
            created_at: self.created_at,
            health: self.health,
            auth_ref: self.auth_ref.clone(),
        }
    }
}

pub struct TunnelBroker {
    providers: Vec<Arc<dyn TunnelProvider>>,
    events: EventBus,
    open_timeout: Duration,
    active: Mutex<HashMap<String, ActiveTunnel>>,
}

impl TunnelBroker {
    pub fn new(
        providers: Vec<Arc<dyn TunnelProvider>>,
        events: EventBus,
        open_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            events,
            open_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Built-in provider set, ordered by `prefs`.
    pub fn with_default_providers(
        prefs: &[String],
        events: EventBus,
        open_timeout: Duration,
    ) -> Self {
        let all: Vec<Arc<dyn TunnelProvider>> = vec![
            Arc::new(NgrokProvider::new()),
            Arc::new(CloudflareQuickProvider::new()),
            Arc::new(LocalTunnelProvider::new()),
        ];
        let providers = prefs
            .iter()
            .filter_map(|name| all.iter().find(|p| p.name() == name).cloned())
            .collect();
        Self::new(providers, events, open_timeout)
    }

    fn provider(&self, name: &str) -> Option<Arc<dyn TunnelProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// Try providers in preference order; first success wins and emits one
    /// `tunnel-opened` event.
    pub async fn open(
        &self,
        app_id: &str,
        local_port: u16,
        prefs: &[String],
        command: Option<String>,
        cancel: &CancelToken,
    ) -> HostResult<TunnelRecord> {
        let mut last_error = None;
        for name in prefs {
            cancel.check()?;
            let Some(provider) = self.provider(name) else {
                continue;
            };
            if !provider.available() {
                tracing::debug!(provider = name.as_str(), "skipping provider without credentials");
                continue;
            }
            match tokio::time::timeout(self.open_timeout, provider.open(local_port)).await {
                Ok(Ok(handle)) => {
                    let record = self.adopt_handle(app_id, handle, prefs.to_vec());
                    self.events.emit(
                        EventKind::TunnelOpened {
                            app_id: app_id.to_string(),
                            provider: record.provider.clone(),
                            local_port,
                            public_url: record.public_url.clone(),
                        },
                        command,
                    );
                    return Ok(record);
                }
                Ok(Err(err)) => {
                    tracing::warn!(provider = name.as_str(), error = %err, "tunnel open failed");
                    last_error = Some(err);
                }
                Err(_) => {
                    tracing::warn!(provider = name.as_str(), "tunnel open timed out");
                    last_error = Some(HostError::Timeout {
                        secs: self.open_timeout.as_secs(),
                    });
                }
            }
        }
        Err(last_error.unwrap_or(HostError::TunnelOpenFailed {
            provider: prefs.join(","),
            reason: "no usable provider".into(),
        }))
    }

    fn adopt_handle(&self, app_id: &str, handle: TunnelHandle, prefs: Vec<String>) -> TunnelRecord {
        let auth_ref = credential_ref(&handle.provider);
        let active = ActiveTunnel {
            handle,
            prefs,
            consecutive_failures: 0,
            reopened_once: false,
            health: TunnelHealth::Healthy,
            auth_ref,
            created_at: time::OffsetDateTime::now_utc(),
        };
        let record = active.record();
        self.active.lock().insert(app_id.to_string(), active);
        record
    }

    /// Release an app's tunnel, emitting `tunnel-closed`. Idempotent.
    pub async fn close(&self, app_id: &str, command: Option<String>) {
        let Some(active) = self.active.lock().remove(app_id) else {
            return;
        };
        if let Some(provider) = self.provider(&active.handle.provider) {
            provider.close(&active.handle).await;
        }
        self.events.emit(
            EventKind::TunnelClosed {
                app_id: app_id.to_string(),
                provider: active.handle.provider.clone(),
                public_url: active.handle.public_url.clone(),
            },
            command,
        );
    }

    pub fn record_for(&self, app_id: &str) -> Option<TunnelRecord> {
        self.active.lock().get(app_id).map(|a| a.record())
    }

    /// One health sweep over every active tunnel. Returns the records that
    /// changed so the caller can persist them.
    pub async fn probe_all(&self) -> Vec<(String, TunnelRecord)> {
        let apps: Vec<(String, TunnelHandle, String)> = {
            let guard = self.active.lock();
            guard
                .iter()
                .map(|(app, active)| {
                    (
                        app.clone(),
                        active.handle.clone(),
                        active.handle.provider.clone(),
                    )
                })
                .collect()
        };

        let mut changed = Vec::new();
        for (app_id, handle, provider_name) in apps {
            let Some(provider) = self.provider(&provider_name) else {
                continue;
            };
            let health = provider.probe(&handle).await;
            let needs_recovery = {
                let mut guard = self.active.lock();
                let Some(active) = guard.get_mut(&app_id) else {
                    continue;
                };
                match health {
                    TunnelHealth::Healthy => {
                        active.consecutive_failures = 0;
                        if active.health != TunnelHealth::Healthy {
                            active.health = TunnelHealth::Healthy;
                            changed.push((app_id.clone(), active.record()));
                        }
                        false
                    }
                    _ => {
                        active.consecutive_failures += 1;
                        if active.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            active.health = TunnelHealth::Dead;
                        } else {
                            active.health = TunnelHealth::Degraded;
                        }
                        changed.push((app_id.clone(), active.record()));
                        active.health == TunnelHealth::Dead
                    }
                }
            };
            if needs_recovery {
                if let Some(record) = self.recover(&app_id).await {
                    changed.push((app_id.clone(), record));
                }
            }
        }
        changed
    }

    /// Dead tunnel recovery: one reopen on the same provider, then fail
    /// over along the remaining preference list.
    async fn recover(&self, app_id: &str) -> Option<TunnelRecord> {
        let (handle, prefs, reopened_once) = {
            let guard = self.active.lock();
            let active = guard.get(app_id)?;
            (
                active.handle.clone(),
                active.prefs.clone(),
                active.reopened_once,
            )
        };
        let provider = self.provider(&handle.provider)?;
        provider.close(&handle).await;

        if !reopened_once {
            if let Ok(Ok(new_handle)) = tokio::time::timeout(
                self.open_timeout,
                provider.open(handle.local_port),
            )
            .await
            {
                let mut guard = self.active.lock();
                let active = guard.get_mut(app_id)?;
                active.handle = new_handle;
                active.health = TunnelHealth::Healthy;
                active.consecutive_failures = 0;
                active.reopened_once = true;
                tracing::info!(app = %app_id, provider = provider.name(), "tunnel reopened");
                return Some(active.record());
            }
        }

        // Fail over to the providers after the current one.
        let remaining: Vec<String> = prefs
            .iter()
            .skip_while(|name| name.as_str() != handle.provider)
            .skip(1)
            .cloned()
            .collect();
        self.active.lock().remove(app_id);
        self.events.emit(
            EventKind::TunnelClosed {
                app_id: app_id.to_string(),
                provider: handle.provider.clone(),
                public_url: handle.public_url.clone(),
            },
            None,
        );
        match self
            .open(app_id, handle.local_port, &remaining, None, &CancelToken::never())
            .await
        {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(app = %app_id, error = %err, "tunnel failover exhausted");
                self.events.emit(
                    EventKind::Error {
                        app_id: Some(app_id.to_string()),
                        error: (&HostError::TunnelDead {
                            reason: err.to_string(),
                        })
                            .into(),
                    },
                    None,
                );
                None
            }
        }
    }

    pub async fn shutdown(&self) {
        let apps: Vec<String> = self.active.lock().keys().cloned().collect();
        for app_id in apps {
            self.close(&app_id, None).await;
        }
    }
}

fn credential_ref(provider: &str) -> Option<String> {
    match provider {
        "ngrok" => Some("NGROK_AUTHTOKEN".to_string()),
        _ => None,
    }
}

/// Child processes spawned by binary-backed providers, keyed by handle id.
struct ChildTable {
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
}

impl ChildTable {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn adopt(&self, child: Child) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children.lock().insert(id, child);
        id
    }

    async fn kill(&self, id: u64) {
        let child = self.children.lock().remove(&id);
        if let Some(mut child) = child {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Spawn `program args`, scan merged output for the first line matching
/// `url_pattern`, and return (child, captured url).
async fn spawn_and_scrape_url(
    program: &str,
    args: &[String],
    url_pattern: &Regex,
    provider: &str,
) -> HostResult<(Child, String)> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| HostError::TunnelOpenFailed {
            provider: provider.to_string(),
            reason: err.to_string(),
        })?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    while let Some(line) = rx.recv().await {
        if let Some(m) = url_pattern.find(&line) {
            return Ok((child, m.as_str().to_string()));
        }
    }
    let _ = child.kill().await;
    Err(HostError::TunnelOpenFailed {
        provider: provider.to_string(),
        reason: "no public url in provider output".into(),
    })
}

async fn probe_url(url: &str) -> TunnelHealth {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build();
    let Ok(client) = client else {
        return TunnelHealth::Degraded;
    };
    match client.get(url).send().await {
        Ok(response) if response.status().as_u16() < 500 => TunnelHealth::Healthy,
        _ => TunnelHealth::Degraded,
    }
}

pub struct NgrokProvider {
    children: ChildTable,
}

impl NgrokProvider {
    pub fn new() -> Self {
        Self {
            children: ChildTable::new(),
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    fn name(&self) -> &str {
        "ngrok"
    }

    fn available(&self) -> bool {
        // Credential fetched from the environment at open time, never
        // logged and never persisted.
        std::env::var_os("NGROK_AUTHTOKEN").is_some() && which("ngrok").is_some()
    }

    async fn open(&self, port: u16) -> HostResult<TunnelHandle> {
        let child = Command::new("ngrok")
            .args(["http", &port.to_string(), "--log", "stdout"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HostError::TunnelOpenFailed {
                provider: "ngrok".into(),
                reason: err.to_string(),
            })?;
        let id = self.children.adopt(child);

        // The local agent API reports the assigned public url.
        let client = reqwest::Client::new();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let Ok(response) = client
                .get("http://127.0.0.1:4040/api/tunnels")
                .send()
                .await
            else {
                continue;
            };
            let Ok(body) = response.json::<serde_json::Value>().await else {
                continue;
            };
            let found = body["tunnels"]
                .as_array()
                .and_then(|tunnels| {
                    tunnels.iter().find(|t| {
                        t["config"]["addr"]
                            .as_str()
                            .is_some_and(|addr| addr.ends_with(&format!(":{port}")))
                    })
                })
                .and_then(|t| t["public_url"].as_str())
                .map(str::to_string);
            if let Some(public_url) = found {
                return Ok(TunnelHandle {
                    provider: "ngrok".into(),
                    public_url,
                    local_port: port,
                    id,
                });
            }
        }
        self.children.kill(id).await;
        Err(HostError::TunnelOpenFailed {
            provider: "ngrok".into(),
            reason: "agent api never reported a tunnel".into(),
        })
    }

    async fn probe(&self, handle: &TunnelHandle) -> TunnelHealth {
        probe_url(&handle.public_url).await
    }

    async fn close(&self, handle: &TunnelHandle) {
        self.children.kill(handle.id).await;
    }
}

pub struct CloudflareQuickProvider {
    children: ChildTable,
}

impl CloudflareQuickProvider {
    pub fn new() -> Self {
        Self {
            children: ChildTable::new(),
        }
    }
}

#[async_trait]
impl TunnelProvider for CloudflareQuickProvider {
    fn name(&self) -> &str {
        "cloudflare-quick"
    }

    fn available(&self) -> bool {
        which("cloudflared").is_some()
    }

    async fn open(&self, port: u16) -> HostResult<TunnelHandle> {
        let pattern = Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com")
            .map_err(|err| HostError::internal(err))?;
        let args = vec![
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://localhost:{port}"),
            "--no-autoupdate".to_string(),
        ];
        let (child, public_url) =
            spawn_and_scrape_url("cloudflared", &args, &pattern, self.name()).await?;
        let id = self.children.adopt(child);
        Ok(TunnelHandle {
            provider: self.name().to_string(),
            public_url,
            local_port: port,
            id,
        })
    }

    async fn probe(&self, handle: &TunnelHandle) -> TunnelHealth {
        probe_url(&handle.public_url).await
    }

    async fn close(&self, handle: &TunnelHandle) {
        self.children.kill(handle.id).await;
    }
}

pub struct LocalTunnelProvider {
    children: ChildTable,
}

impl LocalTunnelProvider {
    pub fn new() -> Self {
        Self {
            children: ChildTable::new(),
        }
    }
}

#[async_trait]
impl TunnelProvider for LocalTunnelProvider {
    fn name(&self) -> &str {
        "localtunnel"
    }

    fn available(&self) -> bool {
        which("lt").is_some() || which("npx").is_some()
    }

    async fn open(&self, port: u16) -> HostResult<TunnelHandle> {
        let pattern = Regex::new(r"https://[a-z0-9-]+\.loca\.lt")
            .map_err(|err| HostError::internal(err))?;
        let (program, args) = if which("lt").is_some() {
            ("lt", vec!["--port".to_string(), port.to_string()])
        } else {
            (
                "npx",
                vec![
                    "localtunnel".to_string(),
                    "--port".to_string(),
                    port.to_string(),
                ],
            )
        };
        let (child, public_url) =
            spawn_and_scrape_url(program, &args, &pattern, self.name()).await?;
        let id = self.children.adopt(child);
        Ok(TunnelHandle {
            provider: self.name().to_string(),
            public_url,
            local_port: port,
            id,
        })
    }

    async fn probe(&self, handle: &TunnelHandle) -> TunnelHealth {
        probe_url(&handle.public_url).await
    }

    async fn close(&self, handle: &TunnelHandle) {
        self.children.kill(handle.id).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Scripted provider for broker tests: a queue of open outcomes and a
    /// queue of probe results.
    pub struct MockProvider {
        name: String,
        available: bool,
        open_results: Mutex<Vec<HostResult<String>>>,
        probe_results: Mutex<Vec<TunnelHealth>>,
        pub opened: Mutex<Vec<u16>>,
        pub closed: Mutex<Vec<String>>,
    }

    impl MockProvider {
        pub fn new(name: &str, open_results: Vec<HostResult<String>>) -> Self {
            Self {
                name: name.to_string(),
                available: true,
                open_results: Mutex::new(open_results),
                probe_results: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            }
        }

        pub fn unavailable(name: &str) -> Self {
            let mut p = Self::new(name, Vec::new());
            p.available = false;
            p
        }

        pub fn with_probes(self, probes: Vec<TunnelHealth>) -> Self {
            *self.probe_results.lock() = probes;
            self
        }
    }

    #[async_trait]
    impl TunnelProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn available(&self) -> bool {
            self.available
        }

        async fn open(&self, port: u16) -> HostResult<TunnelHandle> {
            self.opened.lock().push(port);
            let mut results = self.open_results.lock();
            if results.is_empty() {
                return Err(HostError::TunnelOpenFailed {
                    provider: self.name.clone(),
                    reason: "exhausted".into(),
                });
            }
            results.remove(0).map(|url| TunnelHandle {
                provider: self.name.clone(),
                public_url: url,
                local_port: port,
                id: 1,
            })
        }

        async fn probe(&self, _handle: &TunnelHandle) -> TunnelHealth {
            let mut probes = self.probe_results.lock();
            if probes.is_empty() {
                TunnelHealth::Healthy
            } else {
                probes.remove(0)
            }
        }

        async fn close(&self, handle: &TunnelHandle) {
            self.closed.lock().push(handle.public_url.clone());
        }
    }

    fn fail(provider: &str) -> HostResult<String> {
        Err(HostError::TunnelOpenFailed {
            provider: provider.into(),
            reason: "mocked".into(),
        })
    }

    #[tokio::test]
    async fn failover_lands_on_second_provider_with_one_event() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let ngrok = Arc::new(MockProvider::new("ngrok", vec![fail("ngrok")]));
        let cf = Arc::new(MockProvider::new(
            "cloudflare-quick",
            vec![Ok("https://demo.trycloudflare.com".into())],
        ));
        let broker = TunnelBroker::new(
            vec![ngrok.clone(), cf.clone()],
            events,
            Duration::from_secs(5),
        );

        let record = broker
            .open(
                "hello",
                7860,
                &["ngrok".into(), "cloudflare-quick".into()],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(record.provider, "cloudflare-quick");
        assert!(!record.public_url.is_empty());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, EventKind::TunnelOpened { .. }));
        assert!(rx.try_recv().is_err(), "exactly one tunnel-opened event");
    }

    #[tokio::test]
    async fn providers_without_credentials_are_skipped_silently() {
        let events = EventBus::new();
        let ngrok = Arc::new(MockProvider::unavailable("ngrok"));
        let lt = Arc::new(MockProvider::new(
            "localtunnel",
            vec![Ok("https://demo.loca.lt".into())],
        ));
        let broker = TunnelBroker::new(vec![ngrok.clone(), lt], events, Duration::from_secs(5));
        let record = broker
            .open(
                "hello",
                7860,
                &["ngrok".into(), "localtunnel".into()],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(record.provider, "localtunnel");
        assert!(ngrok.opened.lock().is_empty(), "unavailable provider never tried");
    }

    #[tokio::test]
    async fn close_releases_and_emits_tunnel_closed() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let lt = Arc::new(MockProvider::new(
            "localtunnel",
            vec![Ok("https://demo.loca.lt".into())],
        ));
        let broker = TunnelBroker::new(vec![lt.clone()], events, Duration::from_secs(5));
        broker
            .open("hello", 7860, &["localtunnel".into()], None, &CancelToken::never())
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap();

        broker.close("hello", None).await;
        assert_eq!(lt.closed.lock().len(), 1);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, EventKind::TunnelClosed { .. }));
        assert!(broker.record_for("hello").is_none());
        // Idempotent.
        broker.close("hello", None).await;
    }

    #[tokio::test]
    async fn repeated_probe_failures_mark_dead_then_reopen() {
        let events = EventBus::new();
        let lt = Arc::new(
            MockProvider::new(
                "localtunnel",
                vec![
                    Ok("https://one.loca.lt".into()),
                    Ok("https://two.loca.lt".into()),
                ],
            )
            .with_probes(vec![
                TunnelHealth::Degraded,
                TunnelHealth::Degraded,
                TunnelHealth::Degraded,
            ]),
        );
        let broker = TunnelBroker::new(vec![lt.clone()], events, Duration::from_secs(5));
        broker
            .open("hello", 7860, &["localtunnel".into()], None, &CancelToken::never())
            .await
            .unwrap();

        let first = broker.probe_all().await;
        assert_eq!(first[0].1.health, TunnelHealth::Degraded);
        let _ = broker.probe_all().await;
        // Third consecutive failure: dead, then one same-provider reopen.
        let third = broker.probe_all().await;
        let record = broker.record_for("hello").unwrap();
        assert_eq!(record.public_url, "https://two.loca.lt");
        assert_eq!(record.health, TunnelHealth::Healthy);
        assert!(third.iter().any(|(_, r)| r.health == TunnelHealth::Dead));
    }
}
