//! Web-server discovery for freshly started apps.
//!
//! Two strategies in order: an app-declared readiness regex on process
//! output yields the port directly; otherwise a bounded-rate scan of the
//! configured port range accepts the first local endpoint answering HTTP
//! with any status in [200, 499]. Detection has a hard timeout that
//! surfaces as `readiness-timeout`.

use crate::cancel::CancelToken;
use crate::config::DetectorConfig;
use crate::supervisor::SupervisedProcess;
use futures::StreamExt;
use pinokiod_core::{HostError, HostResult};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const SCAN_CONCURRENCY: usize = 32;

pub struct ServerDetector {
    cfg: DetectorConfig,
    readiness_timeout: Duration,
    client: reqwest::Client,
}

impl ServerDetector {
    pub fn new(cfg: DetectorConfig, readiness_timeout: Duration) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.probe_timeout)
            .build()
            .map_err(|err| HostError::internal(err))?;
        Ok(Self {
            cfg,
            readiness_timeout,
            client,
        })
    }

    pub async fn detect(
        &self,
        process: Option<&Arc<SupervisedProcess>>,
        readiness: Option<&Regex>,
        default_port: Option<u16>,
        cancel: &CancelToken,
    ) -> HostResult<u16> {
        let result = tokio::select! {
            result = tokio::time::timeout(
                self.readiness_timeout,
                self.detect_inner(process, readiness, default_port),
            ) => result,
            _ = cancel.cancelled() => return Err(HostError::Cancelled),
        };
        match result {
            Ok(port) => port,
            Err(_) => Err(HostError::ReadinessTimeout {
                secs: self.readiness_timeout.as_secs(),
            }),
        }
    }

    async fn detect_inner(
        &self,
        process: Option<&Arc<SupervisedProcess>>,
        readiness: Option<&Regex>,
        default_port: Option<u16>,
    ) -> HostResult<u16> {
        if let (Some(process), Some(pattern)) = (process, readiness) {
            if let Some(line) = process
                .wait_for_line(pattern, self.readiness_timeout)
                .await
            {
                if let Some(port) = extract_port(pattern, &line) {
                    tracing::info!(port, line = %line, "port learned from process output");
                    return Ok(port);
                }
                // Matched but carried no port; confirm over HTTP below.
            }
        }
        self.scan(default_port).await
    }

    async fn scan(&self, default_port: Option<u16>) -> HostResult<u16> {
        loop {
            // Order encodes priority (hinted port, then allow-list, then the
            // sweep); each port is probed once per sweep.
            let mut seen = HashSet::new();
            let candidates: Vec<u16> = default_port
                .into_iter()
                .chain(self.cfg.allow_list.iter().copied())
                .chain(self.cfg.scan_range.clone())
                .filter(|port| seen.insert(*port))
                .collect();

            let mut probes = futures::stream::iter(candidates)
                .map(|port| {
                    let client = self.client.clone();
                    async move { (port, probe_http(&client, port).await) }
                })
                .buffered(SCAN_CONCURRENCY);
            while let Some((port, alive)) = probes.next().await {
                if alive {
                    tracing::info!(port, "port discovered by scan");
                    return Ok(port);
                }
            }
            tokio::time::sleep(self.cfg.sweep_pause).await;
        }
    }
}

async fn probe_http(client: &reqwest::Client, port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/");
    match client.get(&url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            (200..500).contains(&status)
        }
        Err(_) => false,
    }
}

/// Pull a port from a matched readiness line: the first capture group if
/// it parses, otherwise the first `:NNNN` in the line.
pub(crate) fn extract_port(pattern: &Regex, line: &str) -> Option<u16> {
    if let Some(caps) = pattern.captures(line) {
        if let Some(group) = caps.get(1) {
            if let Ok(port) = group.as_str().parse() {
                return Some(port);
            }
        }
    }
    let fallback = Regex::new(r":(\d{2,5})").ok()?;
    fallback
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Next free TCP port in the allocation range, for `{{port}}` templates.
pub fn next_free_port() -> HostResult<u16> {
    for port in 8000..9000 {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(HostError::PortBusy { port: 0 })
}
