//! Headless orchestrator host for scripted AI apps on ephemeral GPU
//! notebook machines. Interprets declarative install/run scripts, manages
//! per-app lifecycles and virtual environments, supervises long-running
//! processes, discovers the HTTP port an app opens, and exposes it through
//! a public tunnel. UIs and launchers talk to the HTTP/SSE surface in
//! [`http`]; nothing here renders anything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;

pub mod boot;
pub mod cancel;
pub mod config;
pub mod detector;
pub mod engine;
pub mod events;
pub mod fsapi;
pub mod http;
pub mod input;
pub mod lifecycle;
pub mod paths;
pub mod platform;
pub mod registry;
pub mod shell;
pub mod supervisor;
pub mod tunnel;
pub mod vars;
pub mod venv;

pub use config::HostConfig;
pub use lifecycle::{LifecycleManager, StartOutcome};
pub use pinokiod_core::{AppDescriptor, AppRecord, AppState, Event, EventKind};

use crate::events::EventBus;
use crate::fsapi::FsApi;
use crate::http::health::HealthState;
use crate::http::HostServer;
use crate::input::InputBroker;
use crate::paths::PathMapper;
use crate::registry::Registry;
use crate::shell::ShellRunner;
use crate::supervisor::ProcessSupervisor;
use crate::tunnel::TunnelBroker;
use crate::venv::VenvManager;

const TUNNEL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Wire up every component against the probed platform.
pub fn build(cfg: HostConfig) -> Result<(Arc<LifecycleManager>, Arc<HealthState>)> {
    let platform = platform::probe(&cfg).context("platform probe failed")?;
    let profile = platform.profile().clone();
    for dir in [
        profile.apps_dir(),
        profile.venvs_dir(),
        profile.cache_dir(),
        profile.logs_dir(),
        profile.models_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let health = Arc::new(HealthState::new());
    health.mark_platform_ready();

    let events = EventBus::new();
    let registry = Arc::new(
        Registry::load(profile.registry_path()).context("registry load failed")?,
    );
    health.mark_registry_ready();

    let mapper = PathMapper::new(profile.root.clone(), profile.persistence.clone());
    let fs = Arc::new(FsApi::new(
        mapper,
        profile.models_dir(),
        profile.cache_dir(),
        profile.venvs_dir(),
        events.clone(),
        cfg.timeouts.download,
    )?);
    let supervisor = Arc::new(ProcessSupervisor::new(events.clone(), cfg.kill_grace));
    let shell = Arc::new(ShellRunner::new(
        Arc::clone(&supervisor),
        events.clone(),
        profile.logs_dir(),
        cfg.timeouts.shell,
        platform.has_command("sudo"),
    ));
    let venvs = Arc::new(VenvManager::new(profile.venvs_dir()));
    let detector = Arc::new(detector::ServerDetector::new(
        cfg.detector.clone(),
        cfg.timeouts.readiness,
    )?);
    let broker = Arc::new(TunnelBroker::with_default_providers(
        &cfg.tunnel_providers,
        events.clone(),
        cfg.timeouts.tunnel_open,
    ));
    let inputs = InputBroker::new(events.clone());

    let lifecycle = LifecycleManager::new(
        cfg, platform, registry, fs, shell, venvs, supervisor, detector, broker, events, inputs,
    )?;
    Ok((lifecycle, health))
}

/// Run the host until shutdown.
pub async fn run(cfg: HostConfig) -> Result<()> {
    let port = cfg.port;
    let (lifecycle, health) = build(cfg)?;

    let sweeper = tokio::spawn({
        let lifecycle = Arc::clone(&lifecycle);
        async move {
            let mut ticker = tokio::time::interval(TUNNEL_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                lifecycle.sweep_tunnels().await;
            }
        }
    });

    let server = HostServer::new(port, Arc::clone(&lifecycle), health);
    tokio::select! {
        result = server.serve() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    sweeper.abort();
    lifecycle.shutdown().await;
    Ok(())
}
