use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use pinokiod_core::{AppDescriptor, AppState, EventKind};
use pinokiod_host::cancel::CancelToken;
use pinokiod_host::http::HostServer;
use pinokiod_host::{HostConfig, build};
use serde_json::{Map, json};
use serial_test::serial;
use tempfile::TempDir;
use tokio::time::sleep;

struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: impl AsRef<str>) -> Self {
        let previous = std::env::var(key).ok();
        unsafe {
            std::env::set_var(key, value.as_ref());
        }
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.previous {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }
}

fn local_descriptor(root: &std::path::Path, id: &str, install: serde_json::Value) -> AppDescriptor {
    let source = root.join("sources").join(id);
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("install.json"), install.to_string()).unwrap();
    AppDescriptor::local(id, source.display().to_string())
}

async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
    bail!("condition not reached within {timeout:?}")
}

async fn wait_for_http(client: &reqwest::Client, url: &str) -> Result<()> {
    for _ in 0..100 {
        if client.get(url).send().await.is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
    bail!("server never came up at {url}")
}

#[tokio::test]
#[serial]
async fn install_over_http_reaches_installed() -> Result<()> {
    let tmp = TempDir::new()?;
    let _root = EnvGuard::set("PINOKIO_ROOT", tmp.path().display().to_string());
    let _platform = EnvGuard::set("PLATFORM_OVERRIDE", "generic-linux");

    let (lifecycle, health) = build(HostConfig::from_env()?)?;
    let port = pinokiod_host::detector::next_free_port()?;
    let server = HostServer::new(port, Arc::clone(&lifecycle), health);
    let server_task = tokio::spawn(async move { server.serve().await });

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");
    wait_for_http(&client, &format!("{base}/healthz")).await?;

    let descriptor = local_descriptor(
        tmp.path(),
        "hello",
        json!({"run": [{"method": "shell.run", "params": {"message": "echo hello"}}]}),
    );
    let response = client
        .post(format!("{base}/api/install"))
        .json(&json!({ "command": "cmd-1", "descriptor": descriptor }))
        .send()
        .await?;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["command"], "cmd-1");
    assert_eq!(body["record"]["state"], "installed");
    assert_eq!(body["record"]["installer_kind"], "json");

    let listed: serde_json::Value = client
        .get(format!("{base}/api/list"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed["apps"][0]["id"], "hello");

    let registry: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
        tmp.path().join("registry.json"),
    )?)?;
    assert_eq!(registry["hello"]["state"], "installed");

    // Unknown app on the status route is a 404 carrying an error kind.
    let missing = client.get(format!("{base}/api/status/ghost")).send().await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    server_task.abort();
    lifecycle.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn state_events_echo_the_command_id() -> Result<()> {
    let tmp = TempDir::new()?;
    let _root = EnvGuard::set("PINOKIO_ROOT", tmp.path().display().to_string());
    let _platform = EnvGuard::set("PLATFORM_OVERRIDE", "generic-linux");

    let (lifecycle, _health) = build(HostConfig::from_env()?)?;
    let mut rx = lifecycle.subscribe();

    let descriptor = local_descriptor(tmp.path(), "evented", json!({"run": []}));
    lifecycle
        .install(descriptor, Some("cmd-42".into()), CancelToken::never())
        .await?;

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EventKind::StateChanged { from, to, .. } = event.kind {
            assert_eq!(event.command.as_deref(), Some("cmd-42"));
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (AppState::Absent, AppState::Installing),
            (AppState::Installing, AppState::Installed),
        ]
    );
    lifecycle.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn registry_survives_a_host_restart() -> Result<()> {
    let tmp = TempDir::new()?;
    let _root = EnvGuard::set("PINOKIO_ROOT", tmp.path().display().to_string());
    let _platform = EnvGuard::set("PLATFORM_OVERRIDE", "generic-linux");

    {
        let (lifecycle, _health) = build(HostConfig::from_env()?)?;
        let descriptor = local_descriptor(tmp.path(), "survivor", json!({"run": []}));
        lifecycle
            .install(descriptor, None, CancelToken::never())
            .await?;
        lifecycle.shutdown().await;
    }

    let (lifecycle, _health) = build(HostConfig::from_env()?)?;
    let record = lifecycle.status("survivor").expect("record after restart");
    assert_eq!(record.state, AppState::Installed);
    lifecycle.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn start_of_uninstalled_app_is_illegal_state() -> Result<()> {
    let tmp = TempDir::new()?;
    let _root = EnvGuard::set("PINOKIO_ROOT", tmp.path().display().to_string());
    let _platform = EnvGuard::set("PLATFORM_OVERRIDE", "generic-linux");

    let (lifecycle, _health) = build(HostConfig::from_env()?)?;
    let err = lifecycle
        .start("nope", Map::new(), None, CancelToken::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "illegal-state");
    lifecycle.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn install_uninstall_install_round_trips() -> Result<()> {
    let tmp = TempDir::new()?;
    let _root = EnvGuard::set("PINOKIO_ROOT", tmp.path().display().to_string());
    let _platform = EnvGuard::set("PLATFORM_OVERRIDE", "generic-linux");

    let (lifecycle, _health) = build(HostConfig::from_env()?)?;
    let descriptor = local_descriptor(
        tmp.path(),
        "cycle",
        json!({"run": [{"method": "local.set", "params": {"seen": "yes"}}]}),
    );

    let first = lifecycle
        .install(descriptor.clone(), None, CancelToken::never())
        .await?;
    lifecycle.uninstall("cycle", false, None).await?;
    wait_for(|| lifecycle.status("cycle").is_none(), Duration::from_secs(2)).await?;

    let second = lifecycle
        .install(descriptor, None, CancelToken::never())
        .await?;
    assert_eq!(first.state, second.state);
    assert_eq!(first.descriptor, second.descriptor);
    assert_eq!(first.install_root, second.install_root);
    assert_eq!(first.local_vars, second.local_vars);
    lifecycle.shutdown().await;
    Ok(())
}
