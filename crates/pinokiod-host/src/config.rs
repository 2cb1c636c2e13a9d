use anyhow::{Result, anyhow};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Timeouts for everything that leaves the process. Defaults follow the
/// documented budget: downloads and shell steps 30 min, readiness 5 min,
/// tunnel open 1 min, plain HTTP requests 30 s.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub download: Duration,
    pub shell: Duration,
    pub readiness: Duration,
    pub tunnel_open: Duration,
    pub http: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(30 * 60),
            shell: Duration::from_secs(30 * 60),
            readiness: Duration::from_secs(5 * 60),
            tunnel_open: Duration::from_secs(60),
            http: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub scan_range: RangeInclusive<u16>,
    /// Common framework ports probed ahead of the sweep.
    pub allow_list: Vec<u16>,
    pub probe_timeout: Duration,
    pub sweep_pause: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_range: 3000..=9000,
            allow_list: vec![5000, 7860, 8000, 8188, 8501],
            probe_timeout: Duration::from_millis(750),
            sweep_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Overrides the probed platform root when set (`PINOKIO_ROOT`).
    pub root_override: Option<PathBuf>,
    /// Forces the platform tag (`PLATFORM_OVERRIDE`), diagnostics only.
    pub platform_override: Option<String>,
    pub port: u16,
    pub tunnel_providers: Vec<String>,
    pub timeouts: Timeouts,
    pub detector: DetectorConfig,
    /// SIGTERM → SIGKILL grace window for supervised process groups.
    pub kill_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root_override: None,
            platform_override: None,
            port: 8000,
            tunnel_providers: default_providers(),
            timeouts: Timeouts::default(),
            detector: DetectorConfig::default(),
            kill_grace: Duration::from_secs(10),
        }
    }
}

fn default_providers() -> Vec<String> {
    vec![
        "ngrok".to_string(),
        "cloudflare-quick".to_string(),
        "localtunnel".to_string(),
    ]
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.root_override = std::env::var("PINOKIO_ROOT").ok().map(PathBuf::from);
        cfg.platform_override = std::env::var("PLATFORM_OVERRIDE").ok();
        if let Ok(port) = std::env::var("PORT") {
            cfg.port = port
                .parse()
                .map_err(|_| anyhow!("invalid PORT '{port}'"))?;
        }
        if let Ok(providers) = std::env::var("TUNNEL_PROVIDERS") {
            cfg.tunnel_providers = providers
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        cfg.timeouts.download = env_duration("DOWNLOAD_TIMEOUT", cfg.timeouts.download)?;
        cfg.timeouts.shell = env_duration("SHELL_TIMEOUT", cfg.timeouts.shell)?;
        cfg.timeouts.readiness = env_duration("READINESS_TIMEOUT", cfg.timeouts.readiness)?;
        cfg.timeouts.tunnel_open = env_duration("TUNNEL_OPEN_TIMEOUT", cfg.timeouts.tunnel_open)?;
        cfg.timeouts.http = env_duration("HTTP_TIMEOUT", cfg.timeouts.http)?;
        Ok(cfg)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

fn env_duration(key: &str, fallback: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            humantime::parse_duration(&raw).map_err(|err| anyhow!("invalid {key}: {err}"))
        }
        Err(_) => Ok(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.timeouts.readiness, Duration::from_secs(300));
        assert_eq!(cfg.timeouts.tunnel_open, Duration::from_secs(60));
        assert_eq!(cfg.detector.scan_range, 3000..=9000);
        assert_eq!(
            cfg.tunnel_providers,
            vec!["ngrok", "cloudflare-quick", "localtunnel"]
        );
    }
}
