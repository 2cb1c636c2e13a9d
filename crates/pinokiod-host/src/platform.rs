//! Platform probe and abstraction.
//!
//! The probe walks a detection ladder (forced tag, env markers, canonical
//! directories) and produces one immutable [`PlatformProfile`] for the
//! process. Everything above consumes the [`Platform`] trait, never the
//! host environment directly.

use crate::config::HostConfig;
use pinokiod_core::{GpuInfo, HostClass, HostError, HostResult, PlatformProfile, ResourceLimits};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub trait Platform: Send + Sync {
    fn profile(&self) -> &PlatformProfile;

    fn root(&self) -> &Path {
        &self.profile().root
    }

    fn temp_dir(&self) -> &Path {
        &self.profile().temp
    }

    fn persistence_dir(&self) -> &Path {
        &self.profile().persistence
    }

    fn gpu_info(&self) -> &[GpuInfo] {
        &self.profile().gpus
    }

    fn limits(&self) -> &ResourceLimits {
        &self.profile().limits
    }

    fn is_containerized(&self) -> bool {
        self.profile().containerized
    }

    fn allows_raw_signals(&self) -> bool {
        self.profile().allows_raw_signals
    }

    fn has_command(&self, name: &str) -> bool {
        self.profile().has_capability(name) || which(name).is_some()
    }
}

pub struct DetectedPlatform {
    profile: PlatformProfile,
}

impl Platform for DetectedPlatform {
    fn profile(&self) -> &PlatformProfile {
        &self.profile
    }
}

/// Env markers, checked in order. First hit wins.
const ENV_MARKERS: &[(HostClass, &[&str])] = &[
    (HostClass::Colab, &["COLAB_GPU", "COLAB_TPU_ADDR"]),
    (HostClass::Paperspace, &["PAPERSPACE_CLUSTER_ID", "PS_API_KEY"]),
    (HostClass::Runpod, &["RUNPOD_POD_ID", "RUNPOD_API_KEY"]),
    (HostClass::Vastai, &["VAST_CONTAINERLABEL"]),
    (HostClass::Lightning, &["LIGHTNING_CLOUD_URL", "LIGHTNING_GRID_URL"]),
];

pub fn probe(cfg: &HostConfig) -> HostResult<Arc<dyn Platform>> {
    let host = match cfg.platform_override.as_deref() {
        Some(tag) => HostClass::parse(tag).ok_or_else(|| {
            HostError::internal(format!("PLATFORM_OVERRIDE '{tag}' is not a known host class"))
        })?,
        None => detect_host_class(),
    };

    let root = cfg
        .root_override
        .clone()
        .unwrap_or_else(|| default_root(host));
    let persistence = default_persistence(host, &root);
    let temp = std::env::temp_dir();

    std::fs::create_dir_all(&root).map_err(HostError::io)?;

    let gpus = probe_gpus();
    let limits = probe_limits(&root);
    let capabilities = probe_capabilities();
    let containerized = detect_container();

    let profile = PlatformProfile {
        host,
        root,
        temp,
        persistence,
        gpus,
        limits,
        containerized,
        // Notebook hosts run us inside someone else's container; raw signal
        // delivery to arbitrary pids is only safe when we own the namespace.
        allows_raw_signals: cfg!(unix),
        capabilities,
    };

    tracing::info!(
        host = profile.host.as_str(),
        root = %profile.root.display(),
        gpus = profile.gpus.len(),
        "platform probe completed"
    );
    Ok(Arc::new(DetectedPlatform { profile }))
}

fn detect_host_class() -> HostClass {
    for (class, markers) in ENV_MARKERS {
        if markers.iter().any(|m| std::env::var_os(m).is_some()) {
            return *class;
        }
    }
    // Canonical directory rung of the ladder.
    if Path::new("/content").is_dir() {
        return HostClass::Colab;
    }
    if Path::new("/notebooks").is_dir() {
        return HostClass::Paperspace;
    }
    HostClass::GenericLinux
}

fn default_root(host: HostClass) -> PathBuf {
    match host {
        HostClass::Colab => PathBuf::from("/content/pinokio"),
        HostClass::Paperspace => PathBuf::from("/notebooks/pinokio"),
        HostClass::Runpod | HostClass::Vastai => PathBuf::from("/workspace/pinokio"),
        HostClass::Lightning => PathBuf::from("/teamspace/studios/this_studio/pinokio"),
        HostClass::GenericLinux => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pinokio"),
    }
}

fn default_persistence(host: HostClass, root: &Path) -> PathBuf {
    match host {
        HostClass::Colab if Path::new("/content/drive/MyDrive").is_dir() => {
            PathBuf::from("/content/drive/MyDrive/pinokio")
        }
        HostClass::Paperspace if Path::new("/storage").is_dir() => {
            PathBuf::from("/storage/pinokio")
        }
        _ => root.to_path_buf(),
    }
}

fn detect_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|text| {
            text.contains("docker") || text.contains("containerd") || text.contains("kubepods")
        })
        .unwrap_or(false)
}

fn probe_gpus() -> Vec<GpuInfo> {
    let query = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();
    let Ok(output) = query else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    let cuda = probe_cuda_version();
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let (name, memory) = line.split_once(',')?;
            Some(GpuInfo {
                name: name.trim().to_string(),
                memory_mib: memory.trim().parse().ok()?,
                cuda_version: cuda.clone(),
            })
        })
        .collect()
}

fn probe_cuda_version() -> Option<String> {
    let output = Command::new("nvidia-smi").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout).to_string();
    let re = Regex::new(r"CUDA Version:\s*([0-9.]+)").ok()?;
    re.captures(&text)
        .map(|caps| caps[1].to_string())
}

fn probe_limits(root: &Path) -> ResourceLimits {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let memory_mib = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| {
            text.lines().find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kib / 1024)
            })
        })
        .unwrap_or(0);
    ResourceLimits {
        cpu_count,
        memory_mib,
        disk_mib: probe_disk_mib(root),
    }
}

#[cfg(unix)]
fn probe_disk_mib(root: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let Ok(path) = CString::new(root.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // statvfs on a path we just created; failure degrades to "unknown".
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return 0;
    }
    let frsize = stat.f_frsize.max(1) as u64;
    stat.f_blocks as u64 * frsize / (1024 * 1024)
}

#[cfg(not(unix))]
fn probe_disk_mib(_root: &Path) -> u64 {
    0
}

const PROBED_COMMANDS: &[&str] = &[
    "bash", "git", "python3", "pip", "node", "npm", "npx", "conda", "curl", "nvidia-smi",
    "cloudflared", "ngrok", "sudo", "tar", "unzip",
];

fn probe_capabilities() -> BTreeSet<String> {
    PROBED_COMMANDS
        .iter()
        .filter(|cmd| which(cmd).is_some())
        .map(|cmd| cmd.to_string())
        .collect()
}

/// Absolute path of `cmd` on PATH, or `None`.
pub fn which(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(cmd);
        candidate.is_file().then_some(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_a_shell() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-command-xyz").is_none());
    }

    #[test]
    fn ladder_falls_back_to_generic_linux() {
        // Without cloud markers the ladder lands on generic-linux (or colab /
        // paperspace when their canonical dirs exist on the test host).
        let class = detect_host_class();
        assert!(matches!(
            class,
            HostClass::GenericLinux | HostClass::Colab | HostClass::Paperspace
        ));
    }
}
