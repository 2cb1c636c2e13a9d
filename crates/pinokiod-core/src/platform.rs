use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Closed set of host classes the probe can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostClass {
    Colab,
    Vastai,
    Lightning,
    Paperspace,
    Runpod,
    GenericLinux,
}

impl HostClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Colab => "colab",
            Self::Vastai => "vastai",
            Self::Lightning => "lightning",
            Self::Paperspace => "paperspace",
            Self::Runpod => "runpod",
            Self::GenericLinux => "generic-linux",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "colab" => Some(Self::Colab),
            "vastai" | "vast" => Some(Self::Vastai),
            "lightning" => Some(Self::Lightning),
            "paperspace" => Some(Self::Paperspace),
            "runpod" => Some(Self::Runpod),
            "generic-linux" | "linux" => Some(Self::GenericLinux),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub memory_mib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_version: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpu_count: usize,
    pub memory_mib: u64,
    pub disk_mib: u64,
}

/// Immutable host description produced once at startup by the platform probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub host: HostClass,
    pub root: PathBuf,
    pub temp: PathBuf,
    /// May equal `root` on hosts without a separate persistent volume.
    pub persistence: PathBuf,
    pub gpus: Vec<GpuInfo>,
    pub limits: ResourceLimits,
    pub containerized: bool,
    pub allows_raw_signals: bool,
    /// System commands found on PATH at probe time (`git`, `node`, `conda`, ...).
    pub capabilities: BTreeSet<String>,
}

impl PlatformProfile {
    pub fn primary_gpu(&self) -> Option<&GpuInfo> {
        self.gpus.first()
    }

    pub fn cuda_version(&self) -> Option<&str> {
        self.gpus
            .iter()
            .find_map(|gpu| gpu.cuda_version.as_deref())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn venvs_dir(&self) -> PathBuf {
        self.root.join("venvs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.persistence.join("drive").join("models")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }
}
