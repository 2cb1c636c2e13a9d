use serde::{Deserialize, Serialize};

/// Where an app's script bundle comes from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceLocator {
    /// A git repository cloned into the install root.
    Git { url: String },
    /// A directory on the local filesystem, copied into the install root.
    LocalPath { path: String },
}

/// GPU requirement tier declared by a descriptor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpuTier {
    #[default]
    None,
    Any,
    HighVram,
}

/// Caller-supplied hints steering install/start discovery.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryHints {
    /// File name of the installer script inside the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer: Option<String>,
    /// File name of the start script inside the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter: Option<String>,
    /// Pattern on process output that signals the app is serving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_regex: Option<String>,
    /// Port the app is expected to open, if known in advance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub gpu: GpuTier,
}

/// Metadata identifying an app and how to obtain it. Descriptors are
/// user-provided; the host does not curate them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppDescriptor {
    pub id: String,
    pub source: SourceLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub hints: DiscoveryHints,
}

impl AppDescriptor {
    pub fn git(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: SourceLocator::Git { url: url.into() },
            category: None,
            hints: DiscoveryHints::default(),
        }
    }

    pub fn local(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: SourceLocator::LocalPath { path: path.into() },
            category: None,
            hints: DiscoveryHints::default(),
        }
    }
}
