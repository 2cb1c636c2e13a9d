#![deny(unsafe_code)]
//! Shared vocabulary types for the pinokiod orchestrator: error kinds,
//! the script AST and parser, app records, platform profiles, descriptors,
//! and the wire event model. No I/O lives here.

pub mod descriptor;
pub mod error;
pub mod event;
pub mod platform;
pub mod record;
pub mod script;

pub use descriptor::{AppDescriptor, DiscoveryHints, GpuTier, SourceLocator};
pub use error::{ErrorInfo, HostError, HostResult};
pub use event::{Event, EventKind};
pub use platform::{GpuInfo, HostClass, PlatformProfile, ResourceLimits};
pub use record::{
    AppRecord, AppState, InstallerKind, ProcessInfo, TunnelHealth, TunnelRecord, VenvHandle,
    VenvKind,
};
pub use script::{
    DownloadParams, HfDownloadParams, InputKind, InputParams, JumpTarget, LogLevel,
    NetRequestParams, OnAction, OnHandler, Op, Script, ShellRunParams, Step,
};
