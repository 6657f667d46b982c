use crate::error::SandboxError;
use crate::log::LogSource;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a live sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle(pub String);

impl SandboxHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GPU devices to attach to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequest {
    pub driver: String,
    /// Number of devices, `-1` for all.
    pub count: i64,
}

/// Everything a runtime needs to materialize a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cpu_share: u32,
    pub memory_limit_bytes: u64,
    /// [`None`] if no gpu is attached.
    pub gpu: Option<GpuRequest>,
    pub network_enabled: bool,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful stop request (SIGTERM).
    Terminate,
    /// Interactive interrupt (SIGINT).
    Interrupt,
}

impl StopSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Interrupt => "SIGINT",
        }
    }
}

/// A raw piece of sandbox output, not necessarily line aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub source: LogSource,
    pub data: Bytes,
}

pub type OutputStream = BoxStream<'static, Result<SandboxOutput, SandboxError>>;
