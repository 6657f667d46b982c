use crate::error::EngineError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// A capacity pool is kept per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Cpu,
    Gpu,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 2] = [Self::Cpu, Self::Gpu];

    pub fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Gpu => 1,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// Immutable resource bundle a job runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub name: String,
    /// Relative CPU weight (1024 = one full share).
    pub cpu_share: u32,
    pub memory_limit_bytes: u64,
    #[serde(with = "duration_secs")]
    pub wall_timeout: Duration,
    pub requires_gpu: bool,
}

impl ResourceProfile {
    pub fn new(
        name: impl Into<String>,
        cpu_share: u32,
        memory_mb: u64,
        timeout_secs: u64,
        requires_gpu: bool,
    ) -> Self {
        Self {
            name: name.into(),
            cpu_share,
            memory_limit_bytes: memory_mb * MIB,
            wall_timeout: Duration::from_secs(timeout_secs),
            requires_gpu,
        }
    }
}

/// Per-job adjustments of a profile. Values are clamped, never rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverrides {
    pub memory_mb: Option<u64>,
    pub cpu_share: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl ResourceOverrides {
    pub const MEMORY_MB: (u64, u64) = (256, 8192);
    pub const CPU_SHARE: (u32, u32) = (256, 4096);
    pub const TIMEOUT_SECS: (u64, u64) = (10, 3600);

    /// Derives a new profile value; the base profile is left untouched.
    pub fn apply(&self, base: &ResourceProfile) -> ResourceProfile {
        let mut profile = base.clone();
        if let Some(mb) = self.memory_mb {
            let (lo, hi) = Self::MEMORY_MB;
            profile.memory_limit_bytes = mb.clamp(lo, hi) * MIB;
        }
        if let Some(share) = self.cpu_share {
            let (lo, hi) = Self::CPU_SHARE;
            profile.cpu_share = share.clamp(lo, hi);
        }
        if let Some(secs) = self.timeout_secs {
            let (lo, hi) = Self::TIMEOUT_SECS;
            profile.wall_timeout = Duration::from_secs(secs.clamp(lo, hi));
        }
        profile
    }
}

/// Static table of the profiles jobs may name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, ResourceProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::from_profiles([
            ResourceProfile::new("small", 512, 512, 60, false),
            ResourceProfile::new("medium", 1024, 2048, 300, false),
            ResourceProfile::new("large", 2048, 4096, 900, false),
            ResourceProfile::new("gpu", 2048, 6144, 1800, true),
        ])
    }
}

impl ProfileRegistry {
    pub fn from_profiles(profiles: impl IntoIterator<Item = ResourceProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResourceProfile> {
        self.profiles.get(name)
    }

    pub fn resolve(&self, name: &str) -> Result<&ResourceProfile, EngineError> {
        self.get(name)
            .ok_or_else(|| EngineError::InvalidPayload(format!("Unknown resource profile '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
