//! # Corvus Core
//!
//! Types and traits shared by the engine, its sandbox runtimes and the HTTP surface.
//!
//! - **[`Job`](job::Job)**: One unit of execution work and its lifecycle state.
//! - **[`ResourceProfile`](profile::ResourceProfile)**: Named CPU/memory/timeout/GPU bundle, looked up in a [`ProfileRegistry`](profile::ProfileRegistry).
//! - **[`SandboxRuntime`](traits::SandboxRuntime)**: The contract the engine needs from a container runtime.
//! - **[`MetricsSink`](traits::MetricsSink)**: Receives completion counters and durations.
//! - **[`AuthProvider`](traits::AuthProvider)**: Resolves callers into an already authenticated [`User`](traits::User).

pub mod constants;
pub mod error;
pub mod job;
pub mod log;
pub mod profile;
pub mod sandbox;
pub mod traits;

pub mod prelude {
    pub use super::constants::*;
    pub use super::error::*;
    pub use super::job::*;
    pub use super::log::*;
    pub use super::profile::*;
    pub use super::sandbox::*;
    pub use super::traits::*;
}
