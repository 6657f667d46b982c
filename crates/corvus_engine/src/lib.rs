//! # Corvus Engine
//!
//! Runs submitted scripts in resource-bounded sandboxes.
//!
//! - **[`JobRegistry`](registry::JobRegistry)**: The job table and the only authority over status transitions.
//! - **[`AdmissionScheduler`](scheduler::AdmissionScheduler)**: Bounded pools of concurrent sandboxes per resource class, FIFO within a pool.
//! - **[`LogHub`](log_hub::LogHub)**: Replayable per-job output channels with any number of subscribers.
//! - **[`Engine`](engine::Engine)**: Ties the pieces together and supervises every admitted job.
//!
//! ```no_run
//! use corvus_engine::prelude::*;
//! # async fn run<R: SandboxRuntime>(runtime: R) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::start(EngineConfig::from_env()?, runtime, TracingMetrics).await?;
//! let job_id = engine.submit("alice", JobRequest {
//!     script: "print('hello')".to_string(),
//!     ..Default::default()
//! })?;
//! let mut logs = engine.stream_logs(job_id)?;
//! while let Some(event) = logs.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod log_hub;
pub mod metrics;
pub mod payload;
pub mod registry;
pub mod scheduler;
mod supervisor;
mod sync;

pub mod prelude {
    pub use super::analyzer::{ScriptAnalysis, analyze};
    pub use super::config::EngineConfig;
    pub use super::engine::{CancelAck, Engine, OwnerSummary};
    pub use super::log_hub::{LogHub, LogSubscription};
    pub use super::metrics::{InMemoryMetrics, NoMetrics, TracingMetrics};
    pub use super::payload::{PayloadResolver, ResolvedPayload};
    pub use super::registry::{JobRegistry, Transition};
    pub use super::scheduler::{Admission, AdmissionScheduler, CapacitySlot, PoolStats};
    pub use corvus_core::prelude::*;
}
