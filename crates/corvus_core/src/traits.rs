use crate::error::*;
use crate::job::{ExecutionMode, JobId, JobStatus};
use crate::sandbox::*;

use serde::Serialize;
use std::time::Duration;

/// The contract the engine requires from a container runtime.
///
/// Pure mechanism: implementations apply no policy of their own.
pub trait SandboxRuntime: Send + Sync + 'static + Clone {
    /// Optional: Checks that the runtime is reachable.
    fn init(&self) -> impl Future<Output = Result<(), SandboxError>> + Send {
        async { Ok(()) }
    }

    /// Materializes a sandbox without starting it.
    fn create(
        &self,
        spec: &SandboxSpec,
    ) -> impl Future<Output = Result<SandboxHandle, SandboxError>> + Send;

    fn start(&self, handle: &SandboxHandle)
    -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Follows the combined output of the sandbox. The stream ends when the process exits.
    fn output(
        &self,
        handle: &SandboxHandle,
    ) -> impl Future<Output = Result<OutputStream, SandboxError>> + Send;

    fn signal(
        &self,
        handle: &SandboxHandle,
        signal: StopSignal,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;

    fn kill(&self, handle: &SandboxHandle) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Resolves with the exit code once the process has exited.
    fn wait_exit(
        &self,
        handle: &SandboxHandle,
    ) -> impl Future<Output = Result<i64, SandboxError>> + Send;

    /// Frees every resource held by the sandbox. Destroying a missing sandbox is not an error.
    fn destroy(
        &self,
        handle: &SandboxHandle,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationKind {
    Queue,
    Run,
}

/// Emitted once per job when it reaches a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub job_id: JobId,
    pub mode: ExecutionMode,
    pub profile: String,
    pub status: JobStatus,
    pub queue_duration: Option<Duration>,
    pub run_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationSummary {
    pub kind: &'static str,
    pub mode: ExecutionMode,
    pub profile: String,
    pub count: u64,
    pub average_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_jobs: u64,
    pub by_status: Vec<(JobStatus, u64)>,
    pub durations: Vec<DurationSummary>,
}

/// Receives engine measurements. Rendering and export are the sink's concern.
pub trait MetricsSink: Send + Sync + 'static + Clone {
    fn increment_jobs(&self, status: JobStatus, mode: ExecutionMode);

    fn observe_duration(
        &self,
        kind: DurationKind,
        mode: ExecutionMode,
        profile: &str,
        duration: Duration,
    );

    fn record_completion(&self, record: &CompletionRecord) {
        self.increment_jobs(record.status, record.mode);
        if let Some(d) = record.queue_duration {
            self.observe_duration(DurationKind::Queue, record.mode, &record.profile, d);
        }
        if let Some(d) = record.run_duration {
            self.observe_duration(DurationKind::Run, record.mode, &record.profile, d);
        }
    }

    /// Aggregates kept so far. [`None`] for sinks that only forward measurements.
    fn summary(&self) -> Option<MetricsSummary> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub scopes: Vec<String>,
}

impl User {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s == scope || s == crate::constants::scopes::ADMIN)
    }
}

/// A trait for injecting authentication logic into the server.
pub trait AuthProvider: Send + Sync + 'static + Clone {
    /// Verifies a token and returns a User identity if successful.
    fn verify(&self, token: &str) -> impl Future<Output = Result<User, AuthError>> + Send;
}
