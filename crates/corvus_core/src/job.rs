use crate::profile::{ResourceClass, ResourceOverrides, ResourceProfile};
use crate::sandbox::SandboxHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// A request to run a script, as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobRequest {
    /// Script source to execute.
    pub script: String,
    /// Display name of the script. Defaults to `script.py`.
    pub script_name: Option<String>,
    /// Execution mode. [`None`] lets the engine decide from the script.
    pub mode: Option<ExecutionMode>,
    /// Resource profile name (e.g., "small", "gpu"). [`None`] or `"auto"` lets the engine decide.
    pub profile: Option<String>,
    /// Optional per-job adjustments of the profile limits.
    pub overrides: Option<ResourceOverrides>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Cpu,
    Gpu,
}

impl ExecutionMode {
    /// The capacity pool a job in this mode is admitted from.
    pub fn class(self) -> ResourceClass {
        match self {
            Self::Cpu => ResourceClass::Cpu,
            Self::Gpu => ResourceClass::Gpu,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated job payload: the script plus the resolved mode and profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub script: String,
    pub script_name: String,
    pub mode: ExecutionMode,
    pub profile: ResourceProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::Queued,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
        Self::Error,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running | Cancelled | Error)
                | (Running, Succeeded | Failed | TimedOut | Cancelled | Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timedOut",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured reason attached to every non-`succeeded` terminal state.
///
/// Runtime error text is only ever carried in `detail` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    /// The script exited with a non-zero code.
    NonZeroExit { code: i64 },
    /// The wall-clock limit of the profile elapsed.
    TimedOut { limit_secs: u64 },
    /// Cancelled by the owner, or by the engine shutting down.
    Cancelled { detail: Option<String> },
    /// The runtime could not materialize the sandbox.
    SandboxCreateFailed { detail: String },
    /// The engine hit an unrecoverable fault while supervising the job.
    EngineFault { detail: String },
}

impl FailureReason {
    /// The taxonomy name of the reason, without diagnostic detail.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NonZeroExit { .. } => "NonZeroExit",
            Self::TimedOut { .. } => "TimedOut",
            Self::Cancelled { .. } => "Cancelled",
            Self::SandboxCreateFailed { .. } => "SandboxCreateFailed",
            Self::EngineFault { .. } => "EngineFault",
        }
    }
}

/// Snapshot of a job. The registry owns the live copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Only set on `succeeded`/`failed`.
    pub exit_code: Option<i64>,
    pub failure_reason: Option<FailureReason>,
    /// Only set while `running`.
    pub sandbox_handle: Option<SandboxHandle>,
    /// Teardown could not be confirmed; an external reaper should reconcile the sandbox.
    pub leak_suspected: bool,
    /// How the profile and mode were chosen when the submission asked for automatic allocation.
    pub allocation_note: Option<String>,
}

impl Job {
    pub fn new(owner_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            payload,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            sandbox_handle: None,
            leak_suspected: false,
            allocation_note: None,
        }
    }

    pub fn class(&self) -> ResourceClass {
        self.payload.mode.class()
    }

    /// Time spent waiting for admission, once the job has left the queue.
    pub fn queue_duration(&self) -> Option<Duration> {
        let until = self.started_at.or(self.finished_at)?;
        (until - self.submitted_at).to_std().ok()
    }

    /// Time spent running, once the job has finished.
    pub fn run_duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn queued_cannot_skip_running() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::TimedOut));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timedOut\"");
    }

    #[test]
    fn failure_reason_is_tagged() {
        let reason = FailureReason::TimedOut { limit_secs: 60 };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "timedOut");
        assert_eq!(value["limit_secs"], 60);
        assert_eq!(reason.kind(), "TimedOut");
    }
}
