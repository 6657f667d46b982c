//! The in-memory job table and the single authority over status transitions.

use crate::payload::PayloadResolver;
use crate::sync::{lock, read, write};

use chrono::{DateTime, Utc};
use corvus_core::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A state machine edge plus the fields it sets.
///
/// Built through the constructors so the fields always match the target status.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    status: JobStatus,
    exit_code: Option<i64>,
    reason: Option<FailureReason>,
    handle: Option<SandboxHandle>,
    leak_suspected: bool,
}

impl Transition {
    fn to(status: JobStatus) -> Self {
        Self {
            status,
            exit_code: None,
            reason: None,
            handle: None,
            leak_suspected: false,
        }
    }

    /// `queued -> running`, recording the sandbox the supervisor now owns.
    pub fn running(handle: SandboxHandle) -> Self {
        Self {
            handle: Some(handle),
            ..Self::to(JobStatus::Running)
        }
    }

    /// Natural exit: `succeeded` on 0, `failed` otherwise.
    pub fn exited(code: i64) -> Self {
        if code == 0 {
            Self {
                exit_code: Some(0),
                ..Self::to(JobStatus::Succeeded)
            }
        } else {
            Self {
                exit_code: Some(code),
                reason: Some(FailureReason::NonZeroExit { code }),
                ..Self::to(JobStatus::Failed)
            }
        }
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self {
            reason: Some(FailureReason::TimedOut {
                limit_secs: limit.as_secs(),
            }),
            ..Self::to(JobStatus::TimedOut)
        }
    }

    pub fn cancelled(detail: Option<String>) -> Self {
        Self {
            reason: Some(FailureReason::Cancelled { detail }),
            ..Self::to(JobStatus::Cancelled)
        }
    }

    pub fn error(reason: FailureReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::to(JobStatus::Error)
        }
    }

    pub fn with_leak_suspected(mut self, leak_suspected: bool) -> Self {
        self.leak_suspected = leak_suspected;
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn leak_suspected(&self) -> bool {
        self.leak_suspected
    }
}

struct Entry {
    job: Mutex<Job>,
    cancel: CancellationToken,
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Entry>>>,
    active_by_owner: Mutex<HashMap<String, usize>>,
    resolver: PayloadResolver,
    shutdown: CancellationToken,
}

impl JobRegistry {
    /// Per-job cancellation tokens are children of `shutdown`.
    pub fn new(resolver: PayloadResolver, shutdown: CancellationToken) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            active_by_owner: Mutex::new(HashMap::new()),
            resolver,
            shutdown,
        }
    }

    /// Validates the request and allocates a new `queued` job.
    ///
    /// `quota` bounds the owner's non-terminal jobs, checked atomically with the insert.
    pub fn create(
        &self,
        owner_id: &str,
        request: &JobRequest,
        quota: Option<usize>,
    ) -> Result<Job, EngineError> {
        let resolved = self.resolver.resolve(request)?;

        {
            let mut active = lock(&self.active_by_owner);
            let count = active.entry(owner_id.to_string()).or_default();
            match quota {
                Some(limit) if *count >= limit => {
                    return Err(EngineError::QuotaExceeded {
                        owner: owner_id.to_string(),
                        limit,
                    });
                }
                _ => *count += 1,
            }
        }

        let mut job = Job::new(owner_id, resolved.payload);
        job.allocation_note = resolved.note;
        let entry = Arc::new(Entry {
            job: Mutex::new(job.clone()),
            cancel: self.shutdown.child_token(),
        });
        write(&self.jobs).insert(job.id, entry);

        Ok(job)
    }

    fn entry(&self, id: JobId) -> Result<Arc<Entry>, EngineError> {
        read(&self.jobs)
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub fn get(&self, id: JobId) -> Result<Job, EngineError> {
        let entry = self.entry(id)?;
        let job = lock(&entry.job).clone();
        Ok(job)
    }

    /// The token the job's supervisor observes for cancellation.
    pub fn cancel_token(&self, id: JobId) -> Result<CancellationToken, EngineError> {
        Ok(self.entry(id)?.cancel.clone())
    }

    /// Applies one state machine edge under the job's own exclusion.
    pub fn transition(&self, id: JobId, transition: Transition) -> Result<Job, EngineError> {
        let entry = self.entry(id)?;
        let mut job = lock(&entry.job);

        let (from, to) = (job.status, transition.status);
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let now = Utc::now();
        job.status = to;
        if to == JobStatus::Running {
            job.started_at = Some(now);
            job.sandbox_handle = transition.handle;
        } else {
            job.finished_at = Some(now);
            job.exit_code = transition.exit_code;
            job.failure_reason = transition.reason;
            job.sandbox_handle = None;
            job.leak_suspected |= transition.leak_suspected;

            let mut active = lock(&self.active_by_owner);
            if let Some(count) = active.get_mut(&job.owner_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    active.remove(&job.owner_id);
                }
            }
        }

        Ok(job.clone())
    }

    /// The owner's jobs, newest first.
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<Job> {
        let entries: Vec<Arc<Entry>> = read(&self.jobs).values().cloned().collect();
        let mut jobs: Vec<Job> = entries
            .iter()
            .map(|e| lock(&e.job))
            .filter(|job| job.owner_id == owner_id)
            .map(|job| job.clone())
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    pub fn active_count(&self, owner_id: &str) -> usize {
        lock(&self.active_by_owner)
            .get(owner_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drops terminal jobs that finished before `cutoff` and returns their ids.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let mut jobs = write(&self.jobs);
        let expired: Vec<JobId> = jobs
            .iter()
            .filter(|(_, entry)| {
                let job = lock(&entry.job);
                job.status.is_terminal() && job.finished_at.is_some_and(|at| at < cutoff)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    /// Current status of every retained job.
    pub fn statuses(&self) -> Vec<(JobId, JobStatus)> {
        let entries: Vec<(JobId, Arc<Entry>)> = read(&self.jobs)
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries
            .into_iter()
            .map(|(id, entry)| (id, lock(&entry.job).status))
            .collect()
    }

    /// Number of retained jobs per status.
    pub fn counts(&self) -> Vec<(JobStatus, usize)> {
        let entries: Vec<Arc<Entry>> = read(&self.jobs).values().cloned().collect();
        let mut counts: HashMap<JobStatus, usize> = HashMap::new();
        for entry in entries {
            *counts.entry(lock(&entry.job).status).or_default() += 1;
        }
        JobStatus::ALL
            .into_iter()
            .map(|status| (status, counts.get(&status).copied().unwrap_or(0)))
            .collect()
    }
}
