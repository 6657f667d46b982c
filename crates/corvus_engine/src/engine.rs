use crate::analyzer::{ScriptAnalysis, analyze};
use crate::config::EngineConfig;
use crate::log_hub::{LogHub, LogSubscription};
use crate::payload::PayloadResolver;
use crate::registry::{JobRegistry, Transition};
use crate::scheduler::{Admission, AdmissionScheduler, CapacitySlot, PoolStats};
use crate::supervisor::{SHUTDOWN_DETAIL, Supervisor, SupervisorSettings};
use crate::sync::lock;

use chrono::Utc;
use corvus_core::prelude::*;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The job was still queued and is now `cancelled`.
    Cancelled,
    /// The stop signal was issued; the job reaches `cancelled` asynchronously.
    CancelRequested,
    /// The job had already reached a terminal status.
    AlreadyTerminal,
}

/// Per-owner usage over retained jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerSummary {
    pub owner_id: String,
    pub total_jobs: usize,
    /// Jobs still `queued` or `running`.
    pub active_jobs: usize,
    pub by_status: Vec<(JobStatus, usize)>,
    pub total_run_secs: f64,
    pub average_run_secs: f64,
}

struct Inner<R: SandboxRuntime, M: MetricsSink> {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    scheduler: Arc<AdmissionScheduler>,
    hub: Arc<LogHub>,
    runtime: R,
    metrics: M,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The job execution engine: submission, status, log streaming and cancellation.
///
/// Cheap to clone; clones share the same engine.
pub struct Engine<R: SandboxRuntime, M: MetricsSink> {
    inner: Arc<Inner<R, M>>,
}

impl<R: SandboxRuntime, M: MetricsSink> Clone for Engine<R, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: SandboxRuntime, M: MetricsSink> Engine<R, M> {
    /// Checks the runtime and starts the dispatch, supervision and retention tasks.
    pub async fn start(config: EngineConfig, runtime: R, metrics: M) -> Result<Self, SandboxError> {
        runtime.init().await?;

        let shutdown = CancellationToken::new();
        let resolver = PayloadResolver::new(config.profiles.clone(), config.gpu_slots > 0);
        let registry = Arc::new(JobRegistry::new(resolver, shutdown.clone()));
        let scheduler = Arc::new(AdmissionScheduler::new(config.cpu_slots, config.gpu_slots));
        let hub = Arc::new(LogHub::new(config.log_buffer_capacity));

        let supervisor = Supervisor::new(
            registry.clone(),
            hub.clone(),
            runtime.clone(),
            metrics.clone(),
            SupervisorSettings {
                grace_period: config.grace_period,
                teardown_retries: config.teardown_retries,
                teardown_backoff: config.teardown_backoff,
                cpu_image: config.cpu_image.clone(),
                gpu_image: config.gpu_image.clone(),
                gpu_driver: config.gpu_driver.clone(),
                network_enabled: config.network_enabled,
            },
            shutdown.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(scheduler.clone().run(tx, shutdown.clone())),
            tokio::spawn(supervise_admissions(rx, supervisor, scheduler.clone())),
            tokio::spawn(reap_expired(
                registry.clone(),
                hub.clone(),
                config.retention,
                shutdown.clone(),
            )),
        ];

        tracing::info!(
            cpu_slots = config.cpu_slots,
            gpu_slots = config.gpu_slots,
            "Engine started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                scheduler,
                hub,
                runtime,
                metrics,
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &M {
        &self.inner.metrics
    }

    /// Validates and enqueues a job. Never waits for admission.
    pub fn submit(&self, owner_id: &str, request: JobRequest) -> Result<JobId, EngineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let job = inner
            .registry
            .create(owner_id, &request, inner.config.owner_quota)?;
        self.enqueue(&job);

        tracing::info!(
            job_id = %job.id,
            owner = owner_id,
            mode = %job.payload.mode,
            profile = %job.payload.profile.name,
            "Job queued"
        );
        Ok(job.id)
    }

    fn enqueue(&self, job: &Job) {
        let inner = &self.inner;
        inner.hub.open_channel(job.id);
        inner.scheduler.submit(job.id, job.class());

        // Shutdown may have started after the check in `submit`; the dispatch loop is gone then.
        if inner.shutdown.is_cancelled() && inner.scheduler.withdraw(job.id) {
            self.cancel_queued(job.id, Some(SHUTDOWN_DETAIL.to_string()));
        }
    }

    /// Previews the profile and mode automatic allocation would pick for `script`.
    pub fn analyze(&self, script: &str) -> ScriptAnalysis {
        analyze(script, self.inner.config.gpu_slots > 0)
    }

    /// Checks that the sandbox runtime is still reachable.
    pub async fn runtime_ready(&self) -> Result<(), SandboxError> {
        self.inner.runtime.init().await
    }

    pub fn status(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.inner.registry.get(job_id)
    }

    /// Buffered output followed by live output, until the job's channel closes.
    pub fn stream_logs(&self, job_id: JobId) -> Result<LogSubscription, EngineError> {
        self.inner.registry.get(job_id)?;
        self.inner
            .hub
            .subscribe(job_id)
            .map_err(|_| EngineError::NotFound(job_id))
    }

    /// Cancels a job on behalf of its owner.
    pub fn cancel(&self, job_id: JobId, requester_id: &str) -> Result<CancelAck, EngineError> {
        let job = self.inner.registry.get(job_id)?;
        if job.owner_id != requester_id {
            return Err(EngineError::Forbidden(format!(
                "job {job_id} belongs to another owner"
            )));
        }
        self.cancel_job(job)
    }

    /// Cancels any job regardless of its owner. Reserved for administrators.
    pub fn cancel_any(&self, job_id: JobId) -> Result<CancelAck, EngineError> {
        let job = self.inner.registry.get(job_id)?;
        self.cancel_job(job)
    }

    fn cancel_job(&self, job: Job) -> Result<CancelAck, EngineError> {
        let inner = &self.inner;
        let job_id = job.id;
        if job.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal);
        }

        if inner.scheduler.withdraw(job_id) {
            return Ok(self.cancel_queued(job_id, None));
        }

        if inner.registry.get(job_id)?.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal);
        }
        inner.registry.cancel_token(job_id)?.cancel();
        tracing::info!(%job_id, "Cancellation requested");
        Ok(CancelAck::CancelRequested)
    }

    /// Finishes a job that was withdrawn before admission. No sandbox was ever created.
    fn cancel_queued(&self, job_id: JobId, detail: Option<String>) -> CancelAck {
        let inner = &self.inner;
        let done = match inner
            .registry
            .transition(job_id, Transition::cancelled(detail))
        {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Withdrawn job could not be cancelled");
                return CancelAck::AlreadyTerminal;
            }
        };

        if let Err(e) = inner.hub.close(job_id) {
            tracing::error!(%job_id, error = %e, "Failed to close log channel");
        }
        tracing::info!(%job_id, "Cancelled while queued");
        inner.metrics.record_completion(&CompletionRecord {
            job_id,
            mode: done.payload.mode,
            profile: done.payload.profile.name.clone(),
            status: done.status,
            queue_duration: done.queue_duration(),
            run_duration: None,
        });
        CancelAck::Cancelled
    }

    pub fn list_jobs(&self, owner_id: &str) -> Vec<Job> {
        self.inner.registry.list_by_owner(owner_id)
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        ResourceClass::ALL
            .into_iter()
            .map(|class| self.inner.scheduler.stats(class))
            .collect()
    }

    /// Retained jobs per status.
    pub fn counts(&self) -> Vec<(JobStatus, usize)> {
        self.inner.registry.counts()
    }

    /// Usage of one owner over the jobs still retained.
    pub fn owner_summary(&self, owner_id: &str) -> OwnerSummary {
        let jobs = self.inner.registry.list_by_owner(owner_id);
        let by_status = JobStatus::ALL
            .into_iter()
            .map(|status| (status, jobs.iter().filter(|j| j.status == status).count()))
            .collect();

        let runs: Vec<Duration> = jobs.iter().filter_map(Job::run_duration).collect();
        let total_run: Duration = runs.iter().sum();
        let average_run_secs = if runs.is_empty() {
            0.0
        } else {
            total_run.as_secs_f64() / runs.len() as f64
        };

        OwnerSummary {
            owner_id: owner_id.to_string(),
            total_jobs: jobs.len(),
            active_jobs: self.inner.registry.active_count(owner_id),
            by_status,
            total_run_secs: total_run.as_secs_f64(),
            average_run_secs,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops accepting work, cancels every queued and running job and waits for supervision to end.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Engine shutting down");
        inner.shutdown.cancel();

        for (job_id, status) in inner.registry.statuses() {
            if status == JobStatus::Queued && inner.scheduler.withdraw(job_id) {
                self.cancel_queued(job_id, Some(SHUTDOWN_DETAIL.to_string()));
            }
        }

        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Engine task failed");
            }
        }
        tracing::info!("Engine stopped");
    }
}

/// Spawns one supervisor per admission and keeps them until they finish.
async fn supervise_admissions<R: SandboxRuntime, M: MetricsSink>(
    mut admissions: mpsc::UnboundedReceiver<Admission>,
    supervisor: Supervisor<R, M>,
    scheduler: Arc<AdmissionScheduler>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            Some(admission) = admissions.recv() => {
                let slot = CapacitySlot::new(scheduler.clone(), admission.job_id);
                running.spawn(supervisor.clone().run(admission, slot));
            }
            Some(result) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Supervisor task failed");
                }
            }
            else => break,
        }
    }
}

/// Evicts finished jobs and their log channels once the retention window has passed.
async fn reap_expired(
    registry: Arc<JobRegistry>,
    hub: Arc<LogHub>,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        tracing::warn!("Retention window out of range, finished jobs are kept");
        return;
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let evicted = registry.evict_finished_before(Utc::now() - retention);
        for job_id in &evicted {
            hub.remove(*job_id);
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted finished jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_sandbox_mock::MockRuntime;

    #[tokio::test]
    async fn enqueue_racing_shutdown_cancels_the_job() {
        let runtime = MockRuntime::new();
        let engine = Engine::start(EngineConfig::default(), runtime.clone(), crate::metrics::NoMetrics)
            .await
            .unwrap();
        let request = JobRequest {
            script: "exit 0".to_string(),
            profile: Some("small".to_string()),
            ..Default::default()
        };

        // Passed the shutdown check, then shutdown began before the job reached the scheduler.
        let job = engine.inner.registry.create("alice", &request, None).unwrap();
        engine.shutdown().await;
        engine.enqueue(&job);

        let job = engine.status(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.failure_reason,
            Some(FailureReason::Cancelled {
                detail: Some(SHUTDOWN_DETAIL.to_string())
            })
        );
        assert!(engine.inner.hub.is_closed(job.id).unwrap());
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn owner_summary_counts_only_the_owner() {
        let engine = Engine::start(EngineConfig::default(), MockRuntime::new(), crate::metrics::NoMetrics)
            .await
            .unwrap();
        let request = |script: &str| JobRequest {
            script: script.to_string(),
            profile: Some("small".to_string()),
            ..Default::default()
        };
        let id = engine.submit("alice", request("exit 0")).unwrap();
        engine.submit("bob", request("exit 0")).unwrap();
        while !engine.status(id).unwrap().status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let summary = engine.owner_summary("alice");
        assert_eq!(summary.total_jobs, 1);
        assert_eq!(summary.active_jobs, 0);
        assert!(summary.by_status.contains(&(JobStatus::Succeeded, 1)));
        engine.shutdown().await;
    }
}
