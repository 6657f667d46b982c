//! Drives one admitted job from sandbox creation to its terminal status.

use crate::log_hub::LogHub;
use crate::registry::{JobRegistry, Transition};
use crate::scheduler::{Admission, CapacitySlot};

use corvus_core::prelude::*;
use futures::StreamExt;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Longest line kept in one chunk; longer output is split.
const MAX_LINE_BYTES: usize = 64 * 1024;

pub(crate) const SHUTDOWN_DETAIL: &str = "engine shutdown";

#[derive(Debug, Clone)]
pub(crate) struct SupervisorSettings {
    pub grace_period: Duration,
    pub teardown_retries: u32,
    pub teardown_backoff: Duration,
    pub cpu_image: String,
    pub gpu_image: String,
    pub gpu_driver: String,
    pub network_enabled: bool,
}

/// What ended the running phase.
enum Outcome {
    Exited(i64),
    TimedOut(Duration),
    Cancelled,
    Fault(String),
}

pub(crate) struct Supervisor<R: SandboxRuntime, M: MetricsSink> {
    registry: Arc<JobRegistry>,
    hub: Arc<LogHub>,
    runtime: R,
    metrics: M,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
}

impl<R: SandboxRuntime, M: MetricsSink> Clone for Supervisor<R, M> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            runtime: self.runtime.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<R: SandboxRuntime, M: MetricsSink> Supervisor<R, M> {
    pub(crate) fn new(
        registry: Arc<JobRegistry>,
        hub: Arc<LogHub>,
        runtime: R,
        metrics: M,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            hub,
            runtime,
            metrics,
            settings,
            shutdown,
        }
    }

    /// Supervises one admission. `slot` is released when this returns.
    pub(crate) async fn run(self, admission: Admission, slot: CapacitySlot) {
        let job_id = admission.job_id;
        let (job, token) = match (
            self.registry.get(job_id),
            self.registry.cancel_token(job_id),
        ) {
            (Ok(job), Ok(token)) => (job, token),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(%job_id, error = %e, "Admitted job vanished from the registry");
                return;
            }
        };

        self.hub.open_channel(job_id);
        let (transition, publish_ok) = self.execute(&job, &token).await;
        let transition = if publish_ok {
            transition
        } else {
            Transition::error(FailureReason::EngineFault {
                detail: "log channel rejected output".to_string(),
            })
            .with_leak_suspected(transition.leak_suspected())
        };

        if let Err(e) = self.hub.close(job_id) {
            tracing::error!(%job_id, error = %e, "Failed to close log channel");
        }

        let status = transition.status();
        match self.registry.transition(job_id, transition) {
            Ok(done) => {
                drop(slot);
                tracing::info!(
                    %job_id,
                    %status,
                    mode = %done.payload.mode,
                    profile = %done.payload.profile.name,
                    leak_suspected = done.leak_suspected,
                    "Job finished"
                );
                self.metrics.record_completion(&CompletionRecord {
                    job_id,
                    mode: done.payload.mode,
                    profile: done.payload.profile.name.clone(),
                    status: done.status,
                    queue_duration: done.queue_duration(),
                    run_duration: done.run_duration(),
                });
            }
            Err(e) => {
                drop(slot);
                tracing::error!(%job_id, %status, error = %e, "Terminal transition rejected");
                self.force_error(job_id, &e.to_string());
            }
        }
    }

    /// Runs the job and returns the terminal transition to apply, plus whether every publish succeeded.
    async fn execute(&self, job: &Job, token: &CancellationToken) -> (Transition, bool) {
        let job_id = job.id;

        if token.is_cancelled() {
            tracing::info!(%job_id, "Cancelled before sandbox creation");
            return (Transition::cancelled(self.cancel_detail()), true);
        }

        let spec = self.sandbox_spec(job);
        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Sandbox creation failed");
                let ok = self.console(job_id, format!("Failed to create sandbox: {e}"));
                return (
                    Transition::error(FailureReason::SandboxCreateFailed {
                        detail: e.to_string(),
                    }),
                    ok,
                );
            }
        };

        if token.is_cancelled() {
            tracing::info!(%job_id, sandbox = %handle, "Cancelled during sandbox creation");
            let leak = !self.teardown(job_id, &handle).await;
            return (
                Transition::cancelled(self.cancel_detail()).with_leak_suspected(leak),
                true,
            );
        }

        if let Err(e) = self
            .registry
            .transition(job_id, Transition::running(handle.clone()))
        {
            tracing::error!(%job_id, error = %e, "Could not mark job running");
            let leak = !self.teardown(job_id, &handle).await;
            return (
                Transition::error(FailureReason::EngineFault {
                    detail: e.to_string(),
                })
                .with_leak_suspected(leak),
                true,
            );
        }
        tracing::info!(%job_id, sandbox = %handle, profile = %job.payload.profile.name, "Job running");

        // Attach after start: runtimes only follow a running sandbox, and replay what it already wrote.
        let (outcome, pump) = match self.runtime.start(&handle).await {
            Ok(()) => {
                let pump = self.attach_output(job_id, &handle).await;
                (self.observe(job, &handle, token).await, pump)
            }
            Err(e) => (Outcome::Fault(format!("sandbox failed to start: {e}")), None),
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            self.stop(job_id, &handle).await;
        }

        let mut publish_ok = match pump {
            Some(pump) => self.drain(job_id, pump).await,
            None => true,
        };

        let leak = !self.teardown(job_id, &handle).await;

        let transition = match outcome {
            Outcome::Exited(code) => Transition::exited(code),
            Outcome::TimedOut(limit) => {
                publish_ok &=
                    self.console(job_id, format!("Timed out after {}s", limit.as_secs()));
                Transition::timed_out(limit)
            }
            Outcome::Cancelled => {
                publish_ok &= self.console(job_id, "Cancelled".to_string());
                Transition::cancelled(self.cancel_detail())
            }
            Outcome::Fault(detail) => {
                tracing::error!(%job_id, %detail, "Supervision failed");
                Transition::error(FailureReason::EngineFault { detail })
            }
        };

        (transition.with_leak_suspected(leak), publish_ok)
    }

    async fn attach_output(
        &self,
        job_id: JobId,
        handle: &SandboxHandle,
    ) -> Option<JoinHandle<Result<(), LogHubError>>> {
        match self.runtime.output(handle).await {
            Ok(stream) => Some(tokio::spawn(pump_output(self.hub.clone(), job_id, stream))),
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Could not attach to sandbox output");
                None
            }
        }
    }

    /// Waits for whichever of cancellation, exit and timeout fires first, in that priority.
    async fn observe(&self, job: &Job, handle: &SandboxHandle, token: &CancellationToken) -> Outcome {
        let limit = job.payload.profile.wall_timeout;
        let mut exit = pin!(self.runtime.wait_exit(handle));
        let mut deadline = pin!(sleep(limit));

        tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled,
            res = &mut exit => match res {
                Ok(code) => Outcome::Exited(code),
                Err(e) => Outcome::Fault(format!("lost track of sandbox exit: {e}")),
            },
            _ = &mut deadline => Outcome::TimedOut(limit),
        }
    }

    /// Graceful signal first, forceful kill once the grace period runs out.
    async fn stop(&self, job_id: JobId, handle: &SandboxHandle) {
        if let Err(e) = self.runtime.signal(handle, StopSignal::Terminate).await {
            tracing::warn!(%job_id, error = %e, "Failed to signal sandbox");
        }

        let exited = timeout(self.settings.grace_period, self.runtime.wait_exit(handle)).await;
        if matches!(exited, Ok(Ok(_))) {
            return;
        }

        tracing::info!(%job_id, sandbox = %handle, "Grace period elapsed, killing sandbox");
        if let Err(e) = self.runtime.kill(handle).await {
            tracing::warn!(%job_id, error = %e, "Failed to kill sandbox");
        }
    }

    /// Waits for the pump to flush what the sandbox produced, bounded by the grace period.
    async fn drain(&self, job_id: JobId, mut pump: JoinHandle<Result<(), LogHubError>>) -> bool {
        match timeout(self.settings.grace_period, &mut pump).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                tracing::error!(%job_id, error = %e, "Output published to an unusable channel");
                false
            }
            Ok(Err(e)) => {
                tracing::error!(%job_id, error = %e, "Output pump panicked");
                true
            }
            Err(_) => {
                tracing::warn!(%job_id, "Output pump did not finish, aborting");
                pump.abort();
                true
            }
        }
    }

    /// Destroys the sandbox, retrying transient failures. Returns whether teardown was confirmed.
    async fn teardown(&self, job_id: JobId, handle: &SandboxHandle) -> bool {
        let mut backoff = self.settings.teardown_backoff;
        let mut attempt = 0;
        loop {
            match self.runtime.destroy(handle).await {
                Ok(()) | Err(SandboxError::NotFound(_)) => return true,
                Err(e) if e.is_transient() && attempt < self.settings.teardown_retries => {
                    attempt += 1;
                    tracing::warn!(%job_id, sandbox = %handle, attempt, error = %e, "Teardown failed, retrying");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::error!(%job_id, sandbox = %handle, error = %e, "Teardown not confirmed, sandbox may leak");
                    return false;
                }
            }
        }
    }

    fn console(&self, job_id: JobId, line: String) -> bool {
        match self.hub.publish(job_id, LogSource::Console, line) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to publish console line");
                false
            }
        }
    }

    fn cancel_detail(&self) -> Option<String> {
        self.shutdown
            .is_cancelled()
            .then(|| SHUTDOWN_DETAIL.to_string())
    }

    fn force_error(&self, job_id: JobId, detail: &str) {
        let transition = Transition::error(FailureReason::EngineFault {
            detail: detail.to_string(),
        });
        if let Err(e) = self.registry.transition(job_id, transition) {
            tracing::debug!(%job_id, error = %e, "Job already terminal");
        }
    }

    fn sandbox_spec(&self, job: &Job) -> SandboxSpec {
        let payload = &job.payload;
        let (image, gpu) = match payload.mode {
            ExecutionMode::Cpu => (self.settings.cpu_image.clone(), None),
            ExecutionMode::Gpu => (
                self.settings.gpu_image.clone(),
                Some(GpuRequest {
                    driver: self.settings.gpu_driver.clone(),
                    count: -1,
                }),
            ),
        };

        SandboxSpec {
            name: format!("corvus-job-{}", job.id),
            image,
            command: vec![
                "python3".to_string(),
                "-u".to_string(),
                "-c".to_string(),
                payload.script.clone(),
            ],
            env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("CORVUS_JOB_ID".to_string(), job.id.to_string()),
                ("CORVUS_SCRIPT_NAME".to_string(), payload.script_name.clone()),
            ],
            cpu_share: payload.profile.cpu_share,
            memory_limit_bytes: payload.profile.memory_limit_bytes,
            gpu,
            network_enabled: self.settings.network_enabled,
            labels: vec![
                (labels::JOB_ID.to_string(), job.id.to_string()),
                (labels::OWNER.to_string(), job.owner_id.clone()),
                (labels::PROFILE.to_string(), payload.profile.name.clone()),
            ],
        }
    }
}

/// Splits raw output into lines, per source.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: HashMap<LogSource, Vec<u8>>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, source: LogSource, data: &[u8]) -> Vec<String> {
        let buf = self.pending.entry(source).or_default();
        buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        while buf.len() > MAX_LINE_BYTES {
            let head: Vec<u8> = buf.drain(..char_boundary(buf, MAX_LINE_BYTES)).collect();
            lines.push(String::from_utf8_lossy(&head).into_owned());
        }
        lines
    }

    /// Flushes partial trailing lines.
    pub(crate) fn finish(&mut self) -> Vec<(LogSource, String)> {
        let mut rest = Vec::new();
        for source in [LogSource::Stdout, LogSource::Stderr, LogSource::Console] {
            match self.pending.remove(&source) {
                Some(buf) if !buf.is_empty() => {
                    rest.push((source, String::from_utf8_lossy(&buf).into_owned()));
                }
                _ => {}
            }
        }
        rest
    }
}

/// The last UTF-8 character boundary at or before `max`. Falls back to `max` for invalid input.
fn char_boundary(buf: &[u8], max: usize) -> usize {
    let is_continuation = |i: usize| buf.get(i).is_some_and(|b| b & 0xC0 == 0x80);
    let mut cut = max;
    while cut > 0 && is_continuation(cut) {
        cut -= 1;
    }
    if cut == 0 { max } else { cut }
}

async fn pump_output(
    hub: Arc<LogHub>,
    job_id: JobId,
    mut stream: OutputStream,
) -> Result<(), LogHubError> {
    let mut splitter = LineSplitter::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(output) => {
                for line in splitter.push(output.source, &output.data) {
                    hub.publish(job_id, output.source, line)?;
                }
            }
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Sandbox output stream failed");
                break;
            }
        }
    }
    for (source, line) in splitter.finish() {
        hub.publish(job_id, source, line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoMetrics;
    use crate::payload::PayloadResolver;
    use crate::scheduler::AdmissionScheduler;
    use corvus_sandbox_mock::MockRuntime;

    #[test]
    fn splits_lines_per_source() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(LogSource::Stdout, b"hel"), Vec::<String>::new());
        assert_eq!(splitter.push(LogSource::Stderr, b"oops\r\npart"), vec!["oops"]);
        assert_eq!(
            splitter.push(LogSource::Stdout, b"lo\nworld\n"),
            vec!["hello", "world"]
        );
        assert_eq!(
            splitter.finish(),
            vec![(LogSource::Stderr, "part".to_string())]
        );
    }

    #[test]
    fn overlong_lines_are_split() {
        let mut splitter = LineSplitter::default();
        let data = vec![b'a'; MAX_LINE_BYTES + 10];
        let lines = splitter.push(LogSource::Stdout, &data);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(splitter.finish()[0].1.len(), 10);
    }

    #[test]
    fn overlong_lines_split_on_char_boundaries() {
        let mut splitter = LineSplitter::default();
        let mut data = vec![b'a'; MAX_LINE_BYTES - 1];
        data.extend_from_slice("éb".as_bytes());

        let lines = splitter.push(LogSource::Stdout, &data);
        assert_eq!(lines, vec!["a".repeat(MAX_LINE_BYTES - 1)]);
        assert_eq!(
            splitter.finish(),
            vec![(LogSource::Stdout, "éb".to_string())]
        );
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            grace_period: Duration::from_secs(5),
            teardown_retries: 3,
            teardown_backoff: Duration::from_millis(200),
            cpu_image: "python:3.11-slim".to_string(),
            gpu_image: "gpu".to_string(),
            gpu_driver: "nvidia".to_string(),
            network_enabled: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn output_after_channel_close_is_an_engine_fault() {
        let shutdown = CancellationToken::new();
        let resolver = PayloadResolver::new(ProfileRegistry::default(), false);
        let registry = Arc::new(JobRegistry::new(resolver, shutdown.clone()));
        let hub = Arc::new(LogHub::new(16));
        let scheduler = Arc::new(AdmissionScheduler::new(1, 0));
        let runtime = MockRuntime::new();
        let supervisor = Supervisor::new(
            registry.clone(),
            hub.clone(),
            runtime.clone(),
            NoMetrics,
            settings(),
            shutdown,
        );

        let request = JobRequest {
            script: "sleep 1\nprint late\nexit 0".to_string(),
            profile: Some("small".to_string()),
            ..Default::default()
        };
        let job = registry.create("alice", &request, None).unwrap();
        hub.open_channel(job.id);
        scheduler.submit(job.id, ResourceClass::Cpu);
        let admission = scheduler.dispatch()[0];
        let slot = CapacitySlot::new(scheduler.clone(), job.id);
        let run = tokio::spawn(supervisor.run(admission, slot));

        while registry.get(job.id).unwrap().status != JobStatus::Running {
            sleep(Duration::from_millis(10)).await;
        }
        hub.close(job.id).unwrap();
        run.await.unwrap();

        let job = registry.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(matches!(
            job.failure_reason,
            Some(FailureReason::EngineFault { .. })
        ));
        assert!(!job.leak_suspected);
        assert_eq!(scheduler.stats(ResourceClass::Cpu).in_use, 0);
        assert_eq!(runtime.live(), 0);
    }
}
