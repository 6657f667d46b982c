use crate::sync::lock;

use corvus_core::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Emits every measurement as a structured `tracing` event.
#[derive(Clone, Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_jobs(&self, status: JobStatus, mode: ExecutionMode) {
        tracing::info!(target: "corvus::metrics", %status, %mode, "jobs_total += 1");
    }

    fn observe_duration(
        &self,
        kind: DurationKind,
        mode: ExecutionMode,
        profile: &str,
        duration: Duration,
    ) {
        tracing::info!(
            target: "corvus::metrics",
            ?kind,
            %mode,
            profile,
            seconds = duration.as_secs_f64(),
            "duration observed"
        );
    }
}

/// Discards everything.
#[derive(Clone, Debug, Default)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn increment_jobs(&self, _status: JobStatus, _mode: ExecutionMode) {}

    fn observe_duration(
        &self,
        _kind: DurationKind,
        _mode: ExecutionMode,
        _profile: &str,
        _duration: Duration,
    ) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Aggregate {
    count: u64,
    total: Duration,
    max: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    jobs: HashMap<(JobStatus, ExecutionMode), u64>,
    durations: HashMap<(DurationKind, ExecutionMode, String), Aggregate>,
}

/// Keeps counters and duration aggregates in memory. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetrics {
    inner: Arc<Mutex<Counters>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self, status: JobStatus, mode: ExecutionMode) -> u64 {
        lock(&self.inner)
            .jobs
            .get(&(status, mode))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_jobs(&self, status: JobStatus, mode: ExecutionMode) {
        *lock(&self.inner).jobs.entry((status, mode)).or_default() += 1;
    }

    fn observe_duration(
        &self,
        kind: DurationKind,
        mode: ExecutionMode,
        profile: &str,
        duration: Duration,
    ) {
        let mut counters = lock(&self.inner);
        let agg = counters
            .durations
            .entry((kind, mode, profile.to_string()))
            .or_default();
        agg.count += 1;
        agg.total += duration;
        agg.max = agg.max.max(duration);
    }

    fn summary(&self) -> Option<MetricsSummary> {
        let counters = lock(&self.inner);

        let by_status: Vec<(JobStatus, u64)> = JobStatus::ALL
            .iter()
            .map(|status| {
                let n = counters
                    .jobs
                    .iter()
                    .filter(|((s, _), _)| s == status)
                    .map(|(_, n)| n)
                    .sum();
                (*status, n)
            })
            .collect();

        let mut durations: Vec<DurationSummary> = counters
            .durations
            .iter()
            .map(|((kind, mode, profile), agg)| DurationSummary {
                kind: match kind {
                    DurationKind::Queue => "queue",
                    DurationKind::Run => "run",
                },
                mode: *mode,
                profile: profile.clone(),
                count: agg.count,
                average_secs: agg.total.as_secs_f64() / agg.count.max(1) as f64,
                max_secs: agg.max.as_secs_f64(),
            })
            .collect();
        durations.sort_by(|a, b| {
            (a.kind, a.mode.as_str(), &a.profile).cmp(&(b.kind, b.mode.as_str(), &b.profile))
        });

        Some(MetricsSummary {
            total_jobs: by_status.iter().map(|(_, n)| n).sum(),
            by_status,
            durations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn completion_records_are_aggregated() {
        let metrics = InMemoryMetrics::new();
        let shared = metrics.clone();

        for (status, run) in [(JobStatus::Succeeded, 2), (JobStatus::Failed, 4)] {
            shared.record_completion(&CompletionRecord {
                job_id: Uuid::new_v4(),
                mode: ExecutionMode::Cpu,
                profile: "small".to_string(),
                status,
                queue_duration: Some(Duration::from_secs(1)),
                run_duration: Some(Duration::from_secs(run)),
            });
        }

        assert_eq!(metrics.jobs(JobStatus::Succeeded, ExecutionMode::Cpu), 1);
        let summary = metrics.summary().unwrap();
        assert_eq!(summary.total_jobs, 2);

        let run = summary.durations.iter().find(|d| d.kind == "run").unwrap();
        assert_eq!(run.count, 2);
        assert_eq!(run.average_secs, 3.0);
        assert_eq!(run.max_secs, 4.0);
    }

    #[test]
    fn forwarding_sinks_keep_no_summary() {
        assert!(TracingMetrics.summary().is_none());
        assert!(NoMetrics.summary().is_none());
    }
}
