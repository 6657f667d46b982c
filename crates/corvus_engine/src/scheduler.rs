//! Bounded-concurrency admission, FIFO per capacity pool.

use crate::sync::lock;

use corvus_core::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Withdrawn ids linger in a wait line until popped; past this slack the line is compacted.
const COMPACT_SLACK: usize = 64;

/// A queued job that was granted a slot in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub job_id: JobId,
    pub class: ResourceClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub class: ResourceClass,
    pub max_concurrent: usize,
    pub in_use: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct Pool {
    max_concurrent: usize,
    in_use: usize,
    waiting: usize,
    line: VecDeque<JobId>,
}

impl Pool {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            in_use: 0,
            waiting: 0,
            line: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct State {
    pools: [Pool; 2],
    waiting: HashMap<JobId, ResourceClass>,
    admitted: HashMap<JobId, ResourceClass>,
}

#[derive(Debug)]
pub struct AdmissionScheduler {
    state: Mutex<State>,
    wake: Notify,
}

impl AdmissionScheduler {
    pub fn new(cpu_slots: usize, gpu_slots: usize) -> Self {
        Self {
            state: Mutex::new(State {
                pools: [Pool::new(cpu_slots), Pool::new(gpu_slots)],
                waiting: HashMap::new(),
                admitted: HashMap::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Enqueues a job at the back of its pool's line. Never blocks.
    pub fn submit(&self, job_id: JobId, class: ResourceClass) {
        {
            let mut state = lock(&self.state);
            if state.waiting.insert(job_id, class).is_some() || state.admitted.contains_key(&job_id)
            {
                return;
            }
            let pool = &mut state.pools[class.index()];
            pool.line.push_back(job_id);
            pool.waiting += 1;
        }
        self.wake.notify_one();
    }

    /// Removes a job that is still waiting. Returns `false` once it was admitted.
    pub fn withdraw(&self, job_id: JobId) -> bool {
        let mut state = lock(&self.state);
        let State { pools, waiting, .. } = &mut *state;
        let Some(class) = waiting.remove(&job_id) else {
            return false;
        };

        let pool = &mut pools[class.index()];
        pool.waiting -= 1;
        if pool.line.len() > pool.waiting * 2 + COMPACT_SLACK {
            pool.line.retain(|id| waiting.contains_key(id));
        }
        true
    }

    /// Admits the oldest waiting jobs of every pool that has a free slot.
    pub fn dispatch(&self) -> Vec<Admission> {
        let mut admissions = Vec::new();
        let mut state = lock(&self.state);
        let State {
            pools,
            waiting,
            admitted,
        } = &mut *state;

        for class in ResourceClass::ALL {
            let pool = &mut pools[class.index()];
            while pool.in_use < pool.max_concurrent {
                let Some(job_id) = pool.line.pop_front() else {
                    break;
                };
                if waiting.remove(&job_id).is_none() {
                    continue;
                }
                pool.waiting -= 1;
                pool.in_use += 1;
                admitted.insert(job_id, class);
                admissions.push(Admission { job_id, class });
            }
        }

        admissions
    }

    /// Returns the slot held by an admitted job. Releasing twice is a no-op.
    pub fn release(&self, job_id: JobId) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(class) = state.admitted.remove(&job_id) else {
                return false;
            };
            let pool = &mut state.pools[class.index()];
            debug_assert!(pool.in_use > 0);
            pool.in_use = pool.in_use.saturating_sub(1);
        }
        self.wake.notify_one();
        true
    }

    pub fn stats(&self, class: ResourceClass) -> PoolStats {
        let state = lock(&self.state);
        let pool = &state.pools[class.index()];
        PoolStats {
            class,
            max_concurrent: pool.max_concurrent,
            in_use: pool.in_use,
            waiting: pool.waiting,
        }
    }

    /// Dispatch loop: admits whenever a submit or release wakes it, until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        admissions: mpsc::UnboundedSender<Admission>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }

            for admission in self.dispatch() {
                tracing::debug!(job_id = %admission.job_id, pool = %admission.class, "Admitted job");
                if admissions.send(admission).is_err() {
                    return;
                }
            }
        }
    }
}

/// Holds an admitted job's slot and gives it back when dropped.
#[derive(Debug)]
pub struct CapacitySlot {
    scheduler: Arc<AdmissionScheduler>,
    job_id: JobId,
}

impl CapacitySlot {
    pub fn new(scheduler: Arc<AdmissionScheduler>, job_id: JobId) -> Self {
        Self { scheduler, job_id }
    }
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.scheduler.release(self.job_id);
    }
}
