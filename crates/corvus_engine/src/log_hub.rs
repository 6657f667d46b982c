//! Per-job replayable output channels.
//!
//! Every channel owns a bounded ring of [`LogChunk`]s. Subscribers are cursors into that ring and
//! sleep on a [`watch`] signal between publishes, so a slow subscriber never holds back the
//! publisher or any other subscriber. A subscriber that falls behind the ring observes a
//! [`LogEvent::Gap`] and continues at the oldest retained chunk.

use crate::sync::{lock, read, write};

use chrono::Utc;
use corvus_core::prelude::*;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

#[derive(Debug)]
struct ChannelState {
    buffer: VecDeque<LogChunk>,
    next_seq: u64,
    closed: bool,
}

impl ChannelState {
    fn oldest_seq(&self) -> u64 {
        self.next_seq - self.buffer.len() as u64
    }
}

#[derive(Debug)]
struct Channel {
    state: Mutex<ChannelState>,
    changed: watch::Sender<()>,
}

#[derive(Debug)]
pub struct LogHub {
    channels: RwLock<HashMap<JobId, Arc<Channel>>>,
    capacity: usize,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Opens the channel for a job. Reopening an existing channel keeps it as is.
    pub fn open_channel(&self, job_id: JobId) {
        write(&self.channels).entry(job_id).or_insert_with(|| {
            let (changed, _) = watch::channel(());
            Arc::new(Channel {
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::with_capacity(self.capacity.min(64)),
                    next_seq: 0,
                    closed: false,
                }),
                changed,
            })
        });
    }

    fn channel(&self, job_id: JobId) -> Result<Arc<Channel>, LogHubError> {
        read(&self.channels)
            .get(&job_id)
            .cloned()
            .ok_or(LogHubError::NotFound(job_id))
    }

    /// Appends a chunk and wakes the subscribers. Returns the chunk's sequence number.
    pub fn publish(
        &self,
        job_id: JobId,
        source: LogSource,
        data: impl Into<String>,
    ) -> Result<u64, LogHubError> {
        let channel = self.channel(job_id)?;
        let seq = {
            let mut state = lock(&channel.state);
            if state.closed {
                return Err(LogHubError::Closed(job_id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.buffer.push_back(LogChunk {
                seq,
                source,
                timestamp: Utc::now(),
                data: data.into(),
            });
            if state.buffer.len() > self.capacity {
                state.buffer.pop_front();
            }
            seq
        };
        channel.changed.send_replace(());
        Ok(seq)
    }

    /// Replays the retained history, then follows live chunks until the channel closes.
    pub fn subscribe(&self, job_id: JobId) -> Result<LogSubscription, LogHubError> {
        let channel = self.channel(job_id)?;
        let changes = channel.changed.subscribe();
        Ok(LogSubscription {
            channel,
            cursor: 0,
            changes,
        })
    }

    /// Ends every subscription once it has caught up. Closing twice is a no-op.
    pub fn close(&self, job_id: JobId) -> Result<(), LogHubError> {
        let channel = self.channel(job_id)?;
        lock(&channel.state).closed = true;
        channel.changed.send_replace(());
        Ok(())
    }

    /// Drops a channel. Subscribers still attached drain what is buffered and end.
    pub fn remove(&self, job_id: JobId) -> bool {
        let Some(channel) = write(&self.channels).remove(&job_id) else {
            return false;
        };
        lock(&channel.state).closed = true;
        channel.changed.send_replace(());
        true
    }

    pub fn is_closed(&self, job_id: JobId) -> Result<bool, LogHubError> {
        let channel = self.channel(job_id)?;
        let closed = lock(&channel.state).closed;
        Ok(closed)
    }

    pub fn channel_count(&self) -> usize {
        read(&self.channels).len()
    }
}

/// A cursor over one job's channel.
#[derive(Debug)]
pub struct LogSubscription {
    channel: Arc<Channel>,
    cursor: u64,
    changes: watch::Receiver<()>,
}

impl LogSubscription {
    /// The next event, or [`None`] after the channel closed and everything was delivered.
    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            // Marked seen before inspecting the state so a publish in between still wakes us.
            self.changes.borrow_and_update();

            {
                let state = lock(&self.channel.state);
                let oldest = state.oldest_seq();
                if self.cursor < oldest {
                    let missed = oldest - self.cursor;
                    self.cursor = oldest;
                    return Some(LogEvent::Gap { missed });
                }
                if self.cursor < state.next_seq {
                    let chunk = state.buffer[(self.cursor - oldest) as usize].clone();
                    self.cursor += 1;
                    return Some(LogEvent::Chunk(chunk));
                }
                if state.closed {
                    return None;
                }
            }

            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, LogEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn chunk_seqs(events: &[LogEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Chunk(c) => Some(c.seq),
                LogEvent::Gap { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn late_subscriber_gets_history_then_live() {
        let hub = LogHub::new(100);
        let job = Uuid::new_v4();
        hub.open_channel(job);
        for i in 0..5 {
            hub.publish(job, LogSource::Stdout, format!("line {i}")).unwrap();
        }

        let sub = hub.subscribe(job).unwrap();
        let collector = tokio::spawn(sub.into_stream().collect::<Vec<_>>());

        tokio::time::sleep(Duration::from_millis(10)).await;
        for i in 5..8 {
            hub.publish(job, LogSource::Stderr, format!("line {i}")).unwrap();
        }
        hub.close(job).unwrap();

        let events = collector.await.unwrap();
        assert_eq!(chunk_seqs(&events), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let hub = LogHub::new(10);
        let job = Uuid::new_v4();
        hub.open_channel(job);
        let mut a = hub.subscribe(job).unwrap();
        let b = hub.subscribe(job).unwrap();

        hub.publish(job, LogSource::Stdout, "x").unwrap();
        hub.publish(job, LogSource::Stdout, "y").unwrap();
        hub.close(job).unwrap();

        let Some(LogEvent::Chunk(first)) = a.next().await else {
            panic!("expected a chunk");
        };
        assert_eq!(first.data, "x");
        drop(a);

        let events: Vec<_> = b.into_stream().collect().await;
        assert_eq!(chunk_seqs(&events), vec![0, 1]);
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_a_gap() {
        let hub = LogHub::new(3);
        let job = Uuid::new_v4();
        hub.open_channel(job);
        let sub = hub.subscribe(job).unwrap();

        for i in 0..10 {
            hub.publish(job, LogSource::Stdout, i.to_string()).unwrap();
        }
        hub.close(job).unwrap();

        let events: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(events[0], LogEvent::Gap { missed: 7 });
        assert_eq!(chunk_seqs(&events), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let hub = LogHub::new(3);
        let job = Uuid::new_v4();
        hub.open_channel(job);
        hub.close(job).unwrap();
        hub.close(job).unwrap();

        assert_eq!(
            hub.publish(job, LogSource::Stdout, "late"),
            Err(LogHubError::Closed(job))
        );
        assert!(hub.is_closed(job).unwrap());
    }

    #[tokio::test]
    async fn unknown_channel() {
        let hub = LogHub::new(3);
        let job = Uuid::new_v4();
        assert!(matches!(hub.subscribe(job), Err(LogHubError::NotFound(_))));
        assert_eq!(
            hub.publish(job, LogSource::Console, "x"),
            Err(LogHubError::NotFound(job))
        );
    }

    #[tokio::test]
    async fn remove_ends_attached_subscribers() {
        let hub = LogHub::new(3);
        let job = Uuid::new_v4();
        hub.open_channel(job);
        hub.publish(job, LogSource::Stdout, "only").unwrap();
        let mut sub = hub.subscribe(job).unwrap();

        assert!(hub.remove(job));
        assert!(!hub.remove(job));
        assert_eq!(hub.channel_count(), 0);

        assert!(matches!(sub.next().await, Some(LogEvent::Chunk(_))));
        assert_eq!(sub.next().await, None);
    }
}
