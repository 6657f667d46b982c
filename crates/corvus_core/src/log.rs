use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Console,
}

/// One published unit of job output, usually a single line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Strictly increasing and gap-free per job, starting at 0.
    pub seq: u64,
    pub source: LogSource,
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// What a log subscriber observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Chunk(LogChunk),
    /// The subscriber fell further behind than the replay buffer holds; `missed` chunks are gone.
    Gap { missed: u64 },
}
