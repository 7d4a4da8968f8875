//! Commit log
//!
//! The registry's only durable state is an ordered, append-only log with a
//! single partition. [`CommitLog`] is the seam: appends return the assigned
//! offset, reads long-poll from an offset, and the high-water mark is the
//! offset the next append will receive.
//!
//! Backends:
//! - [`MemoryLog`]: in-process, shareable between nodes through `Arc`
//! - [`FileLog`]: single-segment file with CRC-checked frames

mod file;
mod memory;

pub use file::FileLog;
pub use memory::MemoryLog;

use crate::config::{LogBackend, LogConfig};
use crate::error::SchemaResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A record as stored in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    /// Append time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Ordered, append-only record log
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Topic name
    fn topic(&self) -> &str;

    /// Append a record, returning its offset
    async fn append(&self, key: Option<Bytes>, value: Bytes) -> SchemaResult<u64>;

    /// Read up to `max_records` starting at `from`.
    ///
    /// When nothing is available, waits up to `max_wait` for an append and
    /// returns an empty batch if none arrives.
    async fn read(&self, from: u64, max_records: usize, max_wait: Duration) -> SchemaResult<Vec<LogRecord>>;

    /// Offset the next append will receive
    async fn high_watermark(&self) -> SchemaResult<u64>;
}

/// Open the backend named in `config`
pub async fn open(config: &LogConfig) -> SchemaResult<Arc<dyn CommitLog>> {
    match &config.backend {
        LogBackend::Memory => Ok(Arc::new(MemoryLog::new(config.topic.clone()))),
        LogBackend::File {
            path,
            sync_on_append,
        } => Ok(Arc::new(
            FileLog::open(path, config.topic.clone(), *sync_on_append).await?,
        )),
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
