//! In-memory commit log for testing and development

use super::{now_millis, CommitLog, LogRecord};
use crate::error::{SchemaError, SchemaResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// In-memory log
///
/// Several registry nodes can share one instance through `Arc`, which makes
/// it a stand-in for a replicated topic in multi-node tests.
pub struct MemoryLog {
    topic: String,
    records: RwLock<Vec<LogRecord>>,
    /// Publishes the high-water mark after every append
    appended: watch::Sender<u64>,
    /// Upcoming reads that fail with a transient error
    fail_reads: AtomicU32,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            topic: topic.into(),
            records: RwLock::new(Vec::new()),
            appended,
            fail_reads: AtomicU32::new(0),
        }
    }

    /// Make the next `count` reads fail with [`SchemaError::Log`]
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All records, for inspection
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.read().clone()
    }

    /// Append with an explicit timestamp; used when replaying a file into the cache
    pub(crate) fn push(&self, timestamp: i64, key: Option<Bytes>, value: Bytes) -> u64 {
        let offset = {
            let mut records = self.records.write();
            let offset = records.len() as u64;
            records.push(LogRecord {
                offset,
                timestamp,
                key,
                value,
            });
            offset
        };
        self.appended.send_replace(offset + 1);
        offset
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn slice(&self, from: u64, max_records: usize) -> Vec<LogRecord> {
        let records = self.records.read();
        let start = (from as usize).min(records.len());
        let end = start.saturating_add(max_records).min(records.len());
        records[start..end].to_vec()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new("_schemas")
    }
}

#[async_trait]
impl CommitLog for MemoryLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn append(&self, key: Option<Bytes>, value: Bytes) -> SchemaResult<u64> {
        Ok(self.push(now_millis(), key, value))
    }

    async fn read(&self, from: u64, max_records: usize, max_wait: Duration) -> SchemaResult<Vec<LogRecord>> {
        if self.take_injected_failure() {
            return Err(SchemaError::Log(format!(
                "{}: injected read failure",
                self.topic
            )));
        }

        // Subscribe before looking so an append in between is not missed
        let mut appended = self.appended.subscribe();
        let batch = self.slice(from, max_records);
        if !batch.is_empty() || max_wait.is_zero() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(max_wait, appended.wait_for(|hw| *hw > from)).await;
        Ok(self.slice(from, max_records))
    }

    async fn high_watermark(&self) -> SchemaResult<u64> {
        Ok(self.records.read().len() as u64)
    }
}
