//! Registry log reader
//!
//! The only writer of [`RegistryState`]. A single task consumes the log from
//! offset 0 in order, decodes each [`MutationRecord`] and applies it.
//!
//! ```text
//!   CatchingUp ──(reached high-water mark seen at start)──> Ready
//!        │                                                    │
//!        └──────────────(invariant violation)────> Failed <───┘
//! ```
//!
//! Transient read errors are retried with exponential backoff. An invariant
//! violation stops the reader for good: nothing after the bad record is
//! applied and every waiter is released with the corruption error.
//!
//! Read-your-writes waits are one-shot channels keyed by offset, completed
//! as soon as the record at that offset has been applied.

use crate::config::LogConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::log::{CommitLog, LogRecord};
use crate::record::MutationRecord;
use crate::state::RegistryState;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::RegistryMetrics;

/// Reader lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderState {
    /// Replaying up to the high-water mark observed at start
    CatchingUp,
    /// Caught up; keeps applying new records
    Ready,
    /// Stopped on an invariant violation
    Failed { offset: u64, reason: String },
}

impl ReaderState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReaderState::Ready)
    }

    fn error(&self) -> Option<SchemaError> {
        match self {
            ReaderState::Failed { offset, reason } => Some(SchemaError::LogCorruption {
                offset: *offset,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

type Waiters = BTreeMap<u64, Vec<oneshot::Sender<()>>>;

/// Consumes the registry log into [`RegistryState`]
pub struct LogReader {
    log: Arc<dyn CommitLog>,
    config: LogConfig,
    state: RwLock<RegistryState>,
    /// Next offset to apply
    next_offset: AtomicU64,
    status: watch::Sender<ReaderState>,
    waiters: Mutex<Waiters>,
    shutdown: broadcast::Sender<()>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<RegistryMetrics>>,
}

impl LogReader {
    pub fn new(log: Arc<dyn CommitLog>, config: LogConfig) -> Self {
        let (status, _) = watch::channel(ReaderState::CatchingUp);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            log,
            config,
            state: RwLock::new(RegistryState::new()),
            next_offset: AtomicU64::new(0),
            status,
            waiters: Mutex::new(BTreeMap::new()),
            shutdown,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<RegistryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the consumption task
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reader = self.clone();
        tokio::spawn(async move { reader.run().await })
    }

    /// Stop the consumption task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn status(&self) -> ReaderState {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReaderState> {
        self.status.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().is_ready()
    }

    /// Offset of the next record to apply
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::SeqCst)
    }

    /// Run `f` against a consistent view of the state
    pub fn read<R>(&self, f: impl FnOnce(&RegistryState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn snapshot(&self) -> RegistryState {
        self.state.read().clone()
    }

    /// Wait until the reader is `Ready`.
    ///
    /// Fails with `NotReady` after `timeout`, or with the corruption error if
    /// the reader has stopped.
    pub async fn wait_until_ready(&self, timeout: Duration) -> SchemaResult<()> {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, ReaderState::CatchingUp)),
        )
        .await;

        match waited {
            Ok(Ok(state)) => state.error().map_or(Ok(()), Err),
            Ok(Err(_)) => Err(SchemaError::Internal("log reader dropped".to_string())),
            Err(_) => Err(SchemaError::NotReady(format!(
                "log reader still catching up at offset {}",
                self.next_offset()
            ))),
        }
    }

    /// Wait until the record at `offset` has been applied
    pub async fn wait_for_offset(&self, offset: u64, timeout: Duration) -> SchemaResult<()> {
        let rx = {
            let mut waiters = self.waiters.lock();
            if self.next_offset() > offset {
                return Ok(());
            }
            if let Some(err) = self.status.borrow().error() {
                return Err(err);
            }
            let (tx, rx) = oneshot::channel();
            waiters.entry(offset).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self
                .status
                .borrow()
                .error()
                .unwrap_or_else(|| SchemaError::Internal("log reader stopped".to_string()))),
            Err(_) => Err(SchemaError::Timeout(format!(
                "offset {} not applied within {:?}",
                offset, timeout
            ))),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut target = None;
        let mut backoff = self.config.retry_backoff();
        info!(topic = %self.log.topic(), "Log reader starting");

        loop {
            let result = tokio::select! {
                result = self.poll(&mut target) => result,
                _ = shutdown.recv() => {
                    info!(topic = %self.log.topic(), "Log reader shutting down");
                    break;
                }
            };

            match result {
                Ok(()) => backoff = self.config.retry_backoff(),
                Err(e) if e.is_fatal() => {
                    self.fail(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        topic = %self.log.topic(),
                        offset = self.next_offset(),
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Log read failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => break,
                    }
                    backoff = (backoff * 2).min(self.config.max_retry_backoff());
                }
            }
        }
    }

    /// Read and apply one batch
    async fn poll(&self, target: &mut Option<u64>) -> SchemaResult<()> {
        let target_offset = match *target {
            Some(t) => t,
            None => {
                let hw = self.log.high_watermark().await?;
                info!(topic = %self.log.topic(), high_watermark = hw, "Catching up");
                *target = Some(hw);
                hw
            }
        };

        let ready = self.is_ready();
        if !ready && self.next_offset() >= target_offset {
            self.mark_ready();
            return Ok(());
        }

        let wait = if ready {
            self.config.poll_wait()
        } else {
            Duration::ZERO
        };
        let records = self
            .log
            .read(self.next_offset(), self.config.batch_size, wait)
            .await?;
        for record in records {
            self.apply_record(record)?;
        }

        if !ready && self.next_offset() >= target_offset {
            self.mark_ready();
        }
        Ok(())
    }

    fn apply_record(&self, record: LogRecord) -> SchemaResult<()> {
        let offset = record.offset;
        let expected = self.next_offset();
        if offset != expected {
            return Err(SchemaError::LogCorruption {
                offset,
                reason: format!("expected record at offset {}", expected),
            });
        }

        let decoded = MutationRecord::decode(offset, &record.value)?;
        let op = decoded.op;
        match decoded.into_mutation(offset)? {
            Some(mutation) => {
                let mut state = self.state.write();
                state.apply(offset, mutation)?;
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_applied(op.as_str(), offset);
                    metrics.set_schemas_count(state.schema_count());
                    metrics.set_subjects_count(state.subjects(false).len());
                }
            }
            None => warn!(offset, "Skipping record with unknown operation"),
        }
        debug!(offset, op = op.as_str(), "Applied log record");

        self.next_offset.store(offset + 1, Ordering::SeqCst);
        self.notify(offset);
        Ok(())
    }

    fn notify(&self, applied: u64) {
        let done = {
            let mut waiters = self.waiters.lock();
            let pending = waiters.split_off(&(applied + 1));
            std::mem::replace(&mut *waiters, pending)
        };
        for tx in done.into_values().flatten() {
            let _ = tx.send(());
        }
    }

    fn mark_ready(&self) {
        info!(
            topic = %self.log.topic(),
            offset = self.next_offset(),
            "Log reader ready"
        );
        self.status.send_replace(ReaderState::Ready);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.set_reader_ready(true);
        }
    }

    fn fail(&self, err: SchemaError) {
        let (offset, reason) = match err {
            SchemaError::LogCorruption { offset, reason } => (offset, reason),
            other => (self.next_offset(), other.to_string()),
        };
        error!(
            topic = %self.log.topic(),
            offset,
            reason = %reason,
            "Log invariant violated, reader halted"
        );
        self.status.send_replace(ReaderState::Failed { offset, reason });
        // Dropping the senders releases every waiter with the failure
        self.waiters.lock().clear();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.set_reader_ready(false);
        }
    }
}
