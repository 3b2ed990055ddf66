//! Offline retry buffer for readings that could not reach the ingestion sink.
//!
//! Entries are kept in submission order and, when a path is configured,
//! mirrored to a JSON file after every change so they survive a restart.
//! An entry leaves the queue only after a confirmed resend. When the file
//! cannot be written the in-memory queue stays authoritative and the next
//! flush pass writes it again.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::{IngestError, ReadingSink};
use crate::reading::{NewReading, Reading};

/// A flush pass stops after this many failures in a row.
pub const MAX_CONSECUTIVE_FAILURES: usize = 3;

/// A reading waiting to be resent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedReading {
    /// Client-local enqueue time in milliseconds, unique within one buffer
    pub queued_at: i64,

    pub reading: NewReading,
}

/// A buffered reading the sink refused for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedReading {
    pub entry: BufferedReading,
    pub error: String,
}

/// Errors that can occur while persisting the buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("cannot access offline buffer file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offline buffer file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Entries moved to the rejected list during this pass
    pub rejected: usize,
    pub failures: usize,
    /// Entries still queued after the pass
    pub pending: usize,
    /// The pass hit the consecutive failure limit
    pub aborted: bool,
}

/// Running totals since the buffer was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub enqueued: u64,
    pub resent: u64,
    pub rejected: u64,
    pub flush_passes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BufferState {
    #[serde(default)]
    pending: VecDeque<BufferedReading>,

    #[serde(default)]
    rejected: Vec<RejectedReading>,

    #[serde(skip)]
    last_queued_at: i64,

    #[serde(skip)]
    stats: BufferStats,

    /// The file is behind the in-memory queue
    #[serde(skip)]
    dirty: bool,
}

/// Durable FIFO of readings that failed to reach the sink.
pub struct OfflineBuffer {
    state: Mutex<BufferState>,
    path: Option<PathBuf>,
    // Serializes flush passes so an entry is never resent twice
    flush_lock: tokio::sync::Mutex<()>,
}

impl OfflineBuffer {
    /// Buffer that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            path: None,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a file-backed buffer, loading any entries left by a previous run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BufferError> {
        let path = path.into();

        let mut state = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BufferState::default(),
            Ok(raw) => serde_json::from_str::<BufferState>(&raw).map_err(|source| BufferError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BufferState::default(),
            Err(source) => return Err(BufferError::Io { path, source }),
        };

        state.last_queued_at = state
            .pending
            .iter()
            .map(|entry| entry.queued_at)
            .chain(state.rejected.iter().map(|r| r.entry.queued_at))
            .max()
            .unwrap_or(0);

        if !state.pending.is_empty() {
            info!(
                path = %path.display(),
                pending = state.pending.len(),
                "Loaded offline readings from previous run"
            );
        }

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a reading, stamping it with a unique local timestamp.
    pub fn enqueue(&self, reading: NewReading) -> Result<BufferedReading, BufferError> {
        let mut state = self.state.lock();

        // Millisecond clock, bumped when two entries land in the same tick
        let queued_at = Utc::now().timestamp_millis().max(state.last_queued_at + 1);
        state.last_queued_at = queued_at;

        let entry = BufferedReading { queued_at, reading };
        state.pending.push_back(entry.clone());
        state.stats.enqueued += 1;

        debug!(queued_at, pending = state.pending.len(), "Reading stored offline");
        self.persist(&mut state)?;
        Ok(entry)
    }

    /// Copy of the queued entries in order.
    pub fn pending(&self) -> Vec<BufferedReading> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Entries the sink refused with a non-transient error.
    pub fn rejected(&self) -> Vec<RejectedReading> {
        self.state.lock().rejected.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.state.lock().stats.clone()
    }

    /// Whether the last write of the buffer file failed.
    pub fn has_unsaved_changes(&self) -> bool {
        self.state.lock().dirty
    }

    /// Resend queued readings in order through `sink`.
    ///
    /// Each confirmed resend removes exactly that entry. Transient failures
    /// leave entries in place; more than [`MAX_CONSECUTIVE_FAILURES`] in a
    /// row end the pass. Validation and not-found rejections move the entry
    /// to the rejected list.
    ///
    /// A failed file write never puts a resent entry back in the queue. The
    /// pass keeps going and the error is returned once the final write has
    /// failed as well.
    pub async fn flush<S>(&self, sink: &S) -> Result<FlushReport, BufferError>
    where
        S: ReadingSink + ?Sized,
    {
        let _pass = self.flush_lock.lock().await;
        let snapshot = self.pending();
        let mut report = FlushReport::default();

        if snapshot.is_empty() {
            self.persist_if_dirty()?;
            return Ok(report);
        }

        debug!(pending = snapshot.len(), "Resending offline readings");
        let mut consecutive_failures = 0;

        for entry in snapshot {
            match sink.submit(entry.reading.clone()).await {
                Ok(_) => {
                    consecutive_failures = 0;
                    report.sent += 1;
                    self.remove(entry.queued_at, None);
                }
                Err(e) if e.is_transient() || matches!(e, IngestError::Internal(_)) => {
                    consecutive_failures += 1;
                    report.failures += 1;
                    warn!(
                        error = %e,
                        queued_at = entry.queued_at,
                        consecutive_failures,
                        "Offline resend failed"
                    );
                    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                        report.aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!(error = %e, queued_at = entry.queued_at, "Offline reading rejected by sink");
                    self.remove(entry.queued_at, Some(e.to_string()));
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.stats.flush_passes += 1;
            report.pending = state.pending.len();
        }

        if report.sent > 0 || report.rejected > 0 {
            info!(
                sent = report.sent,
                rejected = report.rejected,
                pending = report.pending,
                "Offline readings processed"
            );
        }

        self.persist_if_dirty()?;
        Ok(report)
    }

    /// Drop the entry with `queued_at`, recording it as rejected when `error` is set.
    fn remove(&self, queued_at: i64, error: Option<String>) {
        let mut state = self.state.lock();
        let Some(index) = state.pending.iter().position(|e| e.queued_at == queued_at) else {
            return;
        };

        if let Some(entry) = state.pending.remove(index) {
            match error {
                Some(error) => {
                    state.stats.rejected += 1;
                    state.rejected.push(RejectedReading { entry, error });
                }
                None => state.stats.resent += 1,
            }
        }

        if let Err(e) = self.persist(&mut state) {
            warn!(error = %e, queued_at, "Offline buffer file not updated, will retry");
        }
    }

    fn persist_if_dirty(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        self.persist(&mut state)?;
        debug!(pending = state.pending.len(), "Offline buffer file caught up");
        Ok(())
    }

    /// Write the whole state, tracking whether the file is behind memory.
    fn persist(&self, state: &mut BufferState) -> Result<(), BufferError> {
        let result = self.write_file(state);
        state.dirty = result.is_err();
        result
    }

    fn write_file(&self, state: &BufferState) -> Result<(), BufferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(state).map_err(|source| BufferError::Corrupt {
            path: path.clone(),
            source,
        })?;

        // Write then rename so a crash never leaves a half-written file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| BufferError::Io {
                path: path.clone(),
                source,
            })
    }
}

/// What happened to a reading handed to a [`BufferedSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Stored(Reading),
    Buffered(BufferedReading),
}

/// Wraps a sink so transient failures land in the offline buffer.
pub struct BufferedSink<S> {
    inner: S,
    buffer: Arc<OfflineBuffer>,
}

impl<S: ReadingSink> BufferedSink<S> {
    pub fn new(inner: S, buffer: Arc<OfflineBuffer>) -> Self {
        Self { inner, buffer }
    }

    pub fn buffer(&self) -> &Arc<OfflineBuffer> {
        &self.buffer
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Submit, buffering the reading if the sink is unreachable.
    pub async fn deliver(&self, reading: NewReading) -> Result<Delivery, IngestError> {
        match self.inner.submit(reading.clone()).await {
            Ok(stored) => Ok(Delivery::Stored(stored)),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Sink unavailable, buffering reading offline");
                let entry = self
                    .buffer
                    .enqueue(reading)
                    .map_err(|err| IngestError::Internal(err.to_string()))?;
                Ok(Delivery::Buffered(entry))
            }
            Err(e) => Err(e),
        }
    }

    /// Resend everything in the buffer through the wrapped sink.
    pub async fn flush(&self) -> Result<FlushReport, BufferError> {
        self.buffer.flush(&self.inner).await
    }
}

/// Outcome reported to simulation loops: a buffered reading counts as handled.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, reading: NewReading) -> Result<Delivery, IngestError>;
}

#[async_trait]
impl<S: ReadingSink> DeliverySink for BufferedSink<S> {
    async fn deliver(&self, reading: NewReading) -> Result<Delivery, IngestError> {
        BufferedSink::deliver(self, reading).await
    }
}

/// Any plain sink delivers without buffering.
pub struct Unbuffered<S>(pub S);

#[async_trait]
impl<S: ReadingSink> DeliverySink for Unbuffered<S> {
    async fn deliver(&self, reading: NewReading) -> Result<Delivery, IngestError> {
        self.0.submit(reading).await.map(Delivery::Stored)
    }
}

/// Periodically flush `buffer` through `sink` until `cancel` fires.
pub async fn run_flush_loop<S>(
    buffer: Arc<OfflineBuffer>,
    sink: S,
    flush_interval: Duration,
    cancel: CancellationToken,
) where
    S: ReadingSink,
{
    let mut ticker = tokio::time::interval(flush_interval);
    // The first tick completes immediately; resend leftovers right away
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Offline flush loop stopping");
                break;
            }
            _ = ticker.tick() => {
                if buffer.is_empty() && !buffer.has_unsaved_changes() {
                    continue;
                }
                match buffer.flush(&sink).await {
                    Ok(report) if report.aborted => {
                        warn!(pending = report.pending, "Offline flush aborted after repeated failures");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to persist offline buffer"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{new_reading_id, ReadingKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sink that records accepted readings and fails while `down` is set.
    ///
    /// Queued `script` outcomes take precedence: `true` accepts, `false` fails.
    #[derive(Default)]
    struct FlakySink {
        down: AtomicBool,
        calls: AtomicUsize,
        accepted: Mutex<Vec<NewReading>>,
        script: Mutex<VecDeque<bool>>,
    }

    #[async_trait]
    impl ReadingSink for FlakySink {
        async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let up = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| !self.down.load(Ordering::SeqCst));
            if !up {
                return Err(IngestError::StorageUnavailable("down".to_string()));
            }
            if reading.valor.unwrap_or_default() > 100.0 {
                return Err(IngestError::Validation("out of range".to_string()));
            }
            self.accepted.lock().push(reading.clone());
            Ok(Reading {
                id: new_reading_id(),
                sensor_id: reading.sensor_id.unwrap_or_default(),
                fecha_hora: Utc::now(),
                tipo: ReadingKind::Humidity,
                valor: reading.valor.unwrap_or_default(),
                unidad: "%".to_string(),
            })
        }
    }

    fn humidity(valor: f64) -> NewReading {
        NewReading::new("s1", ReadingKind::Humidity, valor)
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("offline-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_enqueue_assigns_unique_increasing_timestamps() {
        let buffer = OfflineBuffer::in_memory();
        let stamps: Vec<i64> = (0..50)
            .map(|i| buffer.enqueue(humidity(i as f64)).unwrap().queued_at)
            .collect();

        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(buffer.len(), 50);
        assert_eq!(buffer.stats().enqueued, 50);
    }

    #[tokio::test]
    async fn test_flush_resends_in_order_and_empties() {
        let buffer = OfflineBuffer::in_memory();
        for valor in [10.0, 20.0, 30.0] {
            buffer.enqueue(humidity(valor)).unwrap();
        }
        let sink = FlakySink::default();

        let report = buffer.flush(&sink).await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(report.pending, 0);
        assert!(buffer.is_empty());

        let values: Vec<f64> = sink.accepted.lock().iter().filter_map(|r| r.valor).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
    }

    #[tokio::test]
    async fn test_flush_aborts_after_consecutive_failures() {
        let buffer = OfflineBuffer::in_memory();
        for i in 0..10 {
            buffer.enqueue(humidity(i as f64)).unwrap();
        }
        let sink = FlakySink::default();
        sink.down.store(true, Ordering::SeqCst);

        let report = buffer.flush(&sink).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.failures, MAX_CONSECUTIVE_FAILURES + 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES + 1);
        assert_eq!(buffer.len(), 10);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let buffer = OfflineBuffer::in_memory();
        for i in 0..10 {
            buffer.enqueue(humidity(i as f64)).unwrap();
        }
        let sink = FlakySink::default();
        sink.script
            .lock()
            .extend([false, false, false, true, false, false, false, false]);

        let report = buffer.flush(&sink).await.unwrap();

        // Three failures stay under the limit, the success starts a new streak
        assert_eq!(sink.calls.load(Ordering::SeqCst), 8);
        assert_eq!(report.sent, 1);
        assert_eq!(report.failures, 7);
        assert!(report.aborted);
        assert_eq!(report.pending, 9);
        assert_eq!(sink.accepted.lock()[0].valor, Some(3.0));
    }

    #[tokio::test]
    async fn test_rejected_entries_do_not_block_queue() {
        let buffer = OfflineBuffer::in_memory();
        buffer.enqueue(humidity(150.0)).unwrap();
        buffer.enqueue(humidity(55.0)).unwrap();
        let sink = FlakySink::default();

        let report = buffer.flush(&sink).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.rejected, 1);
        assert!(buffer.is_empty());

        let rejected = buffer.rejected();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].entry.reading.valor, Some(150.0));
    }

    #[tokio::test]
    async fn test_buffered_sink_outage_then_recovery_stores_once() {
        let buffer = Arc::new(OfflineBuffer::in_memory());
        let sink = BufferedSink::new(FlakySink::default(), buffer.clone());
        sink.inner().down.store(true, Ordering::SeqCst);

        let delivery = sink.deliver(humidity(42.0)).await.unwrap();
        assert!(matches!(delivery, Delivery::Buffered(_)));
        assert_eq!(buffer.len(), 1);

        sink.inner().down.store(false, Ordering::SeqCst);
        let report = sink.flush().await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(buffer.is_empty());

        // A second pass has nothing left to send
        let report = sink.flush().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(sink.inner().accepted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_buffered_sink_passes_validation_errors_through() {
        let buffer = Arc::new(OfflineBuffer::in_memory());
        let sink = BufferedSink::new(FlakySink::default(), buffer.clone());

        let err = sink.deliver(humidity(150.0)).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_send_each_entry_once() {
        let buffer = Arc::new(OfflineBuffer::in_memory());
        for i in 0..20 {
            buffer.enqueue(humidity(i as f64)).unwrap();
        }
        let sink = Arc::new(FlakySink::default());

        let a = {
            let (buffer, sink) = (buffer.clone(), sink.clone());
            tokio::spawn(async move { buffer.flush(&sink).await.unwrap().sent })
        };
        let b = {
            let (buffer, sink) = (buffer.clone(), sink.clone());
            tokio::spawn(async move { buffer.flush(&sink).await.unwrap().sent })
        };

        let sent = a.await.unwrap() + b.await.unwrap();
        assert_eq!(sent, 20);
        assert_eq!(sink.accepted.lock().len(), 20);
    }

    #[test]
    fn test_file_backed_buffer_survives_reopen() {
        let path = temp_path();
        {
            let buffer = OfflineBuffer::open(&path).unwrap();
            buffer.enqueue(humidity(1.0)).unwrap();
            buffer.enqueue(humidity(2.0)).unwrap();
        }

        let reopened = OfflineBuffer::open(&path).unwrap();
        let pending = reopened.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].reading.valor, Some(1.0));

        // New entries keep sorting after the loaded ones
        let next = reopened.enqueue(humidity(3.0)).unwrap();
        assert!(next.queued_at > pending[1].queued_at);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_failed_write_does_not_resend_after_restart() {
        let dir = std::env::temp_dir().join(format!("offline-dir-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        let path = dir.join("offline.json");

        let buffer = OfflineBuffer::open(&path).unwrap();
        buffer.enqueue(humidity(1.0)).unwrap();
        buffer.enqueue(humidity(2.0)).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        let sink = FlakySink::default();

        // Both readings go out even though the file cannot be rewritten
        let result = buffer.flush(&sink).await;
        assert!(matches!(result, Err(BufferError::Io { .. })));
        assert!(buffer.is_empty());
        assert!(buffer.has_unsaved_changes());
        assert_eq!(sink.accepted.lock().len(), 2);

        assert!(buffer.flush(&sink).await.is_err());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        // Once the directory is back the file catches up with memory
        std::fs::create_dir(&dir).unwrap();
        let report = buffer.flush(&sink).await.unwrap();
        assert_eq!(report.sent, 0);
        assert!(!buffer.has_unsaved_changes());

        let reopened = OfflineBuffer::open(&path).unwrap();
        assert!(reopened.is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_file_reported() {
        let path = temp_path();
        std::fs::write(&path, "not json").unwrap();

        let result = OfflineBuffer::open(&path);
        assert!(matches!(result, Err(BufferError::Corrupt { .. })));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_flush_loop_drains_buffer_and_stops() {
        let buffer = Arc::new(OfflineBuffer::in_memory());
        buffer.enqueue(humidity(5.0)).unwrap();
        let sink = Arc::new(FlakySink::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_flush_loop(
            buffer.clone(),
            sink.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(buffer.is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("flush loop should stop")
            .unwrap();
    }
}
