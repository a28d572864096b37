//! Producer-facing entry buffer.
//!
//! Producers merge term occurrences into a live map guarded by one lock.
//! When the running size estimate passes the configured capacity, the live
//! map is detached as a generation and handed to a dedicated flush worker,
//! so serialization and sink I/O never run under the producer lock.

mod flusher;
mod live;
mod timing;

pub use flusher::FlushReport;
pub use live::Generation;
pub use timing::FlushTimings;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::BufferConfig;
use crate::error::{BufferError, Result};
use crate::metrics::FlushMetrics;
use crate::models::{EntryRef, PageFact, PageStatus, TermPageEntry};
use crate::persistence::{CrawlStateTracker, RecoveryFile};
use crate::sink::BatchSink;

use flusher::{spawn_flusher, FlushShared};
use live::LiveState;

/// What happened to the live entries at shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entries detached from the live map
    pub drained: usize,
    /// Entries written to the recovery file
    pub persisted: usize,
    pub recovery_error: Option<String>,
}

pub struct EntryBuffer {
    live: Mutex<LiveState>,
    shared: Arc<FlushShared>,
    flush_tx: Mutex<Option<Sender<Generation>>>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
    recovery: RecoveryFile,
    tracker: Arc<dyn CrawlStateTracker>,
    metrics: FlushMetrics,
}

impl EntryBuffer {
    /// Create a buffer and start its flush worker.
    pub fn new(
        config: BufferConfig,
        sink: Arc<dyn BatchSink>,
        tracker: Arc<dyn CrawlStateTracker>,
    ) -> Result<Self> {
        let metrics = FlushMetrics::new()?;
        let recovery = RecoveryFile::new(config.recovery_path.clone());
        let shared = Arc::new(FlushShared::new());

        let handles = spawn_flusher(
            sink,
            tracker.clone(),
            recovery.clone(),
            shared.clone(),
            metrics.clone(),
        )?;

        if config.is_enabled() {
            info!(
                "Entry buffer enabled, flushing above {} bytes",
                config.capacity_bytes
            );
        } else {
            info!("Entry buffer disabled, flushing only on request");
        }

        Ok(Self {
            live: Mutex::new(LiveState::new(config.capacity_bytes)),
            shared,
            flush_tx: Mutex::new(Some(handles.tx)),
            flusher: Mutex::new(Some(handles.join)),
            recovery,
            tracker,
            metrics,
        })
    }

    /// Requeue pages whose entries were buffered but never delivered by an
    /// earlier run. Returns how many pages were moved back to `Queued`.
    pub fn start(&self) -> Result<u64> {
        let moved = self
            .tracker
            .advance_status(PageStatus::NotPushed, PageStatus::Queued)?;
        if moved > 0 {
            info!("Requeued {} pages that were never pushed", moved);
        }
        Ok(moved)
    }

    /// Get the buffered entry equal to `entry`, buffering `entry` if there is none.
    pub fn get_or_insert(&self, entry: TermPageEntry) -> Result<EntryRef> {
        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() {
            return Err(BufferError::ShuttingDown);
        }
        let (entry_ref, created) = live.get_or_insert(entry);
        if created {
            self.metrics.record_entry_created();
        }
        self.metrics.set_size_estimate(live.size_estimate());
        Ok(entry_ref)
    }

    /// Get-or-create the entry for (subject, relevance, target) and merge one
    /// position into it, in a single critical section.
    pub fn record_occurrence(
        &self,
        subject: &str,
        relevance: f32,
        target: &str,
        offset: u32,
        fragment: Option<String>,
    ) -> Result<EntryRef> {
        let entry = TermPageEntry::new(subject, relevance, target)?;

        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() {
            return Err(BufferError::ShuttingDown);
        }
        let (entry_ref, created) = live.get_or_insert(entry);
        live.add_position(&entry_ref, offset, fragment);
        if created {
            self.metrics.record_entry_created();
        }
        self.metrics.record_position();
        self.metrics.set_size_estimate(live.size_estimate());
        Ok(entry_ref)
    }

    /// Merge a position into the referenced entry.
    ///
    /// Charges a fixed cost per call, including for an offset already present.
    pub fn add_position(
        &self,
        entry: &EntryRef,
        offset: u32,
        fragment: Option<String>,
    ) -> Result<()> {
        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() {
            return Err(BufferError::ShuttingDown);
        }
        if live.add_position(entry, offset, fragment) {
            self.metrics.record_entry_created();
        }
        self.metrics.record_position();
        self.metrics.set_size_estimate(live.size_estimate());
        Ok(())
    }

    /// Overwrite the title of the referenced entry. Not charged to the estimate.
    pub fn set_title(&self, entry: &EntryRef, title: impl Into<String>) -> Result<()> {
        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() {
            return Err(BufferError::ShuttingDown);
        }
        if live.set_title(entry, title.into()) {
            self.metrics.record_entry_created();
            self.metrics.set_size_estimate(live.size_estimate());
        }
        Ok(())
    }

    pub fn current_size_estimate(&self) -> usize {
        self.live.lock().size_estimate()
    }

    /// Number of distinct entries currently live
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the live entry for `fact`, if it has not been flushed yet
    pub fn snapshot_entry(&self, fact: &PageFact) -> Option<TermPageEntry> {
        self.live.lock().get(fact)
    }

    pub fn capacity(&self) -> usize {
        self.live.lock().capacity()
    }

    pub fn is_enabled(&self) -> bool {
        self.live.lock().is_enabled()
    }

    /// Change the flush threshold. Buffering can not be switched on or off here.
    pub fn set_capacity(&self, capacity_bytes: usize) -> Result<()> {
        let mut live = self.live.lock();
        live.set_capacity(capacity_bytes)?;
        info!("Entry buffer capacity set to {} bytes", capacity_bytes);
        Ok(())
    }

    /// Flush if the estimate is over capacity and nothing is in flight.
    ///
    /// Returns `true` if a generation was dispatched. While a generation is
    /// in flight this is a no-op and producers keep filling the new live map.
    pub fn maybe_flush(&self) -> Result<bool> {
        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() || !live.should_flush() {
            return Ok(false);
        }
        if !self.shared.try_begin() {
            debug!(
                "Flush in flight, keep accumulating ({} bytes live)",
                live.size_estimate()
            );
            return Ok(false);
        }
        self.dispatch(&mut live)?;
        Ok(true)
    }

    /// Flush everything live regardless of capacity. Returns the generation id.
    ///
    /// An empty live map still dispatches a generation so a pending recovery
    /// file gets pushed.
    pub fn flush_now(&self) -> Result<u64> {
        self.shared.check_fatal()?;
        let mut live = self.live.lock();
        if live.is_shutdown() {
            return Err(BufferError::ShuttingDown);
        }
        if !self.shared.try_begin() {
            return Err(BufferError::InvariantViolation(
                "flush requested while another generation is in flight".to_string(),
            ));
        }
        self.dispatch(&mut live)
    }

    /// Capture the live map and hand it to the flush worker.
    ///
    /// Runs under the live lock so shutdown can never drain between capture
    /// and hand-off. `try_send` does not block.
    fn dispatch(&self, live: &mut LiveState) -> Result<u64> {
        let generation = live.take_generation();
        let id = generation.id();
        self.metrics.set_size_estimate(0);

        let result = match self.flush_tx.lock().as_ref() {
            Some(tx) => tx.try_send(generation),
            None => Err(TrySendError::Disconnected(generation)),
        };

        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                let reason = match &e {
                    TrySendError::Full(_) => "flush worker already holds a generation",
                    TrySendError::Disconnected(_) => "flush worker is not running",
                };
                error!("Could not dispatch generation {}: {}", id, reason);
                live.restore(e.into_inner());
                self.metrics.set_size_estimate(live.size_estimate());
                self.shared.finish();
                Err(BufferError::InvariantViolation(reason.to_string()))
            }
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.is_in_flight()
    }

    /// Block until no generation is in flight.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_for_idle(timeout)
    }

    pub fn timings(&self) -> FlushTimings {
        self.shared.timings()
    }

    pub fn last_flush_report(&self) -> Option<FlushReport> {
        self.shared.last_report()
    }

    pub fn metrics(&self) -> &FlushMetrics {
        &self.metrics
    }

    pub fn recovery_path(&self) -> &Path {
        self.recovery.path()
    }

    /// Stop accepting entries and persist everything still live.
    ///
    /// Waits for an in-flight generation to resolve before the recovery file
    /// is written. A failure to write it is logged and reported, not returned.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        let drained = {
            let mut live = self.live.lock();
            if live.is_shutdown() {
                error!("Entry buffer shut down twice");
                return Err(BufferError::InvariantViolation(
                    "shutdown called twice".to_string(),
                ));
            }
            live.begin_shutdown()
        };
        self.metrics.set_size_estimate(0);

        self.stop_flusher();

        let mut report = ShutdownReport {
            drained: drained.len(),
            persisted: 0,
            recovery_error: None,
        };

        match self.recovery.persist(drained.iter()) {
            Ok(persisted) => {
                report.persisted = persisted;
                if persisted > 0 {
                    info!(
                        "Stored {} remaining entries on shutdown to {}",
                        persisted,
                        self.recovery.path().display()
                    );
                }
            }
            Err(e) => {
                error!(
                    "Could not store {} remaining entries on shutdown: {}",
                    drained.len(),
                    e
                );
                report.recovery_error = Some(e.to_string());
            }
        }

        Ok(report)
    }

    fn stop_flusher(&self) {
        drop(self.flush_tx.lock().take());
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                error!("Flush worker panicked");
            }
        }
    }
}

impl Drop for EntryBuffer {
    fn drop(&mut self) {
        self.stop_flusher();
        let live = self.live.get_mut();
        if !live.is_shutdown() && live.len() > 0 {
            warn!(
                "Entry buffer dropped with {} undelivered entries, call shutdown() to keep them",
                live.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageRef;
    use crate::persistence::{decode_entries, MemoryCrawlState};
    use crate::testing::RecordingSink;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup(capacity: usize) -> (TempDir, Arc<RecordingSink>, Arc<MemoryCrawlState>, EntryBuffer) {
        let temp_dir = TempDir::new().unwrap();
        let config = BufferConfig::new(capacity)
            .with_recovery_path(temp_dir.path().join("termbuf.saved.data"));
        let sink = Arc::new(RecordingSink::new());
        let tracker = Arc::new(MemoryCrawlState::new());
        let buffer = EntryBuffer::new(config, sink.clone(), tracker.clone()).unwrap();
        (temp_dir, sink, tracker, buffer)
    }

    #[test]
    fn test_record_occurrence_merges_positions() {
        let (_dir, _sink, _tracker, buffer) = setup(10_000);

        let first = buffer
            .record_occurrence("rust", 1.0, "CHK@page", 3, None)
            .unwrap();
        let second = buffer
            .record_occurrence("rust", 1.0, "CHK@page", 9, Some("fast".to_string()))
            .unwrap();
        buffer.add_position(&first, 3, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(buffer.len(), 1);

        let entry = buffer.snapshot_entry(first.fact()).unwrap();
        let offsets: Vec<u32> = entry.positions().keys().copied().collect();
        assert_eq!(offsets, vec![3, 9]);
        // 8 (target) + 4 (subject) + 3 position charges
        assert_eq!(buffer.current_size_estimate(), 12 + 3 * 4);
    }

    #[test]
    fn test_invalid_target_leaves_buffer_untouched() {
        let (_dir, _sink, _tracker, buffer) = setup(10_000);

        let err = buffer.record_occurrence("rust", 1.0, "  ", 0, None).unwrap_err();
        assert!(matches!(err, BufferError::InvalidFact(_)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.current_size_estimate(), 0);
    }

    #[test]
    fn test_title_updates_not_charged() {
        let (_dir, _sink, _tracker, buffer) = setup(10_000);
        let entry = buffer
            .get_or_insert(TermPageEntry::new("rust", 1.0, "CHK@page").unwrap())
            .unwrap();
        let before = buffer.current_size_estimate();

        buffer.set_title(&entry, "The Rust Book").unwrap();

        assert_eq!(buffer.current_size_estimate(), before);
        assert_eq!(
            buffer.snapshot_entry(entry.fact()).unwrap().title(),
            Some("The Rust Book")
        );
    }

    #[test]
    fn test_maybe_flush_below_capacity_is_noop() {
        let (_dir, sink, _tracker, buffer) = setup(10_000);
        buffer.record_occurrence("rust", 1.0, "CHK@page", 0, None).unwrap();

        assert!(!buffer.maybe_flush().unwrap());
        assert_eq!(buffer.len(), 1);
        assert!(sink.payloads().is_empty());
    }

    #[test]
    fn test_disabled_buffer_flushes_only_on_request() {
        let (_dir, sink, _tracker, buffer) = setup(0);
        assert!(!buffer.is_enabled());

        for offset in 0..1000 {
            buffer.record_occurrence("rust", 1.0, "CHK@page", offset, None).unwrap();
        }
        assert!(!buffer.maybe_flush().unwrap());

        buffer.flush_now().unwrap();
        buffer.wait_for_idle(WAIT).unwrap();
        assert_eq!(sink.payloads().len(), 1);
    }

    #[test]
    fn test_set_capacity() {
        let (_dir, _sink, _tracker, buffer) = setup(100);
        buffer.set_capacity(500).unwrap();
        assert_eq!(buffer.capacity(), 500);
        assert!(matches!(
            buffer.set_capacity(0),
            Err(BufferError::InvalidCapacity { current: 500, requested: 0 })
        ));

        let (_dir, _sink, _tracker, disabled) = setup(0);
        assert!(disabled.set_capacity(100).is_err());
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn test_flush_advances_crawl_state() {
        let (_dir, sink, tracker, buffer) = setup(10);
        let page = PageRef::parse("CHK@page").unwrap();
        tracker.set_status(&page, PageStatus::NotPushed);

        buffer.record_occurrence("rust", 1.0, "CHK@page", 0, None).unwrap();
        assert!(buffer.maybe_flush().unwrap());
        buffer.wait_for_idle(WAIT).unwrap();

        assert_eq!(tracker.status(&page), Some(PageStatus::Succeeded));
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode_entries(&payloads[0]).unwrap().len(), 1);

        let report = buffer.last_flush_report().unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.entries, 1);
        assert!(report.delivered);
        assert_eq!(report.bytes, payloads[0].len());
        assert!(buffer.timings().stalled <= WAIT);
    }

    #[test]
    fn test_start_requeues_unpushed_pages() {
        let (_dir, _sink, tracker, buffer) = setup(10_000);
        let page = PageRef::parse("CHK@page").unwrap();
        let done = PageRef::parse("CHK@done").unwrap();
        tracker.set_status(&page, PageStatus::NotPushed);
        tracker.set_status(&done, PageStatus::Succeeded);

        assert_eq!(buffer.start().unwrap(), 1);
        assert_eq!(tracker.status(&page), Some(PageStatus::Queued));
        assert_eq!(tracker.status(&done), Some(PageStatus::Succeeded));
    }

    #[test]
    fn test_shutdown_twice_and_rejects_producers() {
        let (dir, _sink, _tracker, buffer) = setup(10_000);
        buffer.record_occurrence("rust", 1.0, "CHK@page", 0, None).unwrap();

        let report = buffer.shutdown().unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.persisted, 1);
        assert!(dir.path().join("termbuf.saved.data").exists());

        assert!(matches!(
            buffer.shutdown(),
            Err(BufferError::InvariantViolation(_))
        ));
        assert!(matches!(
            buffer.record_occurrence("rust", 1.0, "CHK@page", 1, None),
            Err(BufferError::ShuttingDown)
        ));
        assert!(matches!(buffer.flush_now(), Err(BufferError::ShuttingDown)));
        assert!(!buffer.maybe_flush().unwrap());
    }

    #[test]
    fn test_empty_shutdown_writes_nothing() {
        let (dir, _sink, _tracker, buffer) = setup(10_000);
        let report = buffer.shutdown().unwrap();
        assert_eq!(report.drained, 0);
        assert_eq!(report.persisted, 0);
        assert!(!dir.path().join("termbuf.saved.data").exists());
    }
}
