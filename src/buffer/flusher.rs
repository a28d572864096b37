use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::live::Generation;
use super::timing::{FlushClock, FlushTimings};
use crate::error::{BufferError, Result};
use crate::metrics::FlushMetrics;
use crate::models::PageStatus;
use crate::persistence::{encode_entries, CrawlStateTracker, RecoveryFile};
use crate::sink::BatchSink;

/// Outcome of one flush generation, including its recovery step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushReport {
    pub generation: u64,
    pub entries: usize,
    /// Serialized payload size, 0 when nothing was pushed
    pub bytes: usize,
    /// Whether the sink accepted the fresh generation
    pub delivered: bool,
    /// Entries restored from a recovery file during this flush
    pub recovered_entries: Option<usize>,
}

/// State shared between the buffer and its flush worker.
pub(crate) struct FlushShared {
    in_flight: AtomicBool,
    idle_cv: (Mutex<()>, Condvar),
    clock: Mutex<FlushClock>,
    last_report: Mutex<Option<FlushReport>>,
    fatal: Mutex<Option<String>>,
}

impl FlushShared {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            idle_cv: (Mutex::new(()), Condvar::new()),
            clock: Mutex::new(FlushClock::new(Instant::now())),
            last_report: Mutex::new(None),
            fatal: Mutex::new(None),
        }
    }

    /// Claim the single in-flight slot.
    pub fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the in-flight slot and wake idle waiters.
    pub fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        let (lock, cv) = &self.idle_cv;
        let _g = lock.lock();
        cv.notify_all();
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn wait_for_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(Instant::now);
        let (lock, cv) = &self.idle_cv;
        let mut guard = lock.lock();
        loop {
            if !self.is_in_flight() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let _ = cv.wait_for(&mut guard, remaining);
        }
        Err(BufferError::Timeout(format!(
            "flush still in flight after {:?}",
            timeout
        )))
    }

    pub fn timings(&self) -> FlushTimings {
        self.clock.lock().timings()
    }

    pub fn last_report(&self) -> Option<FlushReport> {
        self.last_report.lock().clone()
    }

    /// Fail with the recorded consistency failure, if any.
    pub fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(reason) => Err(BufferError::ConsistencyFailure(reason.clone())),
            None => Ok(()),
        }
    }

    fn set_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(reason);
        }
    }
}

pub(crate) struct FlusherHandles {
    pub tx: Sender<Generation>,
    pub join: thread::JoinHandle<()>,
}

/// Start the flush worker. It owns each generation it receives until the
/// push, the crawl-state advance and the recovery step have all resolved.
pub(crate) fn spawn_flusher(
    sink: Arc<dyn BatchSink>,
    tracker: Arc<dyn CrawlStateTracker>,
    recovery: RecoveryFile,
    shared: Arc<FlushShared>,
    metrics: FlushMetrics,
) -> Result<FlusherHandles> {
    // One slot: the in-flight flag already keeps a second generation out
    let (tx, rx) = channel::bounded::<Generation>(1);

    let flusher = Flusher {
        sink,
        tracker,
        recovery,
        shared,
        metrics,
    };
    let handle = thread::Builder::new()
        .name("termbuf-flusher".to_string())
        .spawn(move || {
            while let Ok(generation) = rx.recv() {
                flusher.run(generation);
            }
            debug!("Flush worker exiting");
        })?;

    Ok(FlusherHandles { tx, join: handle })
}

struct Flusher {
    sink: Arc<dyn BatchSink>,
    tracker: Arc<dyn CrawlStateTracker>,
    recovery: RecoveryFile,
    shared: Arc<FlushShared>,
    metrics: FlushMetrics,
}

impl Flusher {
    fn run(&self, generation: Generation) {
        let mut report = FlushReport {
            generation: generation.id(),
            entries: generation.len(),
            bytes: 0,
            delivered: false,
            recovered_entries: None,
        };

        if generation.is_empty() {
            debug!("Generation {} is empty, nothing to send", generation.id());
            self.metrics.record_empty_flush();
        } else {
            let started = Instant::now();
            match self.deliver(&generation) {
                Ok(bytes) => {
                    report.bytes = bytes;
                    report.delivered = true;
                }
                Err(e) => {
                    error!(
                        "Could not push generation {} ({} entries), entries lost for this run: {}",
                        generation.id(),
                        generation.len(),
                        e
                    );
                }
            }
            let finished = Instant::now();
            self.shared.clock.lock().record(started, finished);

            let outcome = if report.delivered { "delivered" } else { "failed" };
            self.metrics.record_flush(
                outcome,
                report.bytes,
                finished.duration_since(started).as_secs_f64(),
            );
        }

        report.recovered_entries = self.push_recovery_file();

        *self.shared.last_report.lock() = Some(report);
        self.shared.finish();
    }

    /// Serialize, push, then advance crawl state. Returns the payload size.
    fn deliver(&self, generation: &Generation) -> Result<usize> {
        let payload = encode_entries(generation.iter())?;
        info!(
            "Sending generation {} to index: {} entries, estimated size {} bytes, {} bytes encoded",
            generation.id(),
            generation.len(),
            generation.size_estimate(),
            payload.len()
        );

        self.sink.push_buffer(&payload)?;
        info!("Generation {} sent, size = {}", generation.id(), payload.len());

        match self
            .tracker
            .advance_status(PageStatus::NotPushed, PageStatus::Succeeded)
        {
            Ok(moved) => debug!("Marked {} pages as succeeded", moved),
            Err(e) => {
                let reason = format!(
                    "generation {} delivered but crawl state not advanced: {}",
                    generation.id(),
                    e
                );
                error!("{}", reason);
                self.shared.set_fatal(reason);
            }
        }

        Ok(payload.len())
    }

    /// Hand a recovery file left by an earlier run to the sink, then delete it.
    fn push_recovery_file(&self) -> Option<usize> {
        let pending = match self.recovery.load() {
            Ok(Some(pending)) => pending,
            Ok(None) => return None,
            Err(BufferError::CorruptRecord(reason)) => {
                self.metrics.record_recovery("corrupt");
                match self.recovery.quarantine() {
                    Ok(moved) => error!(
                        "Recovery file {} is corrupt ({}), moved to {}",
                        self.recovery.path().display(),
                        reason,
                        moved.display()
                    ),
                    Err(e) => error!(
                        "Recovery file {} is corrupt ({}) and could not be moved aside: {}",
                        self.recovery.path().display(),
                        reason,
                        e
                    ),
                }
                return None;
            }
            Err(e) => {
                error!(
                    "Could not read recovery file {}: {}",
                    self.recovery.path().display(),
                    e
                );
                return None;
            }
        };

        info!(
            "Restoring {} entries from last time from {}",
            pending.entries,
            self.recovery.path().display()
        );

        if let Err(e) = self.sink.push_buffer(&pending.payload) {
            self.metrics.record_recovery("failed");
            warn!(
                "Could not push recovery file {}, keeping it for the next flush: {}",
                self.recovery.path().display(),
                e
            );
            return None;
        }

        self.metrics.record_recovery("restored");
        if let Err(e) = self.recovery.discard() {
            error!(
                "Recovery file {} was pushed but could not be deleted: {}",
                self.recovery.path().display(),
                e
            );
        }
        Some(pending.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_in_flight_slot() {
        let shared = FlushShared::new();
        assert!(shared.try_begin());
        assert!(!shared.try_begin());
        assert!(shared.is_in_flight());

        shared.finish();
        assert!(!shared.is_in_flight());
        assert!(shared.try_begin());
    }

    #[test]
    fn test_wait_for_idle_times_out() {
        let shared = FlushShared::new();
        assert!(shared.wait_for_idle(Duration::from_millis(1)).is_ok());

        shared.try_begin();
        let err = shared.wait_for_idle(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BufferError::Timeout(_)));
    }

    #[test]
    fn test_wait_for_idle_wakes_on_finish() {
        let shared = Arc::new(FlushShared::new());
        shared.try_begin();

        let worker = {
            let shared = shared.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                shared.finish();
            })
        };

        shared.wait_for_idle(Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_fatal_is_sticky() {
        let shared = FlushShared::new();
        assert!(shared.check_fatal().is_ok());

        shared.set_fatal("first".to_string());
        shared.set_fatal("second".to_string());

        match shared.check_fatal() {
            Err(BufferError::ConsistencyFailure(reason)) => assert_eq!(reason, "first"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
