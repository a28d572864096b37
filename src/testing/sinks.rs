use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BufferError, Result};
use crate::models::TermPageEntry;
use crate::persistence::decode_entries;
use crate::sink::BatchSink;

/// Sink that keeps every accepted payload in memory.
///
/// Switch it off with [`RecordingSink::set_available`] to make pushes fail
/// with [`BufferError::SinkUnavailable`].
#[derive(Debug)]
pub struct RecordingSink {
    payloads: Mutex<Vec<Vec<u8>>>,
    available: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            payloads: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Accepted payloads in push order
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().clone()
    }

    /// Every push call, accepted or refused
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// All accepted entries, decoded, in push order
    pub fn entries(&self) -> Result<Vec<TermPageEntry>> {
        let mut out = Vec::new();
        for payload in self.payloads.lock().iter() {
            out.extend(decode_entries(payload)?);
        }
        Ok(out)
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSink for RecordingSink {
    fn push_buffer(&self, payload: &[u8]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(BufferError::SinkUnavailable(
                "recording sink switched off".to_string(),
            ));
        }
        self.payloads.lock().push(payload.to_vec());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    started: usize,
    active: usize,
    max_active: usize,
}

/// Sink that holds every push until [`GatedSink::release`] is called.
///
/// Records how many pushes were ever blocked inside it at the same time.
#[derive(Debug, Default)]
pub struct GatedSink {
    inner: RecordingSink,
    gate: Mutex<Gate>,
    cv: Condvar,
}

impl GatedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let held and future pushes through.
    pub fn release(&self) {
        let mut gate = self.gate.lock();
        gate.open = true;
        self.cv.notify_all();
    }

    /// Wait until at least `count` pushes have entered the sink.
    pub fn wait_for_pushes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while gate.started < count {
            if self.cv.wait_until(&mut gate, deadline).timed_out() {
                return gate.started >= count;
            }
        }
        true
    }

    /// Pushes that have entered the sink so far
    pub fn started(&self) -> usize {
        self.gate.lock().started
    }

    pub fn max_concurrent(&self) -> usize {
        self.gate.lock().max_active
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.inner.payloads()
    }

    pub fn entries(&self) -> Result<Vec<TermPageEntry>> {
        self.inner.entries()
    }
}

impl BatchSink for GatedSink {
    fn push_buffer(&self, payload: &[u8]) -> Result<()> {
        {
            let mut gate = self.gate.lock();
            gate.started += 1;
            gate.active += 1;
            gate.max_active = gate.max_active.max(gate.active);
            self.cv.notify_all();
            while !gate.open {
                self.cv.wait(&mut gate);
            }
        }

        let result = self.inner.push_buffer(payload);
        self.gate.lock().active -= 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_recording_sink_toggle() {
        let sink = RecordingSink::new();
        sink.push_buffer(b"one").unwrap();

        sink.set_available(false);
        assert!(matches!(
            sink.push_buffer(b"two"),
            Err(BufferError::SinkUnavailable(_))
        ));

        assert_eq!(sink.payloads(), vec![b"one".to_vec()]);
        assert_eq!(sink.attempts(), 2);
    }

    #[test]
    fn test_gated_sink_holds_until_release() {
        let sink = Arc::new(GatedSink::new());
        let pusher = {
            let sink = sink.clone();
            thread::spawn(move || sink.push_buffer(b"held"))
        };

        assert!(sink.wait_for_pushes(1, Duration::from_secs(5)));
        assert!(sink.payloads().is_empty());

        sink.release();
        pusher.join().unwrap().unwrap();
        assert_eq!(sink.payloads().len(), 1);
        assert_eq!(sink.max_concurrent(), 1);
    }
}
