use std::time::{Duration, Instant};

/// Time spent pushing generations vs. time spent between pushes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushTimings {
    /// Total time spent inside fresh-generation pushes
    pub stalled: Duration,
    /// Total time between the end of one push and the start of the next
    pub not_stalled: Duration,
}

/// Accumulates [`FlushTimings`] from the instants bracketing each push.
#[derive(Debug)]
pub(crate) struct FlushClock {
    timings: FlushTimings,
    last_not_stalled: Instant,
}

impl FlushClock {
    pub fn new(started: Instant) -> Self {
        Self {
            timings: FlushTimings::default(),
            last_not_stalled: started,
        }
    }

    pub fn record(&mut self, push_started: Instant, push_finished: Instant) {
        self.timings.not_stalled += push_started.saturating_duration_since(self.last_not_stalled);
        self.last_not_stalled = push_finished;
        self.timings.stalled += push_finished.saturating_duration_since(push_started);
    }

    pub fn timings(&self) -> FlushTimings {
        self.timings
    }
}
