use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the entry buffer and its flush pipeline
#[derive(Clone)]
pub struct FlushMetrics {
    // Counters
    pub entries_created: Counter,
    pub positions_recorded: Counter,
    pub flushes_total: CounterVec,
    pub recovery_pushes: CounterVec,

    // Gauges
    pub size_estimate: Gauge,

    // Histograms
    pub flush_latency: Histogram,
    pub batch_bytes: Histogram,

    // Registry
    registry: Arc<Registry>,
}

impl FlushMetrics {
    /// Create a new FlushMetrics instance with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Counters
        let entries_created = Counter::with_opts(Opts::new(
            "termbuf_entries_created_total",
            "Distinct term-page entries added to the live buffer",
        ))?;
        registry.register(Box::new(entries_created.clone()))?;

        let positions_recorded = Counter::with_opts(Opts::new(
            "termbuf_positions_recorded_total",
            "Positions merged into buffered entries",
        ))?;
        registry.register(Box::new(positions_recorded.clone()))?;

        let flushes_total = CounterVec::new(
            Opts::new("termbuf_flushes_total", "Flush generations by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(flushes_total.clone()))?;

        let recovery_pushes = CounterVec::new(
            Opts::new(
                "termbuf_recovery_pushes_total",
                "Recovery file hand-offs by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(recovery_pushes.clone()))?;

        // Gauges
        let size_estimate = Gauge::with_opts(Opts::new(
            "termbuf_size_estimate_bytes",
            "Running size estimate of the live buffer",
        ))?;
        registry.register(Box::new(size_estimate.clone()))?;

        // Histograms
        let flush_latency = Histogram::with_opts(
            HistogramOpts::new("termbuf_flush_latency_seconds", "Fresh generation push latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(flush_latency.clone()))?;

        let batch_bytes = Histogram::with_opts(
            HistogramOpts::new("termbuf_batch_bytes", "Serialized size of flushed batches")
                .buckets(vec![
                    1024.0, 65536.0, 1048576.0, 4194304.0, 16777216.0, 67108864.0,
                ]),
        )?;
        registry.register(Box::new(batch_bytes.clone()))?;

        Ok(Self {
            entries_created,
            positions_recorded,
            flushes_total,
            recovery_pushes,
            size_estimate,
            flush_latency,
            batch_bytes,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_entry_created(&self) {
        self.entries_created.inc();
    }

    pub fn record_position(&self) {
        self.positions_recorded.inc();
    }

    pub fn set_size_estimate(&self, bytes: usize) {
        self.size_estimate.set(bytes as f64);
    }

    /// Record a fresh generation hand-off
    pub fn record_flush(&self, outcome: &str, bytes: usize, duration_secs: f64) {
        self.flushes_total.with_label_values(&[outcome]).inc();
        self.batch_bytes.observe(bytes as f64);
        self.flush_latency.observe(duration_secs);
    }

    pub fn record_empty_flush(&self) {
        self.flushes_total.with_label_values(&["empty"]).inc();
    }

    pub fn record_recovery(&self, outcome: &str) {
        self.recovery_pushes.with_label_values(&[outcome]).inc();
    }

    /// Render all metrics in the text exposition format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = FlushMetrics::new().unwrap();
        metrics.record_entry_created();
        metrics.record_position();
        metrics.record_flush("delivered", 2048, 0.01);
        metrics.record_recovery("restored");
        metrics.set_size_estimate(120);

        let text = metrics.gather_text();
        assert!(text.contains("termbuf_entries_created_total 1"));
        assert!(text.contains("termbuf_flushes_total{outcome=\"delivered\"} 1"));
        assert!(text.contains("termbuf_size_estimate_bytes 120"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = FlushMetrics::new().unwrap();
        let b = FlushMetrics::new().unwrap();
        a.record_entry_created();
        assert_eq!(a.entries_created.get(), 1.0);
        assert_eq!(b.entries_created.get(), 0.0);
    }
}
