pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod sink;
pub mod testing;

pub use buffer::{EntryBuffer, FlushReport, FlushTimings, ShutdownReport};
pub use config::{BufferConfig, FlushProfile};
pub use error::{BufferError, Result};
pub use metrics::FlushMetrics;
pub use models::*;
pub use persistence::{CrawlStateTracker, FjallCrawlState, MemoryCrawlState, RecoveryFile};
pub use sink::{BatchSink, DirectorySink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
