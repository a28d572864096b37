//! Test doubles for the flush pipeline
//!
//! This module provides:
//! - Sinks that record, refuse, or hold back pushed batches
//! - A crawl-state tracker that always fails
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use termbuf::testing::prelude::*;
//!
//! let sink = Arc::new(RecordingSink::new());
//! let buffer = EntryBuffer::new(config, sink.clone(), Arc::new(MemoryCrawlState::new()))?;
//!
//! buffer.record_occurrence("rust", 1.0, "CHK@page", 0, None)?;
//! buffer.flush_now()?;
//! buffer.wait_for_idle(Duration::from_secs(5))?;
//!
//! assert_eq!(sink.entries()?.len(), 1);
//! ```

pub mod crawl;
pub mod sinks;

pub use crawl::BrokenCrawlState;
pub use sinks::{GatedSink, RecordingSink};

/// Prelude for easy imports
pub mod prelude {
    pub use super::crawl::BrokenCrawlState;
    pub use super::sinks::{GatedSink, RecordingSink};
    pub use crate::buffer::EntryBuffer;
    pub use crate::config::BufferConfig;
    pub use crate::persistence::MemoryCrawlState;
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
