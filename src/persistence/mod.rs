//! Persistence primitives: the per-record log format, the shutdown recovery
//! file, and crawl-state trackers.

pub mod crawl_state;
pub mod record_log;
pub mod recovery;

pub use crawl_state::{CrawlStateTracker, FjallCrawlState, MemoryCrawlState};
pub use record_log::{decode_entries, encode_entries, RecordReader, RecordWriter};
pub use recovery::{PendingRecovery, RecoveryFile, RECOVERY_FILE_NAME};
