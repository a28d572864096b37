use crate::error::{BufferError, Result};
use crate::models::PageStatus;
use crate::persistence::CrawlStateTracker;

/// Tracker whose storage is gone: every transition fails.
#[derive(Debug, Default)]
pub struct BrokenCrawlState;

impl CrawlStateTracker for BrokenCrawlState {
    fn advance_status(&self, from: PageStatus, to: PageStatus) -> Result<u64> {
        Err(BufferError::CrawlState(format!(
            "cannot move pages from {:?} to {:?}: database unavailable",
            from, to
        )))
    }
}
