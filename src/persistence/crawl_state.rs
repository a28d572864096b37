use std::collections::BTreeMap;
use std::path::PathBuf;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use parking_lot::Mutex;

use crate::error::{BufferError, Result};
use crate::models::{PageRef, PageStatus};

/// Crawl-state database consulted by the flush pipeline.
///
/// After a batch has been handed to the sink, every page still waiting for
/// delivery is moved on in one call.
pub trait CrawlStateTracker: Send + Sync {
    /// Move every page in `from` to `to`, returning how many pages moved.
    fn advance_status(&self, from: PageStatus, to: PageStatus) -> Result<u64>;
}

/// In-memory crawl state, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryCrawlState {
    pages: Mutex<BTreeMap<PageRef, PageStatus>>,
}

impl MemoryCrawlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, page: &PageRef, status: PageStatus) {
        self.pages.lock().insert(page.clone(), status);
    }

    pub fn status(&self, page: &PageRef) -> Option<PageStatus> {
        self.pages.lock().get(page).copied()
    }

    pub fn count(&self, status: PageStatus) -> usize {
        self.pages.lock().values().filter(|s| **s == status).count()
    }
}

impl CrawlStateTracker for MemoryCrawlState {
    fn advance_status(&self, from: PageStatus, to: PageStatus) -> Result<u64> {
        let mut pages = self.pages.lock();
        let mut moved = 0;
        for status in pages.values_mut() {
            if *status == from {
                *status = to;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

const PAGES_CF: &str = "pages";

/// Fjall-backed crawl state: one key per page, one status byte per key.
pub struct FjallCrawlState {
    base_dir: PathBuf,
    db: Database,
    pages: Keyspace,
}

impl FjallCrawlState {
    pub fn open(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        let db = Database::builder(&base_dir).open().map_err(|e| {
            BufferError::CrawlState(format!("failed to open fjall crawl state: {}", e))
        })?;

        let pages = db
            .keyspace(PAGES_CF, || KeyspaceCreateOptions::default())
            .map_err(|e| BufferError::CrawlState(format!("failed to open pages cf: {}", e)))?;

        Ok(Self {
            base_dir,
            db,
            pages,
        })
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub fn set_status(&self, page: &PageRef, status: PageStatus) -> Result<()> {
        self.pages
            .insert(page.as_str().as_bytes(), [status.as_byte()])
            .map_err(|e| BufferError::CrawlState(e.to_string()))?;
        Ok(())
    }

    pub fn status(&self, page: &PageRef) -> Result<Option<PageStatus>> {
        let Some(val) = self
            .pages
            .get(page.as_str().as_bytes())
            .map_err(|e| BufferError::CrawlState(e.to_string()))?
        else {
            return Ok(None);
        };
        let bytes: &[u8] = val.as_ref();
        Ok(bytes.first().copied().and_then(PageStatus::from_byte))
    }

    /// Keys of every page currently in `status`
    fn pages_in(&self, status: PageStatus) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for kv in self.pages.iter() {
            let key = kv
                .key()
                .map_err(|e| BufferError::CrawlState(e.to_string()))?;
            let key_bytes = key.as_ref().to_vec();
            if let Some(val) = self
                .pages
                .get(&key_bytes)
                .map_err(|e| BufferError::CrawlState(e.to_string()))?
            {
                let bytes: &[u8] = val.as_ref();
                if bytes.first().copied().and_then(PageStatus::from_byte) == Some(status) {
                    out.push(key_bytes);
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self, status: PageStatus) -> Result<usize> {
        Ok(self.pages_in(status)?.len())
    }

    /// Persist the journal so status transitions survive a crash.
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| BufferError::CrawlState(e.to_string()))
    }
}

impl CrawlStateTracker for FjallCrawlState {
    fn advance_status(&self, from: PageStatus, to: PageStatus) -> Result<u64> {
        let keys = self.pages_in(from)?;
        if keys.is_empty() {
            return Ok(0);
        }

        // All or nothing
        let mut batch = self.db.batch();
        for key in &keys {
            batch.insert(&self.pages, key.as_slice(), [to.as_byte()]);
        }
        batch
            .commit()
            .map_err(|e| BufferError::CrawlState(format!("failed to commit status batch: {}", e)))?;
        self.persist()?;
        Ok(keys.len() as u64)
    }
}
