use serde::{Deserialize, Serialize};

/// Crawl status of a source page, as tracked by the crawl-state database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageStatus {
    /// Waiting to be fetched
    Queued,
    /// Fetched and parsed, facts buffered but not yet handed to the index
    NotPushed,
    /// Facts delivered to the index
    Succeeded,
    /// Fetch or parse failed
    Failed,
}

impl PageStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            PageStatus::Queued => 0,
            PageStatus::NotPushed => 1,
            PageStatus::Succeeded => 2,
            PageStatus::Failed => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PageStatus::Queued),
            1 => Some(PageStatus::NotPushed),
            2 => Some(PageStatus::Succeeded),
            3 => Some(PageStatus::Failed),
            _ => None,
        }
    }
}
