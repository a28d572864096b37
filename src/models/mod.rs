pub mod entry;
pub mod page;
pub mod status;

pub use entry::{Annotations, EntryRef, PageFact, TermPageEntry, POSITION_COST};
pub use page::PageRef;
pub use status::PageStatus;
