//! Downstream hand-off for flushed batches.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BufferError, Result};

/// Consumer of serialized batches (the index-building service).
///
/// A successful return means the payload is durable from the caller's point
/// of view. Implementations should bound their own blocking; the flush worker
/// waits for this call to resolve before taking the next generation.
pub trait BatchSink: Send + Sync {
    fn push_buffer(&self, payload: &[u8]) -> Result<()>;
}

/// Spool-directory sink: every batch becomes one `batch-<seq>.log` file.
///
/// Files are written under a temporary name, synced, then renamed, so a
/// reader of the spool directory only ever sees complete batches.
pub struct DirectorySink {
    dir: PathBuf,
    next_seq: AtomicU64,
}

impl DirectorySink {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // Continue numbering after whatever is already spooled
        let mut next_seq = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(seq) = Self::parse_seq(&entry.file_name().to_string_lossy()) {
                next_seq = next_seq.max(seq + 1);
            }
        }

        Ok(Self {
            dir,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    fn parse_seq(name: &str) -> Option<u64> {
        name.strip_prefix("batch-")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }

    fn batch_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("batch-{:010}.log", seq))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spooled batch files in delivery order
    pub fn batches(&self) -> Result<Vec<PathBuf>> {
        let mut out: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(seq) = Self::parse_seq(&entry.file_name().to_string_lossy()) {
                out.push((seq, entry.path()));
            }
        }
        out.sort();
        Ok(out.into_iter().map(|(_, path)| path).collect())
    }
}

impl BatchSink for DirectorySink {
    fn push_buffer(&self, payload: &[u8]) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let path = self.batch_path(seq);
        let tmp = path.with_extension("tmp");

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BufferError::SinkUnavailable(format!("{}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_batches_spooled_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::open(dir.path()).unwrap();

        sink.push_buffer(b"first").unwrap();
        sink.push_buffer(b"second").unwrap();

        let batches = sink.batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(fs::read(&batches[0]).unwrap(), b"first");
        assert_eq!(fs::read(&batches[1]).unwrap(), b"second");
    }

    #[test]
    fn test_numbering_resumes_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let sink = DirectorySink::open(dir.path()).unwrap();
            sink.push_buffer(b"first").unwrap();
        }

        let sink = DirectorySink::open(dir.path()).unwrap();
        sink.push_buffer(b"second").unwrap();

        let batches = sink.batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(fs::read(&batches[1]).unwrap(), b"second");
    }

    #[test]
    fn test_parse_seq() {
        assert_eq!(DirectorySink::parse_seq("batch-0000000007.log"), Some(7));
        assert_eq!(DirectorySink::parse_seq("batch-0000000007.tmp"), None);
        assert_eq!(DirectorySink::parse_seq("notes.txt"), None);
    }
}
