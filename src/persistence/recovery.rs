use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{BufferError, Result};
use crate::models::{Annotations, PageFact};
use crate::persistence::record_log::{RecordReader, RecordWriter};

/// Default recovery file name, resolved against the working directory
pub const RECOVERY_FILE_NAME: &str = "termbuf.saved.data";

/// Contents of a recovery file left behind by an earlier shutdown.
#[derive(Debug)]
pub struct PendingRecovery {
    pub payload: Vec<u8>,
    pub entries: usize,
}

/// On-disk copy of entries drained at shutdown and not yet delivered.
///
/// The file holds concatenated records in the same format as a flushed
/// batch, with no header. Its presence means an earlier run stopped with
/// undelivered entries; absence is the steady state.
#[derive(Clone, Debug)]
pub struct RecoveryFile {
    path: PathBuf,
}

impl RecoveryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| RECOVERY_FILE_NAME.into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Persist drained entries, replacing the file atomically.
    ///
    /// Records from a stale file that was never delivered are kept ahead of
    /// the new ones. Nothing is written when there is nothing to keep.
    /// Returns the number of newly written records.
    pub fn persist<'a, I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a PageFact, &'a Annotations)>,
    {
        self.write_atomically(entries).map_err(|e| {
            BufferError::RecoveryWriteFailure(format!("{}: {}", self.path.display(), e))
        })
    }

    fn write_atomically<'a, I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a PageFact, &'a Annotations)>,
    {
        let stale = match fs::read(&self.path) {
            Ok(bytes) => Some(self.readable_prefix(bytes)?).filter(|b| !b.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut entries = entries.into_iter().peekable();
        if entries.peek().is_none() && stale.is_none() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.sibling(".tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        if let Some(stale) = &stale {
            out.write_all(stale)?;
        }

        let mut writer = RecordWriter::new(out);
        for (fact, annotations) in entries {
            writer.write_entry(fact, annotations)?;
        }
        let written = writer.records();

        let file = writer
            .into_inner()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(written)
    }

    /// Records of a stale file that still decode. When the file is damaged,
    /// the original is moved aside and only the readable prefix is kept.
    fn readable_prefix(&self, mut bytes: Vec<u8>) -> Result<Vec<u8>> {
        let (valid, damage) = {
            let mut reader = RecordReader::new(bytes.as_slice());
            let damage = (&mut reader).find_map(|entry| entry.err());
            (reader.valid_len() as usize, damage)
        };
        let Some(damage) = damage else {
            return Ok(bytes);
        };

        let moved = self.quarantine()?;
        warn!(
            "Stale recovery file {} is damaged ({}), keeping {} of {} bytes, original moved to {}",
            self.path.display(),
            damage,
            valid,
            bytes.len(),
            moved.display()
        );
        bytes.truncate(valid);
        Ok(bytes)
    }

    /// Read the pending file, if any, validating every record.
    pub fn load(&self) -> Result<Option<PendingRecovery>> {
        let payload = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = 0;
        for entry in RecordReader::new(payload.as_slice()) {
            entry?;
            entries += 1;
        }

        Ok(Some(PendingRecovery { payload, entries }))
    }

    /// Remove the file once its contents have been delivered.
    pub fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an unreadable file aside so it is never pushed.
    pub fn quarantine(&self) -> Result<PathBuf> {
        let target = self.sibling(".corrupt");
        fs::rename(&self.path, &target)?;
        Ok(target)
    }
}

impl Default for RecoveryFile {
    fn default() -> Self {
        Self::new(RECOVERY_FILE_NAME)
    }
}
