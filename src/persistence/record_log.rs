use std::io::{self, Read, Write};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};
use crate::models::{Annotations, PageFact, PageRef, TermPageEntry};

/// Length of the frame header preceding every record payload
pub const FRAME_HEADER_LEN: usize = 8;

/// Records larger than this are treated as corruption rather than allocated
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

const RECORD_VERSION: u8 = 1;

#[derive(Serialize)]
struct EntryRecordRef<'a> {
    version: u8,
    subject: &'a str,
    relevance: f32,
    target: &'a str,
    title: Option<&'a str>,
    positions: Vec<(u32, Option<&'a str>)>,
}

#[derive(Deserialize)]
struct EntryRecord {
    version: u8,
    subject: String,
    relevance: f32,
    target: String,
    title: Option<String>,
    positions: Vec<(u32, Option<String>)>,
}

impl EntryRecord {
    fn into_entry(self) -> Result<TermPageEntry> {
        if self.version != RECORD_VERSION {
            return Err(BufferError::CorruptRecord(format!(
                "unsupported record version {}",
                self.version
            )));
        }
        let mut annotations = Annotations::new();
        annotations.set_title(self.title);
        for (offset, fragment) in self.positions {
            annotations.put_position(offset, fragment);
        }
        TermPageEntry::from_parts(
            self.subject,
            self.relevance,
            PageRef::parse(&self.target).ok(),
            annotations,
        )
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Writes a log of self-delimiting term entry records.
///
/// Record format:
/// - u32 length (little endian)
/// - u32 crc32 of payload
/// - bincode payload of one entry
///
/// There is no log-level header: a log is nothing but concatenated records,
/// so two logs can be joined by concatenating their bytes.
pub struct RecordWriter<W: Write> {
    inner: W,
    records: usize,
    bytes: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            records: 0,
            bytes: 0,
        }
    }

    /// Serialize one fact with its annotations as a framed record.
    pub fn write_entry(&mut self, fact: &PageFact, annotations: &Annotations) -> Result<()> {
        let record = EntryRecordRef {
            version: RECORD_VERSION,
            subject: fact.subject(),
            relevance: fact.relevance(),
            target: fact.target().as_str(),
            title: annotations.title(),
            positions: annotations
                .positions()
                .iter()
                .map(|(offset, fragment)| (*offset, fragment.as_deref()))
                .collect(),
        };
        let payload = bincode::serialize(&record)?;
        self.write_frame(&payload)
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| {
                BufferError::CorruptRecord(format!("record too large: {} bytes", payload.len()))
            })?;

        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&checksum(payload).to_le_bytes())?;
        self.inner.write_all(payload)?;

        self.records += 1;
        self.bytes += (FRAME_HEADER_LEN + payload.len()) as u64;
        Ok(())
    }

    /// Number of records written so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Number of bytes written so far, frame headers included
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads records back from a log, validating each frame's checksum.
///
/// Yields `None` at a clean record boundary; a partial frame or a checksum
/// mismatch yields one [`BufferError::CorruptRecord`] and ends iteration.
pub struct RecordReader<R: Read> {
    inner: R,
    offset: u64,
    failed: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            failed: false,
        }
    }

    fn read_header(&mut self) -> Result<Option<[u8; FRAME_HEADER_LEN]>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(BufferError::CorruptRecord(format!(
                "truncated record header at offset {}",
                self.offset
            )));
        }
        Ok(Some(header))
    }

    fn read_record(&mut self) -> Result<Option<TermPageEntry>> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_LEN {
            return Err(BufferError::CorruptRecord(format!(
                "record length {} at offset {} exceeds limit",
                len, self.offset
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                BufferError::CorruptRecord(format!(
                    "truncated record payload at offset {}",
                    self.offset
                ))
            } else {
                BufferError::Io(e)
            }
        })?;

        if checksum(&payload) != stored_crc {
            return Err(BufferError::CorruptRecord(format!(
                "checksum mismatch at offset {}",
                self.offset
            )));
        }

        // A frame that checks out but does not decode is still corruption
        let entry = bincode::deserialize::<EntryRecord>(&payload)
            .map_err(BufferError::from)
            .and_then(EntryRecord::into_entry)
            .map_err(|e| match e {
                BufferError::CorruptRecord(_) => e,
                other => BufferError::CorruptRecord(format!(
                    "undecodable record at offset {}: {}",
                    self.offset, other
                )),
            })?;
        self.offset += (FRAME_HEADER_LEN + payload.len()) as u64;
        Ok(Some(entry))
    }

    /// Bytes covered by the records read successfully so far
    pub fn valid_len(&self) -> u64 {
        self.offset
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<TermPageEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_record() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Serialize entries, in iteration order, into one contiguous payload.
pub fn encode_entries<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a PageFact, &'a Annotations)>,
{
    let mut writer = RecordWriter::new(Vec::new());
    for (fact, annotations) in entries {
        writer.write_entry(fact, annotations)?;
    }
    writer.into_inner()
}

/// Split a payload back into individual entries.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<TermPageEntry>> {
    RecordReader::new(bytes).collect()
}
