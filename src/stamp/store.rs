//! Slot-addressed access to a time stamp file
//!
//! The file is a log of fixed-size slots. Slot 0 holds the leader record;
//! every other slot is appended once and afterwards only rewritten in place.
//! Structural changes (appending, converting the leader) happen only while
//! the leader lock is held.

use crate::stamp::record::{
    convert_to_leader, DecodeError, Record, RecordFlags, RecordHeader, RECORD_SIZE,
};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Length of the lock region covering one slot
pub const SLOT_LEN: u64 = RECORD_SIZE as u64;

/// Where to write a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    At(u64),
    Append,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("short read at offset {offset} of {path}: {source}")]
    Truncated {
        path: PathBuf,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("unreadable record at offset {offset} of {path}: {source}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("unable to write to {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Record-level view of an open time stamp file
pub struct RecordStore<'a> {
    file: &'a File,
    path: &'a Path,
}

impl<'a> RecordStore<'a> {
    pub fn new(file: &'a File, path: &'a Path) -> Self {
        Self { file, path }
    }

    pub fn file(&self) -> &'a File {
        self.file
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.to_path_buf(),
            source,
        }
    }

    /// Read up to one slot of raw bytes; the count is short only at EOF
    fn read_raw(&self, offset: u64) -> Result<([u8; RECORD_SIZE], usize), StoreError> {
        let mut buf = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_err(e)),
            }
        }
        Ok((buf, filled))
    }

    /// Read the record at `offset`
    pub fn read_at(&self, offset: u64) -> Result<Record, StoreError> {
        let (buf, filled) = self.read_raw(offset)?;
        match Record::decode(&buf[..filled]) {
            Ok(record) => {
                debug!("read {} byte record at {}", filled, offset);
                Ok(record)
            }
            Err(source @ DecodeError::Truncated { .. }) => {
                debug!("short read ({} vs {}), truncated time stamp file?", filled, RECORD_SIZE);
                Err(StoreError::Truncated {
                    path: self.path.to_path_buf(),
                    offset,
                    source,
                })
            }
            Err(source) => Err(StoreError::Corrupt {
                path: self.path.to_path_buf(),
                offset,
                source,
            }),
        }
    }

    /// Write `record` and return the offset it landed at
    pub fn write_at(&self, slot: Slot, record: &Record) -> Result<u64, StoreError> {
        self.write_bytes(slot, &record.encode())
    }

    /// Write raw slot bytes.
    ///
    /// A short write truncates the file back to its previous length, so the
    /// next reader sees a clean miss instead of a partial record.
    fn write_bytes(&self, slot: Slot, bytes: &[u8]) -> Result<u64, StoreError> {
        let old_eof = self.file.metadata().map_err(|e| self.io_err(e))?.len();
        let offset = match slot {
            Slot::At(offset) => offset,
            Slot::Append => old_eof,
        };

        let written = loop {
            match self.file.write_at(bytes, offset) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_err(e)),
            }
        };

        if written != bytes.len() {
            if written > 0 {
                debug!("short write, truncating partial time stamp record");
                if let Err(e) = self.file.set_len(old_eof) {
                    warn!(
                        "unable to truncate time stamp file to {} bytes: {}",
                        old_eof, e
                    );
                }
            }
            return Err(StoreError::ShortWrite {
                path: self.path.to_path_buf(),
                written,
                expected: bytes.len(),
            });
        }
        Ok(offset)
    }

    /// Make sure slot 0 holds a leader record and return the offset where
    /// record scanning starts.
    ///
    /// Must be called with the leader lock held.
    pub fn ensure_leader(&self) -> Result<u64, StoreError> {
        let (mut buf, filled) = self.read_raw(0)?;
        if filled == 0 {
            debug!("new time stamp file, adding leader record");
            self.write_at(Slot::At(0), &Record::leader())?;
            return Ok(SLOT_LEN);
        }

        let is_leader = RecordHeader::peek(&buf[..filled]).is_some_and(|h| h.is_leader());
        if !is_leader {
            info!("converting old first record of {} to a leader record", self.path.display());
            convert_to_leader(&mut buf);
            self.write_bytes(Slot::At(0), &buf)?;
        }

        let declared = RecordHeader::peek(&buf).map_or(0, |h| u64::from(h.declared_size));
        if declared != SLOT_LEN {
            debug!("leader record has unexpected size {}", declared);
        }
        Ok(if declared == 0 { SLOT_LEN } else { declared })
    }

    /// Find the first record at or after `from` that matches `key`.
    ///
    /// Slots whose declared size is wrong are skipped by that size; a zero
    /// size ends the scan.
    pub fn find(&self, from: u64, key: &Record) -> Result<Option<(u64, Record)>, StoreError> {
        let mut offset = from;
        let mut recno = 0u32;
        loop {
            let (buf, filled) = self.read_raw(offset)?;
            if filled < RECORD_SIZE {
                return Ok(None);
            }
            recno += 1;

            let declared = RecordHeader::peek(&buf).map_or(0, |h| u64::from(h.declared_size));
            if declared != SLOT_LEN {
                debug!(
                    "wrong sized record {}, got {}, expected {}",
                    recno, declared, SLOT_LEN
                );
                if declared == 0 {
                    return Ok(None);
                }
                offset += declared;
                continue;
            }

            match Record::decode(&buf) {
                Ok(record) if record.matches_key(key) => return Ok(Some((offset, record))),
                Ok(_) => {}
                Err(e) => debug!("skipping record {}: {}", recno, e),
            }
            offset += SLOT_LEN;
        }
    }

    /// Find the record matching `key`, appending a disabled copy of the key
    /// if there is none
    pub fn find_or_append(&self, from: u64, key: &Record) -> Result<(u64, Record), StoreError> {
        if let Some(found) = self.find(from, key)? {
            debug!("found existing {} time stamp record at {}", key.kind.name(), found.0);
            return Ok(found);
        }

        let mut record = *key;
        record.flags.insert(RecordFlags::DISABLED);
        let offset = self.write_at(Slot::Append, &record)?;
        debug!("appended new {} time stamp record at {}", key.kind.name(), offset);
        Ok((offset, record))
    }

    /// Disable every record from `from` on that matches `key`.
    ///
    /// Keeps going after a failed write and reports the first failure at the
    /// end. Returns how many records were newly disabled.
    pub fn disable_matching(&self, from: u64, key: &Record) -> Result<usize, StoreError> {
        let mut offset = from;
        let mut disabled = 0;
        let mut first_error = None;

        while let Some((pos, mut record)) = self.find(offset, key)? {
            if !record.is_disabled() {
                record.flags.insert(RecordFlags::DISABLED);
                match self.write_at(Slot::At(pos), &record) {
                    Ok(_) => disabled += 1,
                    Err(e) => {
                        warn!("unable to disable record at {}: {}", pos, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            offset = pos + SLOT_LEN;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(disabled),
        }
    }
}
