//! Random access over a journal's hash records.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{DraftError, Result};

use super::{read_file_header, HashRecord, HASH_RECORD_SIZE};

const INVALID_INDEX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

/// Positioned pointer into the hash-record region.
///
/// A cursor holds its own read-only view of the journal file, so several
/// cursors can coexist and each sees a monotonically growing record count.
/// Cursors invalidate when moved outside `0..record_count`; an invalid
/// cursor yields no record but can become valid again through `Set`- or
/// `End`-relative seeks.
#[derive(Clone)]
pub struct Cursor {
    file: Arc<fs::File>,
    hash_offset: u64,
    idx: u64,
}

impl Cursor {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let (hash_offset, _) = read_file_header(&file)?;

        Ok(Self {
            file: Arc::new(file),
            hash_offset,
            idx: INVALID_INDEX,
        })
    }

    fn record_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();

        if len <= self.hash_offset {
            return Ok(0);
        }

        Ok((len - self.hash_offset) / HASH_RECORD_SIZE)
    }

    pub fn valid(&self) -> bool {
        match self.record_count() {
            Ok(count) => self.idx < count,
            Err(_) => false,
        }
    }

    /// Record index, or `None` while invalid.
    pub fn position(&self) -> Option<u64> {
        (self.idx != INVALID_INDEX).then_some(self.idx)
    }

    pub(crate) fn invalidate(&mut self) {
        self.idx = INVALID_INDEX;
    }

    /// Move by/to a record index.
    ///
    /// - `Set`: target is `count`; valid iff `0 <= count < record_count`.
    /// - `End`: target is `record_count - |count|` for negative `count`;
    ///   `count >= 0` invalidates.
    /// - `Current`: target is `current +/- count`. From an invalid cursor a
    ///   negative `count` is treated End-relative; a non-negative one stays
    ///   invalid.
    ///
    /// Any move that would leave the range invalidates the cursor.
    pub fn seek(&mut self, count: i64, whence: Whence) -> Result<&mut Self> {
        let record_count = self.record_count()?;
        let abs = count.unsigned_abs();

        self.idx = match whence {
            Whence::Set => {
                if count >= 0 && abs < record_count {
                    abs
                } else {
                    INVALID_INDEX
                }
            }
            Whence::End => {
                if count < 0 && abs <= record_count {
                    record_count - abs
                } else {
                    INVALID_INDEX
                }
            }
            Whence::Current => {
                if self.idx == INVALID_INDEX {
                    if count < 0 && abs <= record_count {
                        record_count - abs
                    } else {
                        INVALID_INDEX
                    }
                } else if count < 0 {
                    if abs <= self.idx {
                        self.idx - abs
                    } else {
                        INVALID_INDEX
                    }
                } else {
                    match self.idx.checked_add(abs) {
                        Some(target) if target < record_count => target,
                        _ => INVALID_INDEX,
                    }
                }
            }
        };

        Ok(self)
    }

    /// The record under the cursor, or `None` while invalid. Each call
    /// re-issues a positioned read, so the cursor stays independent of any
    /// writer.
    pub fn hash_record(&self) -> Result<Option<HashRecord>> {
        if !self.valid() {
            return Ok(None);
        }

        let offset = self.hash_offset + self.idx * HASH_RECORD_SIZE;

        let mut buf = [0u8; HASH_RECORD_SIZE as usize];
        self.file.read_exact_at(&mut buf, offset)?;

        Ok(Some(HashRecord::from_bytes(&buf)))
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("idx", &self.position())
            .field("hash_offset", &self.hash_offset)
            .finish()
    }
}

/// Bidirectional iteration over hash records, with offset arithmetic.
///
/// Two iterators compare equal when their cursors sit at the same position
/// (all invalid positions compare equal).
#[derive(Debug, Clone)]
pub struct RecordIter {
    cursor: Cursor,
}

impl RecordIter {
    pub(crate) fn new(cursor: Cursor) -> Self {
        Self { cursor }
    }

    pub fn position(&self) -> Option<u64> {
        self.cursor.position()
    }

    pub fn valid(&self) -> bool {
        self.cursor.valid()
    }

    /// Move forward (positive) or backward (negative) by `count` records.
    pub fn advance(&mut self, count: i64) -> Result<&mut Self> {
        self.cursor.seek(count, Whence::Current)?;
        Ok(self)
    }

    /// The record under the iterator; a `Range` error while invalid.
    pub fn record(&self) -> Result<HashRecord> {
        self.cursor
            .hash_record()?
            .ok_or_else(|| DraftError::Range("iterator dereferenced while invalid".to_string()))
    }
}

impl PartialEq for RecordIter {
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
    }
}

impl Eq for RecordIter {}

impl Iterator for RecordIter {
    type Item = Result<HashRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.cursor.hash_record() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                self.cursor.invalidate();
                return Some(Err(e));
            }
        };

        if let Err(e) = self.cursor.seek(1, Whence::Current) {
            self.cursor.invalidate();
            return Some(Err(e));
        }

        Some(Ok(record))
    }
}
