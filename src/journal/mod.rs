//! Append-only hash journal.
//!
//! Layout: an 8-byte magic and two u64 LE size fields at offset 0, the CBOR
//! metadata block at offset 64, then packed 32-byte hash records from
//! `journal_offset` (64 + cbor size, rounded up to 512) onward. Records are
//! appended whole and never mutated, so a journal can be read while it is
//! still being written.

mod cursor;
mod diff;
pub mod ops;

pub use cursor::{Cursor, RecordIter, Whence};
pub use diff::{diff_journals, Difference};

use std::fs;
use std::io::Write;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DraftError, Result};
use crate::fileinfo::FileInfo;

pub const JOURNAL_MAGIC: [u8; 8] = *b"DRAFTJF ";

/// Offset of the CBOR metadata block.
pub const JOURNAL_HEADER_OFFSET: u64 = 64;

/// Hash records start on a multiple of this.
pub const JOURNAL_ALIGNMENT: u64 = 512;

pub const HASH_RECORD_SIZE: u64 = 32;

const FILE_HEADER_SIZE: usize = 24;

const JOURNAL_VERSION_MAJOR: u16 = 0;
const JOURNAL_VERSION_MINOR: u16 = 0;

/// One packed journal entry: `{hash, offset, size, fileId, pad}`, 32 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashRecord {
    pub hash: u64,
    pub offset: u64,
    pub size: u64,
    pub file_id: u16,
}

impl HashRecord {
    pub fn to_bytes(&self) -> [u8; HASH_RECORD_SIZE as usize] {
        let mut buf = [0u8; HASH_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&self.hash.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..26].copy_from_slice(&self.file_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HASH_RECORD_SIZE as usize]) -> Self {
        Self {
            hash: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            file_id: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalMeta {
    version_major: u16,
    version_minor: u16,
    birthdate_epoch_nsec: i64,
    journal_alignment: u32,
    file_info: Vec<FileInfo>,
}

/// Parse and validate the fixed file header; returns
/// `(journal_offset, cbor_size)`.
pub(crate) fn read_file_header(file: &fs::File) -> Result<(u64, u64)> {
    let len = file.metadata()?.len();

    let mut buf = [0u8; FILE_HEADER_SIZE];
    file.read_exact_at(&mut buf, 0).map_err(|e| {
        DraftError::JournalFormat(format!("file header unreadable: {e}"))
    })?;

    if buf[0..8] != JOURNAL_MAGIC {
        return Err(DraftError::JournalFormat(format!(
            "bad file magic: {:02x?}",
            &buf[0..8]
        )));
    }

    let journal_offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let cbor_size = u64::from_le_bytes(buf[16..24].try_into().unwrap());

    if journal_offset
        .checked_add(cbor_size)
        .map_or(true, |v| v > i64::MAX as u64)
    {
        return Err(DraftError::JournalFormat(format!(
            "header sizes out of file-offset range: offset {journal_offset} cbor {cbor_size}"
        )));
    }

    if journal_offset > len {
        return Err(DraftError::JournalFormat(format!(
            "journal offset {journal_offset} beyond file size {len}"
        )));
    }

    if journal_offset < JOURNAL_HEADER_OFFSET + cbor_size {
        return Err(DraftError::JournalFormat(format!(
            "journal offset {journal_offset} overlaps metadata of {cbor_size} bytes"
        )));
    }

    if (len - journal_offset) % HASH_RECORD_SIZE != 0 {
        return Err(DraftError::JournalFormat(format!(
            "hash region length {} is not record aligned",
            len - journal_offset
        )));
    }

    Ok((journal_offset, cbor_size))
}

pub struct Journal {
    file: fs::File,
    path: PathBuf,
    journal_offset: u64,
    cbor_size: u64,
}

impl Journal {
    /// Open an existing journal read-only, validating the file header.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = fs::File::open(&path)?;

        let (journal_offset, cbor_size) = read_file_header(&file)?;

        Ok(Self {
            file,
            path,
            journal_offset,
            cbor_size,
        })
    }

    /// Create a new journal for the given file set.
    ///
    /// Refuses to overwrite an existing file. The handle appends, so
    /// concurrent `write_hash` calls land whole records.
    pub fn create(path: impl Into<PathBuf>, info: &[FileInfo]) -> Result<Self> {
        let path = path.into();

        let file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)?;

        let birthdate = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let meta = JournalMeta {
            version_major: JOURNAL_VERSION_MAJOR,
            version_minor: JOURNAL_VERSION_MINOR,
            birthdate_epoch_nsec: birthdate,
            journal_alignment: JOURNAL_ALIGNMENT as u32,
            file_info: info.to_vec(),
        };

        // reserve the raw header, serialize the metadata after it
        let mut buf = vec![0u8; JOURNAL_HEADER_OFFSET as usize];
        ciborium::into_writer(&meta, &mut buf)
            .map_err(|e| DraftError::JournalFormat(format!("metadata encode: {e}")))?;

        let cbor_size = buf.len() as u64 - JOURNAL_HEADER_OFFSET;

        // pad so the hash region starts journal-aligned
        let journal_offset =
            (buf.len() as u64 + JOURNAL_ALIGNMENT - 1) & !(JOURNAL_ALIGNMENT - 1);
        buf.resize(journal_offset as usize, 0);

        buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
        buf[8..16].copy_from_slice(&journal_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&cbor_size.to_le_bytes());

        (&file).write_all(&buf)?;

        crate::fileinfo::preallocate(&file, journal_offset)?;

        tracing::debug!(path = %path.display(), journal_offset, cbor_size, "created journal");

        Ok(Self {
            file,
            path,
            journal_offset,
            cbor_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_hash(&self, file_id: u16, offset: u64, size: u64, hash: u64) -> Result<()> {
        self.write_record(&HashRecord {
            hash,
            offset,
            size,
            file_id,
        })
    }

    /// Append one record. The single 32-byte append-mode write lands whole,
    /// so concurrent appenders do not tear records.
    pub fn write_record(&self, record: &HashRecord) -> Result<()> {
        (&self.file).write_all(&record.to_bytes())?;
        Ok(())
    }

    pub fn hash_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();

        if len <= self.journal_offset {
            return Ok(0);
        }

        Ok((len - self.journal_offset) / HASH_RECORD_SIZE)
    }

    fn read_meta(&self) -> Result<JournalMeta> {
        let mut buf = vec![0u8; self.cbor_size as usize];
        self.file.read_exact_at(&mut buf, JOURNAL_HEADER_OFFSET)?;

        ciborium::from_reader(buf.as_slice())
            .map_err(|e| DraftError::JournalFormat(format!("metadata decode: {e}")))
    }

    pub fn file_info(&self) -> Result<Vec<FileInfo>> {
        Ok(self.read_meta()?.file_info)
    }

    /// Creation time, nanoseconds since the epoch.
    pub fn creation_date_nsec(&self) -> Result<i64> {
        Ok(self.read_meta()?.birthdate_epoch_nsec)
    }

    /// Force journal data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Atomically rename the journal file.
    pub fn rename(&mut self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// An independent read-only view positioned invalid; several cursors may
    /// coexist and each sees the journal grow.
    pub fn cursor(&self) -> Result<Cursor> {
        Cursor::open(&self.path)
    }

    /// Iterator at record 0 (invalid when the journal has no records).
    pub fn begin(&self) -> Result<RecordIter> {
        let mut cursor = self.cursor()?;
        cursor.seek(0, Whence::Set)?;
        Ok(RecordIter::new(cursor))
    }

    /// Iterator one past the last record; always invalid.
    pub fn end(&self) -> Result<RecordIter> {
        let mut cursor = self.cursor()?;
        cursor.seek(0, Whence::End)?;
        Ok(RecordIter::new(cursor))
    }

    /// Alias for [`begin`](Self::begin), for `for`-loop use.
    pub fn records(&self) -> Result<RecordIter> {
        self.begin()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("journal_offset", &self.journal_offset)
            .field("cbor_size", &self.cbor_size)
            .finish()
    }
}
