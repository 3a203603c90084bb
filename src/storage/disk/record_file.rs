//! Length-prefixed record file
//!
//! Every record is a 4-byte big-endian length followed by that many payload
//! bytes. The file carries no other framing; the caller's descriptors are the
//! only source of record boundaries, so every read is validated against the
//! file length and the on-disk header.

use super::descriptor::SlotDescriptor;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the record length header
pub const HEADER_SIZE_BYTES: u64 = 4;

/// Chunk size used when relocating records
const MOVE_BUFFER_SIZE: usize = 16 * 1024;

/// Record-oriented accessor over a single file
pub struct RecordFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl RecordFile {
    /// Open or create a record file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

        debug!(path = ?path, "Opened record file");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Current file length in bytes
    pub fn length(&self) -> Result<u64> {
        let file = self.file.lock();
        Self::file_length(&file)
    }

    fn file_length(file: &File) -> Result<u64> {
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::Storage(format!("Failed to stat record file: {}", e)))
    }

    /// Read the payload of the record described by `slot`
    ///
    /// Any disagreement between the descriptor and the file is reported as
    /// [`Error::Corruption`].
    pub fn read(&self, slot: &SlotDescriptor) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let file_length = Self::file_length(&file)?;

        let header_end = slot.position.checked_add(HEADER_SIZE_BYTES);
        if header_end.map_or(true, |end| end > file_length) {
            return Err(Error::Corruption(format!(
                "{} header extends past end of file (length {})",
                slot, file_length
            )));
        }

        file.seek(SeekFrom::Start(slot.position))?;
        let mut len_bytes = [0u8; HEADER_SIZE_BYTES as usize];
        file.read_exact(&mut len_bytes)?;
        let recorded = u32::from_be_bytes(len_bytes);

        if recorded != slot.length {
            return Err(Error::Corruption(format!(
                "{} header records length {}",
                slot, recorded
            )));
        }
        if slot.checked_end().map_or(true, |end| end > file_length) {
            return Err(Error::Corruption(format!(
                "{} payload extends past end of file (length {})",
                slot, file_length
            )));
        }

        let mut data = vec![0u8; slot.length as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Write header and payload at the descriptor's position
    ///
    /// The payload length must equal `slot.length`.
    pub fn write(&self, slot: &SlotDescriptor, data: &[u8]) -> Result<()> {
        if data.len() != slot.length as usize {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not match {}",
                data.len(),
                slot
            )));
        }

        let mut record = Vec::with_capacity(data.len() + HEADER_SIZE_BYTES as usize);
        record.extend_from_slice(&slot.length.to_be_bytes());
        record.extend_from_slice(data);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(slot.position))?;
        file.write_all(&record)?;
        Ok(())
    }

    /// Relocate a record to `new_position` and update the descriptor
    ///
    /// Copies through a bounded buffer. Ranges may overlap: chunks are copied
    /// front to back when moving toward the start of the file and back to
    /// front otherwise. The descriptor only changes once the copy succeeded.
    pub fn move_record(&self, slot: &mut SlotDescriptor, new_position: u64) -> Result<()> {
        if slot.position == new_position {
            return Ok(());
        }

        let total = slot.record_size();
        let old_position = slot.position;
        let mut buffer = vec![0u8; MOVE_BUFFER_SIZE.min(total as usize)];
        let mut file = self.file.lock();

        let mut copy_chunk = |offset: u64, len: usize| -> Result<()> {
            let chunk = &mut buffer[..len];
            file.seek(SeekFrom::Start(old_position + offset))?;
            file.read_exact(chunk)?;
            file.seek(SeekFrom::Start(new_position + offset))?;
            file.write_all(chunk)?;
            Ok(())
        };

        if new_position < old_position {
            let mut done = 0u64;
            while done < total {
                let len = (total - done).min(MOVE_BUFFER_SIZE as u64) as usize;
                copy_chunk(done, len)?;
                done += len as u64;
            }
        } else {
            let mut remaining = total;
            while remaining > 0 {
                let len = remaining.min(MOVE_BUFFER_SIZE as u64) as usize;
                remaining -= len as u64;
                copy_chunk(remaining, len)?;
            }
        }

        slot.position = new_position;
        Ok(())
    }

    /// Truncate (or extend) the file to `length` bytes
    pub fn truncate(&self, length: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(length)
            .map_err(|e| Error::Storage(format!("Failed to truncate {}: {}", self.path.display(), e)))?;
        debug!(path = ?self.path, length, "Truncated record file");
        Ok(())
    }

    /// Truncate to zero
    pub fn reset(&self) -> Result<()> {
        self.truncate(0)
    }

    /// Flush file contents to disk
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Flush failed: {}", e)))
    }

    /// Flush and release the file handle
    pub fn close(self) -> Result<()> {
        self.sync()?;
        debug!(path = ?self.path, "Closed record file");
        Ok(())
    }
}

impl std::fmt::Debug for RecordFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFile").field("path", &self.path).finish()
    }
}
