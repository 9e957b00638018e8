//! Append-only frame journal.
//!
//! ## Frame format
//!
//! ```text
//! | magic (2) | payload_len u32 LE (4) | crc32 u32 LE (4) | payload |
//! ```
//!
//! The CRC covers the payload only. A journal is a plain concatenation of
//! frames; there is no file header.
//!
//! ## Recovery
//!
//! A crash can leave the last frame half written. On open, a trailing frame
//! that is incomplete or fails its checksum is cut off and the journal
//! continues from the last good frame. A bad frame that is *followed* by more
//! data cannot be explained by a torn write and is reported as corruption.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use tracing::warn;

/// Magic bytes at the start of every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"LM";

/// Size of the frame header (magic + length + crc).
pub const FRAME_HEADER_SIZE: usize = 2 + 4 + 4;

/// A checksummed append-only journal over a [`StorageBackend`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    frame_count: u64,
}

impl Journal {
    /// Opens a journal, validating every frame and truncating a torn tail.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if a frame other than the last
    /// one fails validation.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let (frames, valid_len) = scan(backend.as_ref())?;
        let size = backend.size()?;

        if valid_len < size {
            warn!(
                valid_len,
                size, "truncating torn journal tail left by an interrupted write"
            );
            backend.truncate(valid_len)?;
        }

        Ok(Self {
            backend,
            frame_count: frames.len() as u64,
        })
    }

    /// Appends one frame and syncs it to durable storage.
    pub fn append_frame(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&compute_crc32(payload).to_le_bytes());
        frame.extend_from_slice(payload);

        let offset = self.backend.append(&frame)?;
        self.backend.sync()?;
        self.frame_count += 1;
        Ok(offset)
    }

    /// Reads the payloads of all frames in append order.
    pub fn read_frames(&self) -> StorageResult<Vec<Vec<u8>>> {
        let (frames, _) = scan(self.backend.as_ref())?;
        Ok(frames)
    }

    /// Number of frames currently in the journal.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Size of the journal in bytes.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }
}

/// Scans all frames, returning the valid payloads and the byte length they cover.
fn scan(backend: &dyn StorageBackend) -> StorageResult<(Vec<Vec<u8>>, u64)> {
    let size = backend.size()?;
    let mut frames = Vec::new();
    let mut offset = 0u64;

    while offset < size {
        let remaining = size - offset;
        if remaining < FRAME_HEADER_SIZE as u64 {
            break;
        }

        let header = backend.read_at(offset, FRAME_HEADER_SIZE)?;
        if header[0..2] != FRAME_MAGIC {
            return Err(StorageError::Corrupted {
                offset,
                reason: "bad frame magic".into(),
            });
        }

        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as u64;
        let expected_crc = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
        let frame_end = offset + FRAME_HEADER_SIZE as u64 + len;

        if frame_end > size {
            break;
        }

        let payload = backend.read_at(offset + FRAME_HEADER_SIZE as u64, len as usize)?;
        let actual_crc = compute_crc32(&payload);
        if actual_crc != expected_crc {
            if frame_end == size {
                break;
            }
            return Err(StorageError::Corrupted {
                offset,
                reason: format!(
                    "checksum mismatch: expected {expected_crc:08x}, got {actual_crc:08x}"
                ),
            });
        }

        frames.push(payload);
        offset = frame_end;
    }

    Ok((frames, offset))
}

/// Computes a CRC32 (IEEE polynomial) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
