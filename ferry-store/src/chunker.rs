//! Lazy chunked reads over a stored blob.
//!
//! A [`ChunkReader`] yields fixed-size chunks one at a time so memory stays
//! bounded regardless of file size, and can restart from any chunk offset
//! when a transfer resumes.

use std::io::SeekFrom;
use std::path::Path;

use ferry_protocol::error::{FerryError, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Sequential fixed-size chunk reader over one blob file.
pub struct ChunkReader {
    file: tokio::fs::File,
    file_size: u64,
    chunk_size: u32,
    next_index: u32,
    chunk_count: u32,
}

impl ChunkReader {
    /// Open a reader positioned at chunk 0.
    pub(crate) async fn open(path: &Path, file_size: u64, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(FerryError::Storage("chunk size must be non-zero".into()));
        }
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FerryError::Storage(format!("failed to open {}: {e}", path.display())))?;
        let chunk_count = file_size.div_ceil(chunk_size as u64) as u32;
        Ok(Self {
            file,
            file_size,
            chunk_size,
            next_index: 0,
            chunk_count,
        })
    }

    /// Total number of chunks in the blob.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Index of the chunk the next [`ChunkReader::next_chunk`] call returns.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Reposition so the next read returns chunk `index`.
    pub async fn seek_to(&mut self, index: u32) -> Result<()> {
        if index > self.chunk_count {
            return Err(FerryError::Storage(format!(
                "chunk index {index} out of range ({} chunks)",
                self.chunk_count
            )));
        }
        let offset = index as u64 * self.chunk_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FerryError::Storage(format!("seek failed: {e}")))?;
        self.next_index = index;
        Ok(())
    }

    /// Read the next chunk, or `None` past the end of the blob.
    ///
    /// The final chunk may be shorter than the configured chunk size.
    pub async fn next_chunk(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        if self.next_index >= self.chunk_count {
            return Ok(None);
        }
        let offset = self.next_index as u64 * self.chunk_size as u64;
        let remaining = self.file_size - offset;
        let len = remaining.min(self.chunk_size as u64) as usize;

        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .await
            .map_err(|e| FerryError::Storage(format!("chunk read failed: {e}")))?;

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some((index, buf)))
    }
}
