//! Piece storage
//!
//! A single output file preallocated to the payload length, written with
//! positional I/O. Every write targets the byte range of one piece, so
//! concurrent writers for different pieces never interfere and no shared
//! cursor exists to race on. The synchronous `FileExt` calls run on the
//! blocking pool.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ClientError, Result, StorageErrorKind};

/// Preallocated random-access store for verified pieces
#[derive(Debug, Clone)]
pub struct PieceStore {
    file: Arc<File>,
    path: PathBuf,
    total_length: u64,
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut offset: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

impl PieceStore {
    /// Create or open the file at `path` read-write and truncate it to
    /// exactly `total_length` bytes.
    pub async fn open(path: impl AsRef<Path>, total_length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();

        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&open_path)?;
            file.set_len(total_length)?;
            Ok(file)
        })
        .await?
        .map_err(|e| {
            ClientError::storage(
                StorageErrorKind::Io,
                &path,
                format!("Failed to open output file: {}", e),
            )
        })?;

        Ok(Self {
            file: Arc::new(file),
            path,
            total_length,
        })
    }

    /// Write `data` at the absolute byte `offset`
    pub async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        if offset + data.len() as u64 > self.total_length {
            return Err(ClientError::storage(
                StorageErrorKind::Io,
                &self.path,
                format!(
                    "Write out of bounds: offset {} + {} bytes > {} total",
                    offset,
                    data.len(),
                    self.total_length
                ),
            ));
        }

        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_at(&file, offset, &data))
            .await?
            .map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, path, format!("Write failed: {}", e))
            })
    }

    /// Read `length` bytes at the absolute byte `offset`
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; length];
            read_at(&file, offset, &mut buf)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await?
        .map_err(|e| ClientError::storage(StorageErrorKind::Io, path, format!("Read failed: {}", e)))
    }

    /// Flush file contents to disk
    pub async fn sync(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || file.sync_all())
            .await?
            .map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, path, format!("Sync failed: {}", e))
            })
    }

    /// Total file length the store was opened with
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
