//! Piece storage across the files of a content layout

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{ContentDescriptor, ContentError, ContentLayout, PieceIndex};

/// Reads and writes pieces below a save directory.
///
/// Each piece is split over the files it spans according to the layout, so
/// the resulting tree is exactly what an engine expects to find when content
/// is added in seed mode.
#[derive(Debug, Clone)]
pub struct ContentStorage {
    root: PathBuf,
    layout: Arc<ContentLayout>,
}

impl ContentStorage {
    /// Creates storage rooted at `root` for the given layout.
    pub fn new(root: impl Into<PathBuf>, layout: Arc<ContentLayout>) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    /// Writes one piece into the files it spans.
    ///
    /// Parent directories are created as needed and existing file contents
    /// outside the piece are preserved.
    ///
    /// # Errors
    ///
    /// - `ContentError::PieceOutOfRange` - Index beyond the last piece
    /// - `ContentError::PieceSizeMismatch` - Data length differs from piece size
    /// - `ContentError::Io` - Directory creation or file write failed
    pub async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), ContentError> {
        let expected = self.layout.piece_size(index)?;
        if data.len() != expected as usize {
            return Err(ContentError::PieceSizeMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        let mut consumed = 0usize;
        for slice in self.layout.file_slices(index)? {
            let path = self.root.join(&self.layout.files()[slice.file_index].path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
            }

            let mut file = fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            file.seek(SeekFrom::Start(slice.file_offset))
                .await
                .map_err(|e| io_error(&path, e))?;

            let end = consumed + slice.length as usize;
            file.write_all(&data[consumed..end])
                .await
                .map_err(|e| io_error(&path, e))?;
            file.flush().await.map_err(|e| io_error(&path, e))?;
            consumed = end;
        }

        Ok(())
    }

    /// Reads one piece back from disk.
    ///
    /// # Errors
    ///
    /// - `ContentError::PieceOutOfRange` - Index beyond the last piece
    /// - `ContentError::Io` - A spanned file is missing or too short
    pub async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, ContentError> {
        let size = self.layout.piece_size(index)?;
        let mut data = vec![0u8; size as usize];

        let mut consumed = 0usize;
        for slice in self.layout.file_slices(index)? {
            let path = self.root.join(&self.layout.files()[slice.file_index].path);
            let mut file = fs::File::open(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            file.seek(SeekFrom::Start(slice.file_offset))
                .await
                .map_err(|e| io_error(&path, e))?;

            let end = consumed + slice.length as usize;
            file.read_exact(&mut data[consumed..end])
                .await
                .map_err(|e| io_error(&path, e))?;
            consumed = end;
        }

        Ok(Bytes::from(data))
    }

    /// Writes every piece in order.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Piece count differs from the layout
    /// - `ContentError::PieceSizeMismatch` - A piece has the wrong length
    /// - `ContentError::Io` - File write failed
    pub async fn write_all(&self, pieces: &[Bytes]) -> Result<(), ContentError> {
        if pieces.len() != self.layout.piece_count() as usize {
            return Err(ContentError::InvalidLayout {
                reason: format!(
                    "{} pieces supplied for {} in layout",
                    pieces.len(),
                    self.layout.piece_count()
                ),
            });
        }

        // Zero-length files are never touched by a piece but must still exist
        for file in self.layout.files().iter().filter(|file| file.length == 0) {
            let path = self.root.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
            }
            fs::File::create(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
        }

        for (i, piece) in pieces.iter().enumerate() {
            self.write_piece(PieceIndex::new(i as u32), piece).await?;
        }

        tracing::debug!(
            "Wrote {} pieces ({} bytes) under {}",
            pieces.len(),
            self.layout.total_size(),
            self.root.display()
        );
        Ok(())
    }

    /// Checks whether the on-disk piece matches the descriptor hash.
    ///
    /// Missing or truncated files count as a failed verification.
    pub async fn verify_piece(&self, index: PieceIndex, descriptor: &ContentDescriptor) -> bool {
        match self.read_piece(index).await {
            Ok(data) => descriptor.verify_piece(index, &data),
            Err(e) => {
                tracing::trace!("Piece {} unavailable: {}", index, e);
                false
            }
        }
    }
}

/// Size cap used when callers have no better bound.
pub const DEFAULT_LOAD_LIMIT: u64 = 8_000_000;

/// Reads a whole file, refusing anything larger than `limit` bytes.
///
/// # Errors
///
/// - `ContentError::TooLarge` - File holds more than `limit` bytes
/// - `ContentError::Io` - File missing or unreadable
pub async fn load_file(path: impl AsRef<Path>, limit: u64) -> Result<Vec<u8>, ContentError> {
    let path = path.as_ref();
    let file = fs::File::open(path).await.map_err(|e| io_error(path, e))?;
    let size = file.metadata().await.map_err(|e| io_error(path, e))?.len();
    if size > limit {
        return Err(ContentError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }

    // The file may grow between the size check and the read
    let mut data = Vec::with_capacity(size as usize);
    file.take(limit + 1)
        .read_to_end(&mut data)
        .await
        .map_err(|e| io_error(path, e))?;
    if data.len() as u64 > limit {
        return Err(ContentError::TooLarge {
            path: path.to_path_buf(),
            size: data.len() as u64,
            limit,
        });
    }

    tracing::trace!("Loaded {} bytes from {}", data.len(), path.display());
    Ok(data)
}

fn io_error(path: &Path, source: std::io::Error) -> ContentError {
    ContentError::Io {
        path: path.to_path_buf(),
        source,
    }
}
