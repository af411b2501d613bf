//! File layout and piece geometry of synthetic content

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ContentError, PieceIndex};

/// Number of generated test files placed in each directory.
const FILES_PER_DIRECTORY: usize = 5;

/// One file of the content, positioned in the concatenated byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the save directory
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte within the concatenated content
    pub offset: u64,
}

/// Portion of a piece that lives in a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Ordered files split into fixed-size pieces.
///
/// The final piece may be shorter than `piece_length`; every other piece is
/// exactly `piece_length` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLayout {
    files: Vec<FileEntry>,
    piece_length: u32,
    total_size: u64,
}

impl ContentLayout {
    /// Creates an empty layout with the given piece length.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Piece length is zero
    pub fn new(piece_length: u32) -> Result<Self, ContentError> {
        if piece_length == 0 {
            return Err(ContentError::InvalidLayout {
                reason: "piece length must be positive".to_string(),
            });
        }

        Ok(Self {
            files: Vec::new(),
            piece_length,
            total_size: 0,
        })
    }

    /// Creates a layout holding one file.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Piece length is zero or too many pieces
    pub fn single_file(
        name: impl Into<PathBuf>,
        length: u64,
        piece_length: u32,
    ) -> Result<Self, ContentError> {
        let mut layout = Self::new(piece_length)?;
        layout.add_file(name, length)?;
        Ok(layout)
    }

    /// Creates the multi-file layout used by generated test content.
    ///
    /// File `i` is named `test<i>` and placed in directory
    /// `<base_name><i / 5>`, so every five files share a directory.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Piece length is zero, no files given or too many pieces
    pub fn test_files(
        file_sizes: &[u64],
        piece_length: u32,
        base_name: &str,
    ) -> Result<Self, ContentError> {
        if file_sizes.is_empty() {
            return Err(ContentError::InvalidLayout {
                reason: "at least one file size is required".to_string(),
            });
        }

        let mut layout = Self::new(piece_length)?;
        for (i, &size) in file_sizes.iter().enumerate() {
            let directory = format!("{base_name}{}", i / FILES_PER_DIRECTORY);
            layout.add_file(Path::new(&directory).join(format!("test{i}")), size)?;
        }
        Ok(layout)
    }

    /// Appends a file at the end of the content.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Content would need more than `u32::MAX` pieces
    pub fn add_file(&mut self, path: impl Into<PathBuf>, length: u64) -> Result<(), ContentError> {
        let path = path.into();
        let total_size = self
            .total_size
            .checked_add(length)
            .filter(|&total| total.div_ceil(u64::from(self.piece_length)) <= u64::from(u32::MAX))
            .ok_or_else(|| ContentError::InvalidLayout {
                reason: format!(
                    "{} makes the content exceed {} pieces of {} bytes",
                    path.display(),
                    u32::MAX,
                    self.piece_length
                ),
            })?;

        self.files.push(FileEntry {
            path,
            length,
            offset: self.total_size,
        });
        self.total_size = total_size;
        Ok(())
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Returns number of pieces, rounding up for a partial final piece.
    ///
    /// `add_file` keeps the count within `u32`; a deserialized layout that
    /// does not saturates at `u32::MAX`.
    pub fn piece_count(&self) -> u32 {
        u32::try_from(self.total_size.div_ceil(u64::from(self.piece_length))).unwrap_or(u32::MAX)
    }

    /// Returns the size in bytes of a specific piece.
    ///
    /// # Errors
    ///
    /// - `ContentError::PieceOutOfRange` - Index beyond the last piece
    pub fn piece_size(&self, index: PieceIndex) -> Result<u32, ContentError> {
        let offset = self.piece_offset(index)?;
        let remaining = self.total_size - offset;
        Ok(remaining.min(u64::from(self.piece_length)) as u32)
    }

    /// Returns the byte offset where a piece starts.
    ///
    /// # Errors
    ///
    /// - `ContentError::PieceOutOfRange` - Index beyond the last piece
    pub fn piece_offset(&self, index: PieceIndex) -> Result<u64, ContentError> {
        let piece_count = self.piece_count();
        if index.as_u32() >= piece_count {
            return Err(ContentError::PieceOutOfRange { index, piece_count });
        }
        Ok(u64::from(index.as_u32()) * u64::from(self.piece_length))
    }

    /// Maps a piece onto the file regions it covers, in order.
    ///
    /// Zero-length files never appear in the result.
    ///
    /// # Errors
    ///
    /// - `ContentError::PieceOutOfRange` - Index beyond the last piece
    pub fn file_slices(&self, index: PieceIndex) -> Result<Vec<FileSlice>, ContentError> {
        let mut position = self.piece_offset(index)?;
        let end = position + u64::from(self.piece_size(index)?);
        let mut slices = Vec::new();

        for (file_index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file.length == 0 || file_end <= position {
                continue;
            }
            if file.offset >= end {
                break;
            }

            let slice_end = end.min(file_end);
            slices.push(FileSlice {
                file_index,
                file_offset: position - file.offset,
                length: slice_end - position,
            });
            position = slice_end;
        }

        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_piece_count_rounds_up() {
        let layout = ContentLayout::single_file("temporary", 40_000, 16_384).unwrap();
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.piece_size(PieceIndex::new(0)).unwrap(), 16_384);
        assert_eq!(layout.piece_size(PieceIndex::new(2)).unwrap(), 40_000 - 2 * 16_384);
        assert!(layout.piece_size(PieceIndex::new(3)).is_err());
    }

    #[test]
    fn test_single_small_file_is_one_short_piece() {
        let layout = ContentLayout::single_file("temporary", 1000, 16_384).unwrap();
        assert_eq!(layout.piece_count(), 1);
        assert_eq!(layout.piece_size(PieceIndex::new(0)).unwrap(), 1000);
    }

    #[test]
    fn test_zero_piece_length_rejected() {
        assert!(ContentLayout::new(0).is_err());
    }

    #[test]
    fn test_piece_count_overflow_rejected() {
        let max = u64::from(u32::MAX);
        let layout = ContentLayout::single_file("huge", max, 1).unwrap();
        assert_eq!(layout.piece_count(), u32::MAX);

        let result = ContentLayout::single_file("huge", max + 1, 1);
        assert!(matches!(result, Err(ContentError::InvalidLayout { .. })));

        let mut layout = ContentLayout::new(1).unwrap();
        layout.add_file("a", max).unwrap();
        assert!(layout.add_file("b", 1).is_err());
        assert_eq!(layout.files().len(), 1);
        assert_eq!(layout.total_size(), max);

        assert!(ContentLayout::test_files(&[u64::MAX, 1], 16_384, "d").is_err());
    }

    #[test]
    fn test_test_files_grouped_by_five() {
        let sizes = [10u64; 7];
        let layout = ContentLayout::test_files(&sizes, 16, "test_dir").unwrap();

        assert_eq!(layout.files()[0].path, PathBuf::from("test_dir0/test0"));
        assert_eq!(layout.files()[4].path, PathBuf::from("test_dir0/test4"));
        assert_eq!(layout.files()[5].path, PathBuf::from("test_dir1/test5"));
        assert_eq!(layout.files()[6].offset, 60);
        assert_eq!(layout.total_size(), 70);
    }

    #[test]
    fn test_piece_spanning_files() {
        let layout = ContentLayout::test_files(&[10, 0, 5, 20], 16, "d").unwrap();
        let slices = layout.file_slices(PieceIndex::new(0)).unwrap();

        assert_eq!(
            slices,
            vec![
                FileSlice {
                    file_index: 0,
                    file_offset: 0,
                    length: 10
                },
                FileSlice {
                    file_index: 2,
                    file_offset: 0,
                    length: 5
                },
                FileSlice {
                    file_index: 3,
                    file_offset: 0,
                    length: 1
                },
            ]
        );

        let last = layout.file_slices(PieceIndex::new(2)).unwrap();
        assert_eq!(
            last,
            vec![FileSlice {
                file_index: 3,
                file_offset: 17,
                length: 3
            }]
        );
    }

    proptest! {
        #[test]
        fn prop_slices_cover_every_byte_once(
            sizes in proptest::collection::vec(0u64..5000, 1..12),
            piece_length in 1u32..4096,
        ) {
            let layout = ContentLayout::test_files(&sizes, piece_length, "d").unwrap();
            let mut covered = 0u64;
            for piece in 0..layout.piece_count() {
                let index = PieceIndex::new(piece);
                let slices = layout.file_slices(index).unwrap();
                let piece_bytes: u64 = slices.iter().map(|s| s.length).sum();
                prop_assert_eq!(piece_bytes, u64::from(layout.piece_size(index).unwrap()));
                covered += piece_bytes;
            }
            prop_assert_eq!(covered, layout.total_size());
        }
    }
}
