//! Reproducible synthetic piece data and descriptors
//!
//! Every piece is produced by a ChaCha8 stream keyed by the generator seed and
//! selected by the piece index, so independently running nodes that generate
//! the same logical content end up byte-identical without coordination.

use std::sync::Arc;

use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{ContentDescriptor, ContentError, ContentLayout, PieceIndex, sha1_digest};

/// Directory prefix used for generated multi-file content.
pub const DEFAULT_BASE_NAME: &str = "test_dir";

/// Descriptor plus the bytes of every piece.
#[derive(Debug, Clone)]
pub struct GeneratedContent {
    pub descriptor: Arc<ContentDescriptor>,
    pub pieces: Vec<Bytes>,
}

impl GeneratedContent {
    /// Concatenated content bytes in layout order.
    pub fn concatenated(&self) -> Vec<u8> {
        self.pieces.iter().flat_map(|piece| piece.iter().copied()).collect()
    }
}

/// Deterministic content generator.
#[derive(Debug, Clone)]
pub struct ContentGenerator {
    seed: u64,
    base_name: String,
}

impl ContentGenerator {
    /// Creates generator whose output is a pure function of `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            base_name: DEFAULT_BASE_NAME.to_string(),
        }
    }

    /// Overrides the directory prefix of generated test files.
    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Produces the bytes of one piece.
    ///
    /// Identical `(seed, index, size)` always yields identical bytes, and a
    /// shorter piece is a prefix of a longer one with the same index.
    pub fn piece_data(&self, index: PieceIndex, size: u32) -> Bytes {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(u64::from(index.as_u32()));

        let mut data = vec![0u8; size as usize];
        rng.fill_bytes(&mut data);
        Bytes::from(data)
    }

    /// Generates multi-file test content.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Empty size list or zero piece size
    pub fn generate(
        &self,
        file_sizes: &[u64],
        piece_size: u32,
    ) -> Result<GeneratedContent, ContentError> {
        let layout = ContentLayout::test_files(file_sizes, piece_size, &self.base_name)?;
        self.generate_layout(&self.base_name, layout)
    }

    /// Generates content for an arbitrary layout.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Layout and hash count disagree
    pub fn generate_layout(
        &self,
        name: &str,
        layout: ContentLayout,
    ) -> Result<GeneratedContent, ContentError> {
        let mut pieces = Vec::with_capacity(layout.piece_count() as usize);
        let mut piece_hashes = Vec::with_capacity(layout.piece_count() as usize);

        for piece in 0..layout.piece_count() {
            let index = PieceIndex::new(piece);
            let data = self.piece_data(index, layout.piece_size(index)?);
            piece_hashes.push(sha1_digest(&data));
            pieces.push(data);
        }

        let descriptor = ContentDescriptor::new(name, layout, piece_hashes)?;

        tracing::debug!(
            "Generated content {} ({} bytes, {} pieces, seed {})",
            descriptor.info_hash,
            descriptor.layout.total_size(),
            pieces.len(),
            self.seed
        );

        Ok(GeneratedContent {
            descriptor: Arc::new(descriptor),
            pieces,
        })
    }
}

/// Generates multi-file test content from `seed`.
///
/// # Errors
///
/// - `ContentError::InvalidLayout` - Empty size list or zero piece size
pub fn generate(
    file_sizes: &[u64],
    piece_size: u32,
    seed: u64,
) -> Result<GeneratedContent, ContentError> {
    ContentGenerator::new(seed).generate(file_sizes, piece_size)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_generation_is_idempotent() {
        let first = generate(&[1000, 40_000, 7], 16_384, 7).unwrap();
        let second = generate(&[1000, 40_000, 7], 16_384, 7).unwrap();

        assert_eq!(first.pieces, second.pieces);
        assert_eq!(first.descriptor, second.descriptor);
    }

    #[test]
    fn test_seed_changes_content() {
        let a = generate(&[1000], 16_384, 1).unwrap();
        let b = generate(&[1000], 16_384, 2).unwrap();

        assert_ne!(a.pieces[0], b.pieces[0]);
        assert_ne!(a.descriptor.info_hash, b.descriptor.info_hash);
    }

    #[test]
    fn test_pieces_differ_by_index() {
        let generator = ContentGenerator::new(0);
        let first = generator.piece_data(PieceIndex::new(0), 64);
        let second = generator.piece_data(PieceIndex::new(1), 64);
        assert_ne!(first, second);
    }

    #[test]
    fn test_short_piece_is_prefix() {
        let generator = ContentGenerator::new(3);
        let full = generator.piece_data(PieceIndex::new(4), 256);
        let short = generator.piece_data(PieceIndex::new(4), 100);
        assert_eq!(&full[..100], &short[..]);
    }

    #[test]
    fn test_hashes_verify_generated_pieces() {
        let content = generate(&[1000, 20_000], 16_384, 11).unwrap();
        assert_eq!(content.descriptor.piece_count(), 2);
        for (i, piece) in content.pieces.iter().enumerate() {
            assert!(content.descriptor.verify_piece(PieceIndex::new(i as u32), piece));
        }
        assert_eq!(content.concatenated().len(), 21_000);
    }

    #[test]
    fn test_empty_sizes_rejected() {
        assert!(matches!(
            generate(&[], 16_384, 0),
            Err(ContentError::InvalidLayout { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_piece_sizes_match_layout(
            sizes in proptest::collection::vec(1u64..20_000, 1..6),
            piece_size in 1024u32..32_768,
            seed in any::<u64>(),
        ) {
            let content = generate(&sizes, piece_size, seed).unwrap();
            let layout = &content.descriptor.layout;
            prop_assert_eq!(content.pieces.len() as u32, layout.piece_count());
            let total: usize = content.pieces.iter().map(|p| p.len()).sum();
            prop_assert_eq!(total as u64, sizes.iter().sum::<u64>());
        }
    }
}
