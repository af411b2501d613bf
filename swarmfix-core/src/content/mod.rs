//! Deterministic synthetic content for fixtures
//!
//! Content is described by a [`ContentDescriptor`] (layout, piece hashes and
//! info hash) that engines consume when content is added, and materialised on
//! disk through [`ContentStorage`].

pub mod generator;
pub mod layout;
pub mod storage;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

pub use generator::{ContentGenerator, DEFAULT_BASE_NAME, GeneratedContent, generate};
pub use layout::{ContentLayout, FileEntry, FileSlice};
pub use storage::{ContentStorage, DEFAULT_LOAD_LIMIT, load_file};

/// SHA-1 hash identifying a unique piece of content.
///
/// 20-byte SHA-1 hash of the canonical info dictionary. Used by engines to
/// identify content across the swarm and by metadata-only adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidHash` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, ContentError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut hash).map_err(|e| ContentError::InvalidHash {
            value: hex_str.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(hash))
    }

    /// Draws a uniformly random hash.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        InfoHash::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Zero-based index of a piece within content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while generating, describing or storing content.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Invalid content layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("Piece {index} out of range ({piece_count} pieces)")]
    PieceOutOfRange { index: PieceIndex, piece_count: u32 },

    #[error("Piece {index} has {actual} bytes, expected {expected}")]
    PieceSizeMismatch {
        index: PieceIndex,
        expected: u32,
        actual: usize,
    },

    #[error("Invalid hash {value}: {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("{path} is {size} bytes, over the {limit} byte load limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Complete description of synthetic content handed to engines.
///
/// Deterministic function of the layout and the piece bytes: the same
/// generator inputs always produce the same descriptor, including its
/// info hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub info_hash: InfoHash,
    pub name: String,
    pub layout: ContentLayout,
    #[serde(with = "hex_hashes")]
    pub piece_hashes: Vec<[u8; 20]>,
}

impl ContentDescriptor {
    /// Builds a descriptor from a layout and its per-piece hashes.
    ///
    /// # Errors
    ///
    /// - `ContentError::InvalidLayout` - Hash count differs from piece count
    pub fn new(
        name: impl Into<String>,
        layout: ContentLayout,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, ContentError> {
        if piece_hashes.len() != layout.piece_count() as usize {
            return Err(ContentError::InvalidLayout {
                reason: format!(
                    "{} piece hashes for {} pieces",
                    piece_hashes.len(),
                    layout.piece_count()
                ),
            });
        }

        let name = name.into();
        let info_hash = info_hash_of(&name, &layout, &piece_hashes);
        Ok(Self {
            info_hash,
            name,
            layout,
            piece_hashes,
        })
    }

    /// Returns number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.layout.piece_count()
    }

    /// Returns expected SHA-1 of a piece.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_u32() as usize)
    }

    /// Checks piece bytes against the announced hash.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        self.piece_hash(index)
            .is_some_and(|expected| sha1_digest(data) == *expected)
    }
}

/// SHA-1 of a byte slice as a fixed array.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash = hasher.finalize();

    let mut hash_array = [0u8; 20];
    hash_array.copy_from_slice(&hash[..20]);
    hash_array
}

/// Hashes the canonical bencoded info dictionary.
///
/// Keys are emitted in sorted order: `files`, `name`, `piece length`,
/// `pieces`. Single-file content uses `length` instead of `files`.
fn info_hash_of(name: &str, layout: &ContentLayout, piece_hashes: &[[u8; 20]]) -> InfoHash {
    fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(bytes.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(bytes);
    }

    fn push_int(out: &mut Vec<u8>, value: u64) {
        out.push(b'i');
        out.extend_from_slice(value.to_string().as_bytes());
        out.push(b'e');
    }

    let mut info_dict = vec![b'd'];

    match layout.files() {
        [single] if single.path.components().count() == 1 => {
            push_bytes(&mut info_dict, b"length");
            push_int(&mut info_dict, single.length);
        }
        files => {
            push_bytes(&mut info_dict, b"files");
            info_dict.push(b'l');
            for file in files {
                info_dict.push(b'd');
                push_bytes(&mut info_dict, b"length");
                push_int(&mut info_dict, file.length);
                push_bytes(&mut info_dict, b"path");
                info_dict.push(b'l');
                for component in file.path.components() {
                    push_bytes(
                        &mut info_dict,
                        component.as_os_str().to_string_lossy().as_bytes(),
                    );
                }
                info_dict.extend_from_slice(b"ee");
            }
            info_dict.push(b'e');
        }
    }

    push_bytes(&mut info_dict, b"name");
    push_bytes(&mut info_dict, name.as_bytes());
    push_bytes(&mut info_dict, b"piece length");
    push_int(&mut info_dict, u64::from(layout.piece_length()));
    push_bytes(&mut info_dict, b"pieces");
    push_bytes(&mut info_dict, &piece_hashes.concat());
    info_dict.push(b'e');

    InfoHash::new(sha1_digest(&info_dict))
}

mod hex_hashes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hashes: &[[u8; 20]], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(hashes.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<[u8; 20]>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|value| {
                let mut hash = [0u8; 20];
                hex::decode_to_slice(value, &mut hash).map_err(serde::de::Error::custom)?;
                Ok(hash)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(
            InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap(),
            info_hash
        );
    }

    #[test]
    fn test_info_hash_rejects_short_hex() {
        assert!(matches!(
            InfoHash::from_hex("abcd"),
            Err(ContentError::InvalidHash { .. })
        ));
    }

    #[test]
    fn test_descriptor_requires_hash_per_piece() {
        let layout = ContentLayout::single_file("temporary", 40_000, 16_384).unwrap();
        let result = ContentDescriptor::new("temporary", layout, vec![[0u8; 20]; 2]);
        assert!(matches!(result, Err(ContentError::InvalidLayout { .. })));
    }

    #[test]
    fn test_info_hash_depends_on_piece_hashes() {
        let layout = ContentLayout::single_file("temporary", 1000, 16_384).unwrap();
        let a = ContentDescriptor::new("temporary", layout.clone(), vec![[1u8; 20]]).unwrap();
        let b = ContentDescriptor::new("temporary", layout, vec![[2u8; 20]]).unwrap();
        assert_ne!(a.info_hash, b.info_hash);
    }

    #[test]
    fn test_descriptor_json_uses_hex() {
        let layout = ContentLayout::single_file("temporary", 1000, 16_384).unwrap();
        let descriptor = ContentDescriptor::new("temporary", layout, vec![[0xab; 20]]).unwrap();

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["piece_hashes"][0], "ab".repeat(20));
        assert_eq!(json["info_hash"], descriptor.info_hash.to_string());

        let decoded: ContentDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, descriptor);
    }
}
