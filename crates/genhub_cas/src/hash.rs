//! SHA-256 content hashes and helpers to compute them.

use std::{fmt, io::Write, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The SHA-256 hash of a piece of content. This is the key under which content
/// is stored in the CAS.
///
/// The hash is serialized as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "hex::serde")] [u8; 32]);

/// Error returned when parsing a [`ContentHash`] from a string fails.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("'{0}' is not a valid sha256 hex digest")]
pub struct ParseContentHashError(String);

impl ContentHash {
    /// Constructs a hash from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex representation of the hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ParseContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|_| ParseContentHashError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Computes the hash of an in-memory buffer.
pub fn compute_bytes_hash(bytes: impl AsRef<[u8]>) -> ContentHash {
    ContentHash(Sha256::digest(bytes).into())
}

/// Computes the hash of the file at the given path by streaming its contents.
pub fn compute_file_hash(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(ContentHash(hasher.finalize().into()))
}

/// A writer that forwards everything to an inner writer while computing the
/// hash of the bytes that pass through it.
pub struct HashingWriter<W> {
    writer: W,
    hasher: Sha256,
}

impl<W> HashingWriter<W> {
    /// Wraps the given writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
        }
    }

    /// Consumes the writer and returns the inner writer together with the hash
    /// of everything written.
    pub fn finalize(self) -> (W, ContentHash) {
        (self.writer, ContentHash(self.hasher.finalize().into()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_of_empty_content() {
        assert_eq!(
            compute_bytes_hash(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_and_display() {
        let hash = compute_bytes_hash(b"Hello, CAS!");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);

        assert!("not-a-hash".parse::<ContentHash>().is_err());
        assert!("abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let content = vec![7u8; 200 * 1024];
        std::fs::write(&path, &content).unwrap();

        assert_eq!(compute_file_hash(&path).unwrap(), compute_bytes_hash(&content));
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"Part 1").unwrap();
        writer.write_all(b" Part 2").unwrap();
        let (bytes, hash) = writer.finalize();
        assert_eq!(bytes, b"Part 1 Part 2");
        assert_eq!(hash, compute_bytes_hash(b"Part 1 Part 2"));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = compute_bytes_hash(b"");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(
            json,
            "\"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\""
        );
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"abcd\"").is_err());
    }
}
