use std::fs::File;
use std::io::{self, Read};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for node keys.
pub type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 digest used for change detection and content addressing.
///
/// In `tatara`, this serves two purposes:
/// 1. It fingerprints "the inputs that produced this node's output", so two
///    runs can be compared to decide whether a node is stale.
/// 2. It addresses entries in the artifact cache, where the hex rendering of
///    the signature becomes the file name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature([u8; 32]);

impl<T> From<T> for Signature
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Signature(value.into())
    }
}

impl Signature {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a file by streaming it through the hasher `chunk_size` bytes at
    /// a time, so memory use stays flat regardless of the file size.
    pub fn hash_file(path: impl AsRef<Utf8Path>, chunk_size: usize) -> io::Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; chunk_size.max(1)];

        loop {
            let read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..read]);
        }

        Ok(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi << 4 | lo) as u8;
        }

        Some(Signature(bytes))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental BLAKE3 hasher for folding several fields into one
/// [`Signature`].
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    /// Feeds a length-prefixed field, keeping `("ab", "c")` and `("a", "bc")`
    /// distinct.
    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Signature {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Signature::from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let sig = Signature::hash(b"hello");
        let hex = sig.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Signature::from_hex(&hex), Some(sig));
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert_eq!(Signature::from_hex("abc"), None);
        assert_eq!(Signature::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn test_chunked_file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("blob")).unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let expected = Signature::hash(&data);
        assert_eq!(Signature::hash_file(&path, 7).unwrap(), expected);
        assert_eq!(Signature::hash_file(&path, 64 * 1024).unwrap(), expected);
    }

    #[test]
    fn test_fields_are_length_prefixed() {
        let mut a = Blake3Hasher::default();
        a.field("ab").field("c");
        let mut b = Blake3Hasher::default();
        b.field("a").field("bc");
        assert_ne!(Signature::from(a), Signature::from(b));
    }
}
