//! SHA-256 content hashing for files, readers, and byte slices

use cdrop_core::{ChunkObserver, CryptoError};
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Digest length in bytes
pub const HASH_SIZE: usize = 32;

/// A SHA-256 digest, displayed as 64 lowercase hex chars
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash(Sha256::digest(data).into())
}

/// Hash everything `reader` yields, `chunk_size` bytes at a time.
///
/// Single pass, no seeking. The observer sees every chunk and may abort.
pub fn hash_reader<R: Read, O: ChunkObserver>(
    mut reader: R,
    chunk_size: usize,
    mut observer: O,
) -> Result<ContentHash, CryptoError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CryptoError::Io(e)),
        };
        hasher.update(&buf[..n]);
        observer.chunk(n)?;
    }

    Ok(ContentHash(hasher.finalize().into()))
}

/// Hash a file from disk using the streaming interface.
pub fn hash_file<O: ChunkObserver>(
    path: &Path,
    chunk_size: usize,
    mut observer: O,
) -> Result<ContentHash, CryptoError> {
    let file = std::fs::File::open(path).map_err(|e| {
        tracing::debug!(path = %path.display(), "open for hashing failed: {e}");
        CryptoError::Io(e)
    })?;
    let total = file.metadata().map(|m| m.len()).ok();
    observer.begin(total);

    let hash = hash_reader(file, chunk_size, &mut observer)?;
    tracing::debug!(path = %path.display(), hash = %hash, "hashed");
    Ok(hash)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hash.to_hex()
}

/// Parse a 64-char hex string into a ContentHash
pub fn hash_from_hex(text: &str) -> Result<ContentHash, CryptoError> {
    let mut bytes = [0u8; HASH_SIZE];
    hex::decode_to_slice(text, &mut bytes)
        .map_err(|e| CryptoError::Malformed(format!("invalid SHA-256 hex '{text}': {e}")))?;
    Ok(ContentHash(bytes))
}
