//! cdrop-digest: streaming SHA-256 used as a content address
//!
//! The ciphertext digest is the lookup key in the remote record store; the
//! plaintext digest is the integrity check the store confirms after a
//! decrypt. Both are computed in a single forward pass over fixed-size
//! chunks, so files of any size hash in constant memory.

pub mod sha256;

pub use sha256::{
    hash_bytes, hash_file, hash_from_hex, hash_reader, hash_to_hex, ContentHash, HASH_SIZE,
};
