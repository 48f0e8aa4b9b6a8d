//! cdrop-crypto: streaming asymmetric file encryption
//!
//! Scheme: ECIES-style hybrid over secp256k1
//!
//! ```text
//! ephemeral keypair (e, E)
//! shared   = ECDH(e, recipient_public).x
//! okm      = HKDF-SHA256(ikm = shared, salt = E, info = "cdrop-ecies-stream-v1")
//! key      = okm[0..32], nonce = okm[32..44]
//! output   = E (65 bytes, uncompressed SEC1) || ChaCha20(key, nonce) ^ plaintext
//! ```
//!
//! ChaCha20 here is the IETF variant with a 32-bit block counter, so a single
//! stream is capped at [`MAX_STREAM_SIZE`] bytes (just under 256 GiB). Files
//! above the cap are refused with `CryptoError::TooLarge` before any output
//! is created.
//!
//! The ciphertext carries no authentication tag. Decrypting with the wrong
//! private key succeeds and yields scrambled bytes; the send/receive protocol
//! detects that by comparing the plaintext digest against the record store.

pub mod keys;
pub mod stream;

pub use keys::{KeyKind, PrivateKey, PublicKey};
pub use stream::{decrypt_file, decrypt_stream, encrypt_file, encrypt_stream};

/// Size of an uncompressed SEC1 secp256k1 point (the ciphertext header)
pub const EPHEMERAL_KEY_SIZE: usize = 65;

/// Size of a secp256k1 scalar
pub const PRIVATE_KEY_SIZE: usize = 32;

/// ChaCha20 key size
pub const KEY_SIZE: usize = 32;

/// ChaCha20 (IETF) nonce size
pub const NONCE_SIZE: usize = 12;

/// ChaCha20 block size
pub const BLOCK_SIZE: usize = 64;

/// Longest plaintext one keystream can cover: 2^32 - 1 blocks
pub const MAX_STREAM_SIZE: u64 = u32::MAX as u64 * BLOCK_SIZE as u64;
