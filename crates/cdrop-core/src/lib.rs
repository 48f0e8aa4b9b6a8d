pub mod config;
pub mod error;
pub mod stream;
pub mod types;

pub use error::{CdropResult, CryptoError, TransferError};
pub use stream::{ChunkObserver, NoopObserver};
pub use types::{FileRecord, SecretHex, Stage, TransferKind, TransferState, TransferStatus};

/// Reference chunk size for streaming cipher and digest operations (bytes)
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
