//! Per-chunk hook shared by the cipher and digest streams.
//!
//! Streams call `begin` once with the input length (when known) and `chunk`
//! after every processed chunk. Returning an error from `chunk` aborts the
//! stream before the next read; this is how cancellation reaches a worker.

use crate::error::CryptoError;

pub trait ChunkObserver {
    /// Total input length in bytes, if the source knows it. File cipher
    /// streams call this only after the destination has been created.
    fn begin(&mut self, _total: Option<u64>) {}

    /// Called after `len` input bytes have been fully processed.
    fn chunk(&mut self, len: usize) -> Result<(), CryptoError>;
}

/// Observer that accepts every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ChunkObserver for NoopObserver {
    fn chunk(&mut self, _len: usize) -> Result<(), CryptoError> {
        Ok(())
    }
}

impl<T: ChunkObserver + ?Sized> ChunkObserver for &mut T {
    fn begin(&mut self, total: Option<u64>) {
        (**self).begin(total)
    }

    fn chunk(&mut self, len: usize) -> Result<(), CryptoError> {
        (**self).chunk(len)
    }
}
