use thiserror::Error;

pub type CdropResult<T> = Result<T, TransferError>;

/// Errors raised by a single cipher or digest stream.
///
/// All of them are terminal for the operation that produced them.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("cipher initialisation failed: {0}")]
    CipherInit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// The ChaCha20 block counter is 32 bits, so one keystream covers at
    /// most `limit` bytes.
    #[error("input of {size} bytes exceeds the {limit}-byte keystream limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

/// Errors surfaced by the send/receive workflows.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("no record for content address {hash_ciphered}")]
    NotFound { hash_ciphered: String },

    #[error("verification conflict: digest {hash} does not match the record for {hash_ciphered}")]
    VerificationConflict { hash: String, hash_ciphered: String },

    #[error("record store unreachable: {0}")]
    Unreachable(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("config error: {0}")]
    Config(String),
}

impl TransferError {
    /// True when the error came from a cancelled stream.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Crypto(CryptoError::Cancelled))
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Crypto(CryptoError::Io(e))
    }
}
