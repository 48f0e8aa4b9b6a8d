use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::TransferError;

/// Hex form of a private key as carried in a record. Zeroized on drop.
#[derive(Clone)]
pub struct SecretHex(Zeroizing<String>);

impl SecretHex {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(Zeroizing::new(hex.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for SecretHex {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Debug for SecretHex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHex([REDACTED])")
    }
}

impl Serialize for SecretHex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for SecretHex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretHex::new)
    }
}

/// A transferred file as known to the remote record store.
///
/// `hash_ciphered` is the content address used for lookup. `hash` is the
/// plaintext digest; on the recipient side it is only meaningful after the
/// store has confirmed it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Display name of the file
    pub name: String,
    /// Hex public key the file was encrypted to
    pub public_key: String,
    /// Hex private key able to decrypt the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<SecretHex>,
    /// SHA-256 of the plaintext (lowercase hex)
    #[serde(default)]
    pub hash: Option<String>,
    /// SHA-256 of the ciphertext (lowercase hex)
    pub hash_ciphered: String,
    /// Unix seconds when the file was encrypted
    #[serde(default)]
    pub ciphered_at: Option<u64>,
    /// Unix seconds when the recipient verified the decryption
    #[serde(default)]
    pub deciphered_at: Option<u64>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    /// Opaque to the engine
    #[serde(default)]
    pub price: Option<u64>,
}

impl FileRecord {
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransferError> {
        serde_json::from_slice(data)
            .map_err(|e| TransferError::InvalidRecord(format!("parsing record: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransferError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TransferError::InvalidRecord(format!("serializing record: {e}")))
    }
}

/// Direction of a transfer workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Send,
    Receive,
}

impl TransferKind {
    /// Stages of the workflow, in execution order.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            TransferKind::Send => &[
                Stage::HashPlain,
                Stage::Encrypt,
                Stage::HashCiphered,
                Stage::Publish,
            ],
            TransferKind::Receive => &[
                Stage::HashCiphered,
                Stage::Lookup,
                Stage::Decrypt,
                Stage::HashPlain,
                Stage::Verify,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    HashPlain,
    Encrypt,
    HashCiphered,
    Publish,
    Lookup,
    Decrypt,
    Verify,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::HashPlain => "hashing plaintext",
            Stage::Encrypt => "encrypting",
            Stage::HashCiphered => "hashing ciphertext",
            Stage::Publish => "publishing",
            Stage::Lookup => "looking up",
            Stage::Decrypt => "decrypting",
            Stage::Verify => "verifying",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Succeeded,
    Failed(String),
}

/// Transient state of one send or receive workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub id: Uuid,
    pub kind: TransferKind,
    pub stage: Stage,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Overall progress across all stages, in [0, 1]
    pub progress: f64,
    pub status: TransferStatus,
}

impl TransferState {
    pub fn new(kind: TransferKind, source: PathBuf, destination: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            stage: Stage::Pending,
            source,
            destination,
            progress: 0.0,
            status: TransferStatus::Pending,
        }
    }

    /// Move to `stage`; progress jumps to the start of that stage.
    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.set_stage_progress(0.0);
    }

    /// Record progress within the current stage. Never moves backwards.
    pub fn set_stage_progress(&mut self, fraction: f64) {
        let stages = self.kind.stages();
        let Some(idx) = stages.iter().position(|s| *s == self.stage) else {
            return;
        };
        let fraction = fraction.clamp(0.0, 1.0);
        let overall = (idx as f64 + fraction) / stages.len() as f64;
        if overall > self.progress {
            self.progress = overall.min(1.0);
        }
    }

    pub fn succeed(&mut self) {
        self.stage = Stage::Done;
        self.progress = 1.0;
        self.status = TransferStatus::Succeeded;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TransferStatus::Failed(reason.into());
    }

    pub fn is_finished(&self) -> bool {
        self.status != TransferStatus::Pending
    }
}
