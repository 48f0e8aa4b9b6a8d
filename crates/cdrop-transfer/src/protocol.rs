//! Send and receive workflows over content addresses.
//!
//! Send: digest plaintext, encrypt to the recipient, digest the ciphertext,
//! publish the record under that ciphertext digest.
//!
//! Receive: digest the ciphertext, look the record up, decrypt with the
//! record's key, digest the result, and ask the store to confirm it. A
//! decrypted file is never reported as verified without that confirmation.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use cdrop_core::{
    unix_now, CdropResult, CryptoError, FileRecord, SecretHex, Stage, TransferError, TransferKind,
    TransferState,
};
use cdrop_crypto::{PrivateKey, PublicKey};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::runner::{TaskHandle, TaskRunner};
use crate::store::{CheckOutcome, RecordStore};

/// Called with the workflow state on every stage change and progress update.
pub type ProgressFn = Box<dyn Fn(&TransferState) + Send + Sync>;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Plaintext file
    pub source: PathBuf,
    /// Where the ciphertext is written
    pub destination: PathBuf,
    /// Display name; defaults to the source file name
    pub name: Option<String>,
    /// Recipient public key, hex
    pub public_key: String,
    /// Private key matching `public_key`, stored in the record
    pub private_key: SecretHex,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub price: Option<u64>,
}

#[derive(Debug)]
pub struct SendOutcome {
    pub record: FileRecord,
    pub state: TransferState,
}

#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    /// Ciphertext file
    pub source: PathBuf,
    /// Where the plaintext is written
    pub destination: PathBuf,
}

#[derive(Debug)]
pub struct ReceivedFile {
    pub record: FileRecord,
    pub state: TransferState,
    /// False when the file was kept despite a verification conflict
    pub verified: bool,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Verified(ReceivedFile),
    Conflict(PendingConflict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Keep,
    Discard,
}

/// A decrypted file the store did not confirm.
///
/// The file stays on disk until the caller picks [`keep`](Self::keep) or
/// [`discard`](Self::discard). Dropping this value leaves the file in place.
#[derive(Debug)]
pub struct PendingConflict {
    record: FileRecord,
    state: TransferState,
}

impl PendingConflict {
    /// The record as recomputed locally (`hash` is the local digest).
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn destination(&self) -> &Path {
        &self.state.destination
    }

    pub fn to_error(&self) -> TransferError {
        TransferError::VerificationConflict {
            hash: self.record.hash.clone().unwrap_or_default(),
            hash_ciphered: self.record.hash_ciphered.clone(),
        }
    }

    /// Accept the unverified file.
    pub fn keep(self) -> ReceivedFile {
        let PendingConflict {
            mut record,
            mut state,
        } = self;
        record.deciphered_at = Some(unix_now());
        state.succeed();
        info!(destination = %state.destination.display(), "kept unverified file");
        ReceivedFile {
            record,
            state,
            verified: false,
        }
    }

    /// Delete the decrypted file.
    pub async fn discard(self) -> CdropResult<TransferState> {
        let mut state = self.state;
        remove_output(&state.destination).await?;
        state.fail("discarded after verification conflict");
        info!(destination = %state.destination.display(), "discarded unverified file");
        Ok(state)
    }

    pub async fn resolve(self, resolution: ConflictResolution) -> CdropResult<Option<ReceivedFile>> {
        match resolution {
            ConflictResolution::Keep => Ok(Some(self.keep())),
            ConflictResolution::Discard => {
                self.discard().await?;
                Ok(None)
            }
        }
    }
}

/// Workflow notifications. Carry digests and ids, never key material.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    RecordPublished { id: Uuid, hash_ciphered: String },
    RecordFound { id: Uuid, hash_ciphered: String },
    RecordNotFound { id: Uuid, hash_ciphered: String },
    Verified { id: Uuid, hash: String, hash_ciphered: String },
    Conflict { id: Uuid, hash: String, hash_ciphered: String },
    Failed { id: Uuid, kind: TransferKind, reason: String },
}

pub struct ContentAddressProtocol {
    runner: TaskRunner,
    store: Arc<dyn RecordStore>,
    events: broadcast::Sender<TransferEvent>,
}

impl ContentAddressProtocol {
    pub fn new(runner: TaskRunner, store: Arc<dyn RecordStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runner,
            store,
            events,
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Encrypt `req.source` for the recipient and publish its record.
    ///
    /// On any failure after the ciphertext file was created, it is removed
    /// before the error is returned.
    pub async fn send(
        &self,
        req: SendRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> CdropResult<SendOutcome> {
        let mut state = TransferState::new(
            TransferKind::Send,
            req.source.clone(),
            req.destination.clone(),
        );

        let mut output_opened = false;
        match self
            .send_stages(&req, &mut state, &mut output_opened, progress, cancel)
            .await
        {
            Ok(record) => {
                state.succeed();
                notify(progress, &state);
                info!(
                    id = %state.id,
                    name = %record.name,
                    hash_ciphered = %record.hash_ciphered,
                    "sent"
                );
                Ok(SendOutcome { record, state })
            }
            Err(e) => {
                if output_opened {
                    discard_partial(&state.destination).await;
                }
                Err(self.failed(&mut state, progress, e))
            }
        }
    }

    async fn send_stages(
        &self,
        req: &SendRequest,
        state: &mut TransferState,
        output_opened: &mut bool,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> CdropResult<FileRecord> {
        reject_same_path(&req.source, &req.destination)?;
        let recipient = PublicKey::from_hex(&req.public_key)?;
        let private = PrivateKey::from_secret_hex(&req.private_key)?;
        if private.public_key().to_sec1_bytes() != recipient.to_sec1_bytes() {
            return Err(CryptoError::InvalidKey(
                "private key does not match the recipient public key".into(),
            )
            .into());
        }
        drop(private);

        state.enter(Stage::HashPlain);
        notify(progress, state);
        let hash = drive(
            state,
            progress,
            self.runner.digest(req.source.clone(), cancel),
        )
        .await?;

        state.enter(Stage::Encrypt);
        notify(progress, state);
        let handle = self.runner.encrypt(
            req.source.clone(),
            recipient,
            req.destination.clone(),
            cancel,
        );
        let opened = handle.begun();
        let encrypted = drive(state, progress, handle).await;
        *output_opened = opened.load(Ordering::Acquire);
        encrypted?;

        state.enter(Stage::HashCiphered);
        notify(progress, state);
        let hash_ciphered = drive(
            state,
            progress,
            self.runner.digest(req.destination.clone(), cancel),
        )
        .await?;

        state.enter(Stage::Publish);
        notify(progress, state);
        if cancel.is_cancelled() {
            return Err(CryptoError::Cancelled.into());
        }
        let record = FileRecord {
            name: req
                .name
                .clone()
                .unwrap_or_else(|| display_name(&req.source)),
            public_key: req.public_key.clone(),
            private_key: Some(req.private_key.clone()),
            hash: Some(hash.to_hex()),
            hash_ciphered: hash_ciphered.to_hex(),
            ciphered_at: Some(unix_now()),
            deciphered_at: None,
            sender: req.sender.clone(),
            recipient: req.recipient.clone(),
            price: req.price,
        };
        self.store.publish(&record).await?;
        self.emit(TransferEvent::RecordPublished {
            id: state.id,
            hash_ciphered: record.hash_ciphered.clone(),
        });
        Ok(record)
    }

    /// Find, decrypt and verify the ciphertext at `req.source`.
    ///
    /// A missing record or an unusable record key leaves the filesystem
    /// untouched. Failures after the destination was created remove it. A
    /// conflict keeps it and hands the decision back to the caller.
    pub async fn receive(
        &self,
        req: ReceiveRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> CdropResult<ReceiveOutcome> {
        let mut state = TransferState::new(
            TransferKind::Receive,
            req.source.clone(),
            req.destination.clone(),
        );

        let mut output_opened = false;
        match self
            .receive_stages(&req, &mut state, &mut output_opened, progress, cancel)
            .await
        {
            Ok((mut record, CheckOutcome::Verified)) => {
                record.deciphered_at = Some(unix_now());
                state.succeed();
                notify(progress, &state);
                info!(
                    id = %state.id,
                    name = %record.name,
                    destination = %state.destination.display(),
                    "received and verified"
                );
                Ok(ReceiveOutcome::Verified(ReceivedFile {
                    record,
                    state,
                    verified: true,
                }))
            }
            Ok((record, CheckOutcome::Conflict)) => {
                warn!(
                    id = %state.id,
                    hash_ciphered = %record.hash_ciphered,
                    destination = %state.destination.display(),
                    "verification conflict"
                );
                notify(progress, &state);
                Ok(ReceiveOutcome::Conflict(PendingConflict { record, state }))
            }
            Err(e) => {
                if output_opened {
                    discard_partial(&state.destination).await;
                }
                Err(self.failed(&mut state, progress, e))
            }
        }
    }

    async fn receive_stages(
        &self,
        req: &ReceiveRequest,
        state: &mut TransferState,
        output_opened: &mut bool,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> CdropResult<(FileRecord, CheckOutcome)> {
        reject_same_path(&req.source, &req.destination)?;

        state.enter(Stage::HashCiphered);
        notify(progress, state);
        let hash_ciphered = drive(
            state,
            progress,
            self.runner.digest(req.source.clone(), cancel),
        )
        .await?
        .to_hex();

        state.enter(Stage::Lookup);
        notify(progress, state);
        let Some(mut record) = self.store.lookup(&hash_ciphered).await? else {
            self.emit(TransferEvent::RecordNotFound {
                id: state.id,
                hash_ciphered: hash_ciphered.clone(),
            });
            return Err(TransferError::NotFound { hash_ciphered });
        };
        self.emit(TransferEvent::RecordFound {
            id: state.id,
            hash_ciphered: hash_ciphered.clone(),
        });
        let key = match &record.private_key {
            Some(hex) => PrivateKey::from_secret_hex(hex)?,
            None => {
                return Err(TransferError::InvalidRecord(
                    "record has no private key".into(),
                ))
            }
        };

        state.enter(Stage::Decrypt);
        notify(progress, state);
        let handle = self.runner.decrypt(
            req.source.clone(),
            key,
            req.destination.clone(),
            cancel,
        );
        let opened = handle.begun();
        let decrypted = drive(state, progress, handle).await;
        *output_opened = opened.load(Ordering::Acquire);
        decrypted?;

        state.enter(Stage::HashPlain);
        notify(progress, state);
        let hash = drive(
            state,
            progress,
            self.runner.digest(req.destination.clone(), cancel),
        )
        .await?
        .to_hex();

        state.enter(Stage::Verify);
        notify(progress, state);
        record.hash = Some(hash.clone());
        record.hash_ciphered = hash_ciphered.clone();
        let outcome = self.store.check(&hash, &hash_ciphered).await?;
        let event = match outcome {
            CheckOutcome::Verified => TransferEvent::Verified {
                id: state.id,
                hash,
                hash_ciphered,
            },
            CheckOutcome::Conflict => TransferEvent::Conflict {
                id: state.id,
                hash,
                hash_ciphered,
            },
        };
        self.emit(event);
        Ok((record, outcome))
    }

    fn failed(
        &self,
        state: &mut TransferState,
        progress: Option<&ProgressFn>,
        error: TransferError,
    ) -> TransferError {
        state.fail(error.to_string());
        notify(progress, state);
        warn!(id = %state.id, kind = ?state.kind, stage = %state.stage, error = %error, "transfer failed");
        self.emit(TransferEvent::Failed {
            id: state.id,
            kind: state.kind,
            reason: error.to_string(),
        });
        error
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Await a stage's worker, folding its progress into `state`.
async fn drive<T>(
    state: &mut TransferState,
    progress: Option<&ProgressFn>,
    handle: TaskHandle<T>,
) -> CdropResult<T> {
    handle
        .watch(|fraction| {
            state.set_stage_progress(fraction);
            notify(progress, state);
        })
        .await
}

fn notify(progress: Option<&ProgressFn>, state: &TransferState) {
    if let Some(report) = progress {
        report(state);
    }
}

/// Best-effort removal of a partial output; the transfer error wins.
async fn discard_partial(path: &Path) {
    if let Err(e) = remove_output(path).await {
        warn!(path = %path.display(), error = %e, "could not remove partial output");
    }
}

async fn remove_output(path: &Path) -> CdropResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn reject_same_path(source: &Path, destination: &Path) -> CdropResult<()> {
    let same = match (source.canonicalize(), destination.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => source == destination,
    };
    if same {
        return Err(CryptoError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("source and destination are the same file: {}", source.display()),
        ))
        .into());
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
