//! Bounded background runner for blocking cipher and digest streams.
//!
//! Every submitted operation waits for a permit from a shared semaphore and
//! then runs on tokio's blocking pool. Progress travels back over a `watch`
//! channel and is only ever handed to callbacks on the task that awaits the
//! handle, never on the worker thread. Cancellation is cooperative: the
//! worker checks the token after every chunk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdrop_core::config::TransferConfig;
use cdrop_core::{ChunkObserver, CryptoError, TransferError};
use cdrop_crypto::{PrivateKey, PublicKey};
use cdrop_digest::ContentHash;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Smallest progress step worth publishing
const PROGRESS_STEP: f64 = 0.001;

/// Observer handed to every operation running on a worker.
pub struct WorkerMonitor {
    tx: watch::Sender<f64>,
    cancel: CancellationToken,
    begun: Arc<AtomicBool>,
    total: Option<u64>,
    done: u64,
}

impl WorkerMonitor {
    fn new(tx: watch::Sender<f64>, cancel: CancellationToken, begun: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            cancel,
            begun,
            total: None,
            done: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish `fraction` if it moves progress forward.
    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            let forward = fraction >= *current + PROGRESS_STEP
                || (fraction >= 1.0 && *current < 1.0);
            if forward {
                *current = fraction;
            }
            forward
        });
    }
}

impl ChunkObserver for WorkerMonitor {
    fn begin(&mut self, total: Option<u64>) {
        self.begun.store(true, Ordering::Release);
        self.total = total;
        self.done = 0;
    }

    fn chunk(&mut self, len: usize) -> Result<(), CryptoError> {
        if self.cancel.is_cancelled() {
            return Err(CryptoError::Cancelled);
        }
        self.done += len as u64;
        if let Some(total) = self.total.filter(|t| *t > 0) {
            self.report(self.done as f64 / total as f64);
        }
        Ok(())
    }
}

/// Handle to an operation submitted to a [`TaskRunner`].
pub struct TaskHandle<T> {
    progress: watch::Receiver<f64>,
    cancel: CancellationToken,
    begun: Arc<AtomicBool>,
    join: JoinHandle<Result<T, TransferError>>,
}

impl<T> TaskHandle<T> {
    /// Progress in [0, 1], non-decreasing.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Ask the worker to stop after its current chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Set once the operation has called [`ChunkObserver::begin`]. For the
    /// file ciphers that means the destination has been created. Outlives
    /// the handle, so it can be read after `wait`/`watch` consumed it.
    pub fn begun(&self) -> Arc<AtomicBool> {
        self.begun.clone()
    }

    /// Wait for the operation to finish. Resolves after the worker has
    /// returned, so every file handle it opened is closed.
    pub async fn wait(self) -> Result<T, TransferError> {
        flatten(self.join.await)
    }

    /// Wait for completion, calling `on_progress` on this task for every
    /// progress update observed along the way.
    pub async fn watch<P>(self, mut on_progress: P) -> Result<T, TransferError>
    where
        P: FnMut(f64),
    {
        let TaskHandle {
            mut progress,
            mut join,
            ..
        } = self;
        let mut open = true;
        let mut last = 0.0f64;

        let joined = loop {
            tokio::select! {
                biased;
                changed = progress.changed(), if open => match changed {
                    Ok(()) => {
                        let fraction = *progress.borrow_and_update();
                        if fraction > last {
                            last = fraction;
                            on_progress(fraction);
                        }
                    }
                    Err(_) => open = false,
                },
                joined = &mut join => break joined,
            }
        };

        let fraction = *progress.borrow_and_update();
        if fraction > last {
            on_progress(fraction);
        }
        flatten(joined)
    }

    /// Callback form: progress updates, then exactly one of `on_success` or
    /// `on_failure`, all invoked on the awaiting task.
    pub async fn run_callbacks<P, S, F>(self, on_progress: P, on_success: S, on_failure: F)
    where
        P: FnMut(f64),
        S: FnOnce(T),
        F: FnOnce(TransferError),
    {
        match self.watch(on_progress).await {
            Ok(value) => on_success(value),
            Err(e) => on_failure(e),
        }
    }
}

fn flatten<T>(joined: Result<Result<T, TransferError>, JoinError>) -> Result<T, TransferError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TransferError::Worker(format!("worker panicked: {e}"))),
        Err(e) => Err(TransferError::Worker(format!("worker aborted: {e}"))),
    }
}

/// Bounded pool of background workers.
#[derive(Clone)]
pub struct TaskRunner {
    permits: Arc<Semaphore>,
    chunk_size: usize,
}

impl TaskRunner {
    pub fn new(workers: usize, chunk_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.effective_workers(), config.chunk_size)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Schedule `op` on a background worker. Must be called from within a
    /// tokio runtime.
    pub fn submit<T, F>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerMonitor) -> Result<T, CryptoError> + Send + 'static,
    {
        self.submit_with_token(op, CancellationToken::new())
    }

    /// Like [`submit`](Self::submit), cancelled through `cancel`.
    pub fn submit_with_token<T, F>(&self, op: F, cancel: CancellationToken) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerMonitor) -> Result<T, CryptoError> + Send + 'static,
    {
        let (tx, rx) = watch::channel(0.0f64);
        let permits = self.permits.clone();
        let token = cancel.clone();
        let begun = Arc::new(AtomicBool::new(false));
        let flag = begun.clone();

        let join = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| TransferError::Worker("runner closed".into()))?;
            if token.is_cancelled() {
                return Err(CryptoError::Cancelled.into());
            }

            let worker = tokio::task::spawn_blocking(move || {
                let mut monitor = WorkerMonitor::new(tx, token, flag);
                let result = op(&mut monitor);
                if result.is_ok() {
                    monitor.report(1.0);
                }
                result
            });
            flatten(worker.await.map(|r| r.map_err(TransferError::from)))
        });

        TaskHandle {
            progress: rx,
            cancel,
            begun,
            join,
        }
    }

    /// Submit `op` and drive it to completion with callbacks, all of which
    /// run on the calling task.
    pub async fn run<T, F, P, S, E>(&self, op: F, on_progress: P, on_success: S, on_failure: E)
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerMonitor) -> Result<T, CryptoError> + Send + 'static,
        P: FnMut(f64),
        S: FnOnce(T),
        E: FnOnce(TransferError),
    {
        self.submit(op)
            .run_callbacks(on_progress, on_success, on_failure)
            .await
    }

    /// SHA-256 of the file at `path`.
    pub fn digest(&self, path: PathBuf, cancel: &CancellationToken) -> TaskHandle<ContentHash> {
        let chunk_size = self.chunk_size;
        self.submit_with_token(
            move |monitor| {
                debug!(path = %path.display(), "digest started");
                cdrop_digest::hash_file(&path, chunk_size, monitor)
            },
            cancel.child_token(),
        )
    }

    /// Encrypt `source` to `recipient`, writing `destination`.
    pub fn encrypt(
        &self,
        source: PathBuf,
        recipient: PublicKey,
        destination: PathBuf,
        cancel: &CancellationToken,
    ) -> TaskHandle<u64> {
        let chunk_size = self.chunk_size;
        self.submit_with_token(
            move |monitor| {
                debug!(source = %source.display(), "encrypt started");
                cdrop_crypto::encrypt_file(&source, &recipient, &destination, chunk_size, monitor)
            },
            cancel.child_token(),
        )
    }

    /// Decrypt `source` with `key`, writing `destination`. The key is moved
    /// to the worker and dropped there.
    pub fn decrypt(
        &self,
        source: PathBuf,
        key: PrivateKey,
        destination: PathBuf,
        cancel: &CancellationToken,
    ) -> TaskHandle<u64> {
        let chunk_size = self.chunk_size;
        self.submit_with_token(
            move |monitor| {
                debug!(source = %source.display(), "decrypt started");
                cdrop_crypto::decrypt_file(&source, &key, &destination, chunk_size, monitor)
            },
            cancel.child_token(),
        )
    }
}
