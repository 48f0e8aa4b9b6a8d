//! cdrop-transfer: background execution and the send/receive workflows
//!
//! - `runner`: bounded worker pool for blocking cipher/digest streams, with
//!   progress over a watch channel and per-chunk cancellation
//! - `store`: the remote record store keyed by ciphertext digest
//! - `protocol`: encrypt-then-address (send) and
//!   address-then-decrypt-then-verify (receive)

pub mod protocol;
pub mod runner;
pub mod store;

pub use protocol::{
    ConflictResolution, ContentAddressProtocol, PendingConflict, ProgressFn, ReceiveOutcome,
    ReceiveRequest, ReceivedFile, SendOutcome, SendRequest, TransferEvent,
};
pub use runner::{TaskHandle, TaskRunner, WorkerMonitor};
pub use store::{build_operator, CheckOutcome, OperatorStore, RecordStore, S3Credentials};
