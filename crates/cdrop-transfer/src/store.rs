//! Remote record store keyed by ciphertext digest.
//!
//! Records are JSON documents at `{prefix}/records/{hash_ciphered}.json` on
//! any OpenDAL backend. The store never retries; a failed call surfaces as
//! [`TransferError::Unreachable`] and the workflow decides what to do.

use std::path::PathBuf;

use async_trait::async_trait;
use cdrop_core::config::StoreConfig;
use cdrop_core::{CdropResult, FileRecord, TransferError};
use opendal::Operator;
use tracing::{debug, warn};

/// Result of comparing a recomputed plaintext digest against the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Verified,
    Conflict,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the record for `hash_ciphered`, `None` if there is none.
    async fn lookup(&self, hash_ciphered: &str) -> CdropResult<Option<FileRecord>>;

    /// Compare `hash` with the plaintext digest recorded for `hash_ciphered`.
    async fn check(&self, hash: &str, hash_ciphered: &str) -> CdropResult<CheckOutcome>;

    /// Store `record` under its `hash_ciphered`, replacing any previous one.
    async fn publish(&self, record: &FileRecord) -> CdropResult<()>;
}

/// [`RecordStore`] over an OpenDAL operator.
#[derive(Clone)]
pub struct OperatorStore {
    op: Operator,
    prefix: String,
}

impl OperatorStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Object key for a ciphertext digest. Rejects anything that is not a
    /// 64-char hex SHA-256 so callers cannot address arbitrary paths.
    pub fn record_key(&self, hash_ciphered: &str) -> CdropResult<String> {
        cdrop_digest::hash_from_hex(hash_ciphered)
            .map_err(|e| TransferError::InvalidRecord(format!("bad content address: {e}")))?;
        let name = hash_ciphered.to_ascii_lowercase();
        if self.prefix.is_empty() {
            Ok(format!("records/{name}.json"))
        } else {
            Ok(format!("{}/records/{name}.json", self.prefix))
        }
    }
}

#[async_trait]
impl RecordStore for OperatorStore {
    async fn lookup(&self, hash_ciphered: &str) -> CdropResult<Option<FileRecord>> {
        let key = self.record_key(hash_ciphered)?;
        match self.op.read(&key).await {
            Ok(buf) => {
                let record = FileRecord::from_bytes(&buf.to_vec())?;
                debug!(key = %key, "record found");
                Ok(Some(record))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::Unreachable(format!("reading {key}: {e}"))),
        }
    }

    async fn check(&self, hash: &str, hash_ciphered: &str) -> CdropResult<CheckOutcome> {
        let Some(record) = self.lookup(hash_ciphered).await? else {
            return Ok(CheckOutcome::Conflict);
        };
        match record.hash.as_deref() {
            Some(expected) if expected.eq_ignore_ascii_case(hash) => Ok(CheckOutcome::Verified),
            _ => Ok(CheckOutcome::Conflict),
        }
    }

    async fn publish(&self, record: &FileRecord) -> CdropResult<()> {
        if record.hash.is_none() {
            return Err(TransferError::InvalidRecord(
                "record has no plaintext digest".into(),
            ));
        }
        let key = self.record_key(&record.hash_ciphered)?;
        let bytes = record.to_bytes()?;
        self.op
            .write(&key, bytes)
            .await
            .map_err(|e| TransferError::Unreachable(format!("writing {key}: {e}")))?;
        debug!(key = %key, "record published");
        Ok(())
    }
}

/// S3 credentials, loaded by the caller from the environment.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Build an operator for the configured backend.
///
/// The S3 backend uses path-style addressing, which SeaweedFS and MinIO
/// require. A plaintext HTTP endpoint is refused when `enforce_tls` is set.
pub fn build_operator(cfg: &StoreConfig, creds: Option<&S3Credentials>) -> CdropResult<Operator> {
    let op = match cfg.backend.as_str() {
        "memory" => Operator::new(opendal::services::Memory::default())
            .map_err(|e| TransferError::Config(format!("memory backend: {e}")))?
            .layer(opendal::layers::LoggingLayer::default())
            .finish(),
        "fs" => {
            let root = expand_tilde(&cfg.root);
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .map_err(|e| TransferError::Config(format!("fs backend at {}: {e}", root.display())))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        "s3" => {
            if cfg.endpoint.starts_with("http://") {
                if cfg.enforce_tls {
                    return Err(TransferError::Config(format!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                        cfg.endpoint
                    )));
                }
                warn!(
                    endpoint = %cfg.endpoint,
                    "S3 endpoint uses plaintext HTTP; set store.enforce_tls = true in production"
                );
            }
            let creds = creds.ok_or_else(|| {
                TransferError::Config("s3 backend requires credentials".into())
            })?;
            let builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);
            Operator::new(builder)
                .map_err(|e| TransferError::Config(format!("s3 backend: {e}")))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        other => {
            return Err(TransferError::Config(format!(
                "unknown store backend '{other}'"
            )))
        }
    };
    Ok(op)
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "c0535e4be2b79ffd93291305436bf889314e4a3faec05ecffcbb7df31ad9e51a";
    const CIPHERED: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn memory_store() -> OperatorStore {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OperatorStore::new(op, "test")
    }

    fn record() -> FileRecord {
        FileRecord {
            name: "hello.txt".into(),
            public_key: "04ab".into(),
            hash: Some(HASH.into()),
            hash_ciphered: CIPHERED.into(),
            ciphered_at: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn record_key_layout() {
        let store = memory_store();
        assert_eq!(
            store.record_key(CIPHERED).unwrap(),
            format!("test/records/{CIPHERED}.json")
        );
        assert_eq!(
            store.record_key(&CIPHERED.to_uppercase()).unwrap(),
            format!("test/records/{CIPHERED}.json")
        );
    }

    #[test]
    fn record_key_rejects_paths() {
        let store = memory_store();
        assert!(store.record_key("../etc/passwd").is_err());
        assert!(store.record_key("abc").is_err());
    }

    #[tokio::test]
    async fn lookup_miss_is_none() {
        let store = memory_store();
        assert!(store.lookup(CIPHERED).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_then_lookup() {
        let store = memory_store();
        store.publish(&record()).await.unwrap();
        let found = store.lookup(CIPHERED).await.unwrap().unwrap();
        assert_eq!(found.name, "hello.txt");
        assert_eq!(found.hash.as_deref(), Some(HASH));
    }

    #[tokio::test]
    async fn check_outcomes() {
        let store = memory_store();
        assert_eq!(
            store.check(HASH, CIPHERED).await.unwrap(),
            CheckOutcome::Conflict
        );

        store.publish(&record()).await.unwrap();
        assert_eq!(
            store.check(HASH, CIPHERED).await.unwrap(),
            CheckOutcome::Verified
        );
        assert_eq!(
            store.check(&HASH.to_uppercase(), CIPHERED).await.unwrap(),
            CheckOutcome::Verified
        );
        assert_eq!(
            store.check(CIPHERED, CIPHERED).await.unwrap(),
            CheckOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn publish_requires_plain_hash() {
        let store = memory_store();
        let mut rec = record();
        rec.hash = None;
        assert!(matches!(
            store.publish(&rec).await,
            Err(TransferError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_record_is_invalid() {
        let store = memory_store();
        let key = store.record_key(CIPHERED).unwrap();
        store.op.write(&key, b"not json".to_vec()).await.unwrap();
        assert!(matches!(
            store.lookup(CIPHERED).await,
            Err(TransferError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn fs_backend_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = StoreConfig {
            backend: "fs".into(),
            root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let store = OperatorStore::new(build_operator(&cfg, None).unwrap(), "cdrop");
        store.publish(&record()).await.unwrap();
        assert!(tmp
            .path()
            .join(format!("cdrop/records/{CIPHERED}.json"))
            .exists());
    }

    #[test]
    fn s3_needs_credentials() {
        let cfg = StoreConfig {
            backend: "s3".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_operator(&cfg, None),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn s3_http_with_enforce_tls_fails() {
        let cfg = StoreConfig {
            backend: "s3".into(),
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let creds = S3Credentials {
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        };
        let err = build_operator(&cfg, Some(&creds)).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn s3_https_builds() {
        let cfg = StoreConfig {
            backend: "s3".into(),
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let creds = S3Credentials {
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        };
        assert!(build_operator(&cfg, Some(&creds)).is_ok());
    }

    #[test]
    fn unknown_backend_fails() {
        let cfg = StoreConfig {
            backend: "ftp".into(),
            ..Default::default()
        };
        assert!(build_operator(&cfg, None).is_err());
    }

    #[test]
    fn credentials_debug_redacts() {
        let creds = S3Credentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
