//! Chunked ECIES encryption/decryption of byte streams and files
//!
//! Stream format (binary):
//! ```text
//! [65 bytes: ephemeral public key, uncompressed SEC1][N bytes: ChaCha20 ciphertext]
//! ```
//!
//! Both directions hold one chunk buffer at a time, so memory use is
//! independent of input size. Chunks are processed strictly in order.

use cdrop_core::{ChunkObserver, CryptoError};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use k256::ecdh::EphemeralSecret;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use zeroize::Zeroizing;

use crate::keys::{PrivateKey, PublicKey};
use crate::{EPHEMERAL_KEY_SIZE, KEY_SIZE, MAX_STREAM_SIZE, NONCE_SIZE};

const KDF_INFO: &[u8] = b"cdrop-ecies-stream-v1";

/// Encrypt everything `reader` yields to `recipient`, writing header and
/// ciphertext to `writer`. Returns the number of plaintext bytes processed.
pub fn encrypt_stream<R: Read, W: Write, O: ChunkObserver>(
    reader: R,
    mut writer: W,
    recipient: &PublicKey,
    chunk_size: usize,
    observer: O,
) -> Result<u64, CryptoError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let header = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(recipient.as_inner());

    let mut cipher = keystream(shared.raw_secret_bytes().as_slice(), header.as_bytes())?;

    writer.write_all(header.as_bytes())?;
    pump(reader, writer, &mut cipher, chunk_size, observer)
}

/// Decrypt a stream produced by [`encrypt_stream`].
///
/// A private key that does not match the recipient public key is not
/// detected here: the output is simply wrong. Returns the number of
/// plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write, O: ChunkObserver>(
    mut reader: R,
    writer: W,
    private: &PrivateKey,
    chunk_size: usize,
    mut observer: O,
) -> Result<u64, CryptoError> {
    let mut header = [0u8; EPHEMERAL_KEY_SIZE];
    reader.read_exact(&mut header)?;
    observer.chunk(EPHEMERAL_KEY_SIZE)?;

    let ephemeral = k256::PublicKey::from_sec1_bytes(&header).map_err(|_| {
        CryptoError::Malformed("ciphertext header is not a secp256k1 point".into())
    })?;
    let shared = k256::ecdh::diffie_hellman(
        private.as_inner().to_nonzero_scalar(),
        ephemeral.as_affine(),
    );

    let mut cipher = keystream(shared.raw_secret_bytes().as_slice(), &header)?;
    pump(reader, writer, &mut cipher, chunk_size, observer)
}

/// Encrypt the file at `source` into `destination` (created or truncated).
///
/// `observer.begin` fires once `destination` has been created. Errors before
/// that point (missing source, oversized input) leave it untouched; on a
/// later failure it is left partially written and removing it is the
/// caller's call.
pub fn encrypt_file<O: ChunkObserver>(
    source: &Path,
    recipient: &PublicKey,
    destination: &Path,
    chunk_size: usize,
    mut observer: O,
) -> Result<u64, CryptoError> {
    let input = File::open(source)?;
    let total = input.metadata().map(|m| m.len()).ok();
    check_size(total.unwrap_or(0))?;

    let mut output = BufWriter::new(File::create(destination)?);
    observer.begin(total);
    let bytes = encrypt_stream(input, &mut output, recipient, chunk_size, &mut observer)?;
    finish(output)?;

    tracing::debug!(
        source = %source.display(),
        destination = %destination.display(),
        bytes,
        "encrypted"
    );
    Ok(bytes)
}

/// Decrypt the file at `source` into `destination` (created or truncated).
/// Same `begin` contract as [`encrypt_file`].
pub fn decrypt_file<O: ChunkObserver>(
    source: &Path,
    private: &PrivateKey,
    destination: &Path,
    chunk_size: usize,
    mut observer: O,
) -> Result<u64, CryptoError> {
    let input = File::open(source)?;
    let total = input.metadata().map(|m| m.len()).ok();
    check_size(total.unwrap_or(0).saturating_sub(EPHEMERAL_KEY_SIZE as u64))?;

    let mut output = BufWriter::new(File::create(destination)?);
    observer.begin(total);
    let bytes = decrypt_stream(input, &mut output, private, chunk_size, &mut observer)?;
    finish(output)?;

    tracing::debug!(
        source = %source.display(),
        destination = %destination.display(),
        bytes,
        "decrypted"
    );
    Ok(bytes)
}

fn check_size(size: u64) -> Result<(), CryptoError> {
    if size > MAX_STREAM_SIZE {
        return Err(CryptoError::TooLarge {
            size,
            limit: MAX_STREAM_SIZE,
        });
    }
    Ok(())
}

fn finish(output: BufWriter<File>) -> Result<(), CryptoError> {
    let file = output.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// HKDF-SHA256 over the ECDH secret, salted with the ephemeral public key.
fn keystream(shared: &[u8], ephemeral_public: &[u8]) -> Result<ChaCha20, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_public), shared);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
    hkdf.expand(KDF_INFO, &mut okm[..])
        .map_err(|e| CryptoError::CipherInit(format!("HKDF expand failed: {e}")))?;

    ChaCha20::new_from_slices(&okm[..KEY_SIZE], &okm[KEY_SIZE..])
        .map_err(|e| CryptoError::CipherInit(format!("ChaCha20 init failed: {e}")))
}

fn pump<R: Read, W: Write, O: ChunkObserver>(
    mut reader: R,
    mut writer: W,
    cipher: &mut ChaCha20,
    chunk_size: usize,
    mut observer: O,
) -> Result<u64, CryptoError> {
    let mut buf = Zeroizing::new(vec![0u8; chunk_size.max(1)]);
    let mut processed = 0u64;

    loop {
        let n = match reader.read(&mut buf[..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CryptoError::Io(e)),
        };
        cipher
            .try_apply_keystream(&mut buf[..n])
            .map_err(|_| CryptoError::TooLarge {
                size: processed + n as u64,
                limit: MAX_STREAM_SIZE,
            })?;
        writer.write_all(&buf[..n])?;
        processed += n as u64;
        observer.chunk(n)?;
    }

    writer.flush()?;
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrop_core::NoopObserver;
    use chacha20::cipher::StreamCipherSeek;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn key_pair() -> (PrivateKey, PublicKey) {
        let secret = k256::SecretKey::random(&mut OsRng);
        let private = PrivateKey::from_hex(&hex::encode(secret.to_bytes())).unwrap();
        let public = private.public_key();
        (private, public)
    }

    fn encrypt_vec(data: &[u8], public: &PublicKey, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(Cursor::new(data), &mut out, public, chunk, NoopObserver).unwrap();
        out
    }

    fn decrypt_vec(data: &[u8], private: &PrivateKey, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        decrypt_stream(Cursor::new(data), &mut out, private, chunk, NoopObserver).unwrap();
        out
    }

    struct CountingReader<R> {
        inner: R,
        reads: usize,
        largest: usize,
    }

    impl<R: Read> Read for CountingReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads += 1;
            self.largest = self.largest.max(buf.len());
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_hello_world_roundtrip() {
        let (private, public) = key_pair();
        let sealed = encrypt_vec(b"Hello world!", &public, 2048);

        assert_eq!(sealed.len(), EPHEMERAL_KEY_SIZE + 12);
        assert_ne!(&sealed[EPHEMERAL_KEY_SIZE..], b"Hello world!");
        assert_eq!(decrypt_vec(&sealed, &private, 2048), b"Hello world!");
    }

    #[test]
    fn test_empty_roundtrip() {
        let (private, public) = key_pair();
        let sealed = encrypt_vec(b"", &public, 2048);
        assert_eq!(sealed.len(), EPHEMERAL_KEY_SIZE);
        assert!(decrypt_vec(&sealed, &private, 2048).is_empty());
    }

    #[test]
    fn test_fresh_ephemeral_per_encryption() {
        let (_, public) = key_pair();
        let a = encrypt_vec(b"same input", &public, 2048);
        let b = encrypt_vec(b"same input", &public, 2048);
        assert_ne!(a, b, "each encryption must use a new ephemeral key");
    }

    #[test]
    fn test_decrypt_chunking_independent_of_encrypt_chunking() {
        let (private, public) = key_pair();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let sealed = encrypt_vec(&data, &public, 2048);
        assert_eq!(decrypt_vec(&sealed, &private, 777), data);
    }

    #[test]
    fn test_wrong_key_yields_garbage_without_error() {
        let (_, public) = key_pair();
        let (other_private, _) = key_pair();
        let data = b"top secret quarterly numbers".to_vec();
        let sealed = encrypt_vec(&data, &public, 2048);

        let mut out = Vec::new();
        let result =
            decrypt_stream(Cursor::new(&sealed), &mut out, &other_private, 2048, NoopObserver);

        assert!(result.is_ok(), "cipher has no way to detect the wrong key");
        assert_eq!(out.len(), data.len());
        assert_ne!(out, data);
        assert_ne!(
            cdrop_digest::hash_bytes(&out),
            cdrop_digest::hash_bytes(&data)
        );
    }

    #[test]
    fn test_truncated_header_is_io_error() {
        let (private, _) = key_pair();
        let mut out = Vec::new();
        let err = decrypt_stream(Cursor::new(vec![4u8; 10]), &mut out, &private, 2048, NoopObserver)
            .unwrap_err();
        match err {
            CryptoError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected Io(UnexpectedEof), got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_header_is_malformed() {
        let (private, _) = key_pair();
        let mut out = Vec::new();
        let err = decrypt_stream(
            Cursor::new(vec![0xAAu8; 200]),
            &mut out,
            &private,
            2048,
            NoopObserver,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn test_constant_memory_chunked_reads() {
        let (private, public) = key_pair();
        let data = vec![0x5Au8; 4 * 1024 * 1024];

        let mut reader = CountingReader {
            inner: Cursor::new(&data),
            reads: 0,
            largest: 0,
        };
        let mut sealed = Vec::new();
        encrypt_stream(&mut reader, &mut sealed, &public, 2048, NoopObserver).unwrap();
        assert_eq!(reader.largest, 2048);
        assert_eq!(reader.reads, data.len() / 2048 + 1);

        let mut reader = CountingReader {
            inner: Cursor::new(&sealed),
            reads: 0,
            largest: 0,
        };
        let mut opened = Vec::new();
        decrypt_stream(&mut reader, &mut opened, &private, 2048, NoopObserver).unwrap();
        // header is read through read_exact into a fixed 65-byte buffer
        assert!(reader.largest <= 2048);
        assert!(reader.reads >= data.len() / 2048);
        assert_eq!(opened, data);
    }

    #[test]
    fn test_observer_cancels_mid_stream() {
        struct CancelAfter(usize);
        impl ChunkObserver for CancelAfter {
            fn chunk(&mut self, _len: usize) -> Result<(), CryptoError> {
                if self.0 == 0 {
                    return Err(CryptoError::Cancelled);
                }
                self.0 -= 1;
                Ok(())
            }
        }

        let (_, public) = key_pair();
        let data = vec![0u8; 20 * 2048];
        let mut out = Vec::new();
        let err = encrypt_stream(Cursor::new(&data), &mut out, &public, 2048, CancelAfter(3))
            .unwrap_err();
        assert!(matches!(err, CryptoError::Cancelled));
        // header + the chunks processed before cancellation
        assert_eq!(out.len(), EPHEMERAL_KEY_SIZE + 4 * 2048);
    }

    #[test]
    fn test_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (private, public) = key_pair();
        let plain = tmp.path().join("plain.txt");
        let sealed = tmp.path().join("plain.txt.enc");
        let opened = tmp.path().join("opened.txt");
        let data: Vec<u8> = (0..100_003u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&plain, &data).unwrap();

        let written = encrypt_file(&plain, &public, &sealed, 2048, NoopObserver).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(
            std::fs::metadata(&sealed).unwrap().len(),
            (EPHEMERAL_KEY_SIZE + data.len()) as u64
        );

        decrypt_file(&sealed, &private, &opened, 2048, NoopObserver).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), data);
    }

    #[test]
    fn test_missing_source_does_not_create_destination() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_, public) = key_pair();
        let dest = tmp.path().join("out.enc");
        let err = encrypt_file(&tmp.path().join("missing"), &public, &dest, 2048, NoopObserver)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Io(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_existing_destination_is_truncated() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (private, public) = key_pair();
        let plain = tmp.path().join("p");
        let sealed = tmp.path().join("s");
        let opened = tmp.path().join("o");
        std::fs::write(&plain, b"short").unwrap();
        std::fs::write(&opened, vec![0xFFu8; 10_000]).unwrap();

        encrypt_file(&plain, &public, &sealed, 2048, NoopObserver).unwrap();
        decrypt_file(&sealed, &private, &opened, 2048, NoopObserver).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), b"short");
    }

    #[test]
    fn test_keystream_end_is_too_large() {
        let mut cipher = keystream(&[7u8; 32], &[4u8; EPHEMERAL_KEY_SIZE]).unwrap();
        cipher.seek(MAX_STREAM_SIZE - 100);
        let mut near_end = [0u8; 50];
        cipher.apply_keystream(&mut near_end);

        let err = pump(
            Cursor::new(vec![0u8; 4096]),
            Vec::new(),
            &mut cipher,
            2048,
            NoopObserver,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CryptoError::TooLarge { limit, .. } if limit == MAX_STREAM_SIZE
        ));
    }

    #[test]
    fn test_oversized_source_is_refused_before_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_, public) = key_pair();
        let huge = tmp.path().join("huge.bin");
        // sparse, nothing is actually written
        File::create(&huge)
            .unwrap()
            .set_len(MAX_STREAM_SIZE + 1)
            .unwrap();
        let dest = tmp.path().join("huge.bin.enc");

        let err = encrypt_file(&huge, &public, &dest, 2048, NoopObserver).unwrap_err();
        assert!(matches!(err, CryptoError::TooLarge { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_begin_fires_only_after_destination_exists() {
        struct SeesDestination<'a> {
            dest: &'a Path,
            begun: bool,
        }
        impl ChunkObserver for SeesDestination<'_> {
            fn begin(&mut self, _total: Option<u64>) {
                assert!(self.dest.exists());
                self.begun = true;
            }
            fn chunk(&mut self, _len: usize) -> Result<(), CryptoError> {
                Ok(())
            }
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let (private, public) = key_pair();
        let dest = tmp.path().join("out.txt");
        std::fs::write(&dest, b"keep me").unwrap();

        let mut observer = SeesDestination {
            dest: &dest,
            begun: false,
        };
        let err = decrypt_file(&tmp.path().join("missing"), &private, &dest, 2048, &mut observer)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Io(_)));
        assert!(!observer.begun);
        assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");

        let plain = tmp.path().join("plain.txt");
        std::fs::write(&plain, b"fresh").unwrap();
        encrypt_file(&plain, &public, &dest, 2048, &mut observer).unwrap();
        assert!(observer.begun);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_plaintext(
            data in proptest::collection::vec(any::<u8>(), 0..=10_000),
            chunk in 1usize..=4096,
        ) {
            let (private, public) = key_pair();
            let sealed = encrypt_vec(&data, &public, chunk);
            prop_assert_eq!(sealed.len(), EPHEMERAL_KEY_SIZE + data.len());
            prop_assert_eq!(decrypt_vec(&sealed, &private, chunk), data);
        }
    }
}
