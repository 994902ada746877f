//! Compression and encryption of backup artifacts.
//!
//! The write path is always compress then encrypt; the read path is the exact
//! reverse. Write-side transforms produce a new file next to their input and
//! delete the input only after the output has been synced and renamed into
//! place, so a failure at any point leaves at least one valid copy.
//!
//! Encrypted files use AES-256-GCM over 1 MiB chunks:
//!
//! ```text
//! magic "BKENC001" | nonce prefix (7 bytes) | record*
//! record = last flag (1 byte) | ciphertext length (u32 BE) | ciphertext+tag
//! nonce  = prefix | chunk counter (u32 BE) | last flag
//! ```
//!
//! The counter and last flag in the nonce make reordered, dropped or
//! truncated chunks fail authentication.

use crate::config::BackupConfig;
use crate::utils::{BackupError, BestEffort, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const COMPRESSED_EXTENSION: &str = "zst";
pub const ENCRYPTED_EXTENSION: &str = "enc";

const MAGIC: &[u8; 8] = b"BKENC001";
const NONCE_PREFIX_LEN: usize = 7;
const CHUNK_SIZE: usize = 1024 * 1024;
const TAG_LEN: usize = 16;

/// 32-byte AES-256 key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Accepts 64 hex characters or base64 decoding to exactly 32 bytes.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == 64 {
            if let Ok(bytes) = hex::decode(trimmed) {
                return Self::from_slice(&bytes);
            }
        }
        if let Ok(bytes) = B64.decode(trimmed) {
            if bytes.len() == 32 {
                return Self::from_slice(&bytes);
            }
        }
        Err(BackupError::Configuration(
            "encryption key must be 32 bytes encoded as 64 hex chars or base64".into(),
        ))
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut key = [0u8; 32];
        if bytes.len() != key.len() {
            return Err(BackupError::Configuration("encryption key must be 32 bytes".into()));
        }
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| BackupError::Configuration(format!("invalid AES key: {e}")))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveEncoder {
    /// zstd level; `None` disables compression
    compression_level: Option<i32>,
    key: Option<EncryptionKey>,
}

impl ArchiveEncoder {
    pub fn new(compression_level: Option<i32>, key: Option<EncryptionKey>) -> Self {
        Self {
            compression_level,
            key,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        let level = config
            .compression_enabled()
            .then_some(config.storage.compression_level);
        let key = config
            .storage
            .encryption_key
            .as_ref()
            .map(|k| EncryptionKey::parse(k.expose()))
            .transpose()?;
        Ok(Self::new(level, key))
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_level.is_some()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// `x` -> `x.zst`; removes `x` once the output is durable.
    pub async fn compress(&self, path: &Path) -> Result<PathBuf> {
        let level = self
            .compression_level
            .ok_or_else(|| BackupError::Transform("compression is not enabled".into()))?;
        let output = append_extension(path, COMPRESSED_EXTENSION);
        let partial = append_extension(&output, "partial");

        let result = zstd_encode(path, &partial, level).await;
        finish_transform(path, &partial, &output, result, true).await?;
        debug!(input = %path.display(), output = %output.display(), "Compressed artifact");
        Ok(output)
    }

    /// `x` -> `x.enc`; removes `x` once the output is durable.
    pub async fn encrypt(&self, path: &Path) -> Result<PathBuf> {
        let key = self.require_key()?.clone();
        let output = append_extension(path, ENCRYPTED_EXTENSION);
        let partial = append_extension(&output, "partial");

        let (input, out) = (path.to_path_buf(), partial.clone());
        let result = tokio::task::spawn_blocking(move || encrypt_file(&key, &input, &out))
            .await
            .map_err(|e| BackupError::Transform(format!("encryption task failed: {e}")))
            .and_then(|r| r);
        finish_transform(path, &partial, &output, result, true).await?;
        debug!(input = %path.display(), output = %output.display(), "Encrypted artifact");
        Ok(output)
    }

    /// Inverse of [`encrypt`](Self::encrypt). Writes into `out_dir`, keeps the input.
    pub async fn decrypt(&self, path: &Path, out_dir: &Path) -> Result<PathBuf> {
        let key = self.require_key()?.clone();
        let output = out_dir.join(strip_extension(path, ENCRYPTED_EXTENSION, "dec"));
        let partial = append_extension(&output, "partial");

        let (input, out) = (path.to_path_buf(), partial.clone());
        let result = tokio::task::spawn_blocking(move || decrypt_file(&key, &input, &out))
            .await
            .map_err(|e| BackupError::Transform(format!("decryption task failed: {e}")))
            .and_then(|r| r);
        finish_transform(path, &partial, &output, result, false).await?;
        Ok(output)
    }

    /// Inverse of [`compress`](Self::compress). Writes into `out_dir`, keeps the input.
    pub async fn decompress(&self, path: &Path, out_dir: &Path) -> Result<PathBuf> {
        let output = out_dir.join(strip_extension(path, COMPRESSED_EXTENSION, "raw"));
        let partial = append_extension(&output, "partial");

        let result = zstd_decode(path, &partial).await;
        finish_transform(path, &partial, &output, result, false).await?;
        Ok(output)
    }

    /// Reverse the write path (decrypt, then decompress) into `work_dir`.
    ///
    /// Returns the plain artifact. When no transform was applied the stored
    /// artifact itself is returned untouched.
    pub async fn unpack(
        &self,
        artifact: &Path,
        compressed: bool,
        encrypted: bool,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        let mut current = artifact.to_path_buf();

        if encrypted {
            current = self.decrypt(&current, work_dir).await?;
        }
        if compressed {
            let decompressed = self.decompress(&current, work_dir).await?;
            if encrypted {
                tokio::fs::remove_file(&current).await?;
            }
            current = decompressed;
        }
        Ok(current)
    }

    fn require_key(&self) -> Result<&EncryptionKey> {
        self.key
            .as_ref()
            .ok_or_else(|| BackupError::Transform("no encryption key is configured".into()))
    }
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// File name without `.extension`, or with `.fallback` appended when absent.
fn strip_extension(path: &Path, extension: &str, fallback: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    match name.strip_suffix(&format!(".{extension}")) {
        Some(stem) if !stem.is_empty() => PathBuf::from(stem),
        _ => PathBuf::from(format!("{name}.{fallback}")),
    }
}

/// Move a finished `partial` into place and optionally drop the input.
///
/// On failure the partial output is removed and the input is left alone.
async fn finish_transform(
    input: &Path,
    partial: &Path,
    output: &Path,
    result: Result<()>,
    remove_input: bool,
) -> Result<()> {
    if let Err(e) = result {
        BestEffort::new().run(
            "remove_partial_output",
            &partial.display().to_string(),
            crate::fs::remove_path(partial).await,
        );
        return Err(match e {
            BackupError::Io(io) => BackupError::Transform(io.to_string()),
            other => other,
        });
    }

    tokio::fs::rename(partial, output).await.map_err(|e| {
        BackupError::Transform(format!("failed to finalize {}: {e}", output.display()))
    })?;
    if !tokio::fs::try_exists(output).await.unwrap_or(false) {
        return Err(BackupError::Transform(format!(
            "{} missing after write",
            output.display()
        )));
    }

    if remove_input {
        tokio::fs::remove_file(input).await?;
    }
    Ok(())
}

async fn zstd_encode(input: &Path, output: &Path, level: i32) -> Result<()> {
    let source = tokio::fs::File::open(input).await?;
    let target = tokio::fs::File::create(output).await?;
    let mut encoder = ZstdEncoder::with_quality(target, Level::Precise(level));
    tokio::io::copy(&mut BufReader::new(source), &mut encoder).await?;
    encoder.shutdown().await?;
    encoder.into_inner().sync_all().await?;
    Ok(())
}

async fn zstd_decode(input: &Path, output: &Path) -> Result<()> {
    let source = tokio::fs::File::open(input).await?;
    let mut decoder = ZstdDecoder::new(BufReader::new(source));
    let mut target = tokio::fs::File::create(output).await?;
    tokio::io::copy(&mut decoder, &mut target)
        .await
        .map_err(|e| BackupError::Transform(format!("zstd decode of {}: {e}", input.display())))?;
    target.sync_all().await?;
    Ok(())
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

/// Fill `buf` from `reader` until full or EOF; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn encrypt_file(key: &EncryptionKey, input: &Path, output: &Path) -> Result<()> {
    let cipher = key.cipher()?;
    let mut reader = std::io::BufReader::new(std::fs::File::open(input)?);
    let file = std::fs::File::create(output)?;
    let mut writer = std::io::BufWriter::new(file);

    let seed = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&seed[..NONCE_PREFIX_LEN]);

    writer.write_all(MAGIC)?;
    writer.write_all(&prefix)?;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;

    loop {
        let next_len = if current_len == CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = chunk_nonce(&prefix, counter, last);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..current_len],
                    aad: MAGIC,
                },
            )
            .map_err(|e| BackupError::Transform(format!("encryption failed: {e}")))?;

        writer.write_all(&[last as u8])?;
        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&ciphertext)?;

        if last {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| BackupError::Transform("artifact too large to encrypt".into()))?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    let file = writer
        .into_inner()
        .map_err(|e| BackupError::Transform(format!("flush failed: {e}")))?;
    file.sync_all()?;
    Ok(())
}

fn decrypt_file(key: &EncryptionKey, input: &Path, output: &Path) -> Result<()> {
    let cipher = key.cipher()?;
    let mut reader = std::io::BufReader::new(std::fs::File::open(input)?);
    let file = std::fs::File::create(output)?;
    let mut writer = std::io::BufWriter::new(file);
    let corrupt = |detail: &str| BackupError::Transform(format!("{}: {detail}", input.display()));

    let mut magic = [0u8; 8];
    if read_full(&mut reader, &mut magic)? != magic.len() || &magic != MAGIC {
        return Err(corrupt("not an encrypted backup artifact"));
    }
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    if read_full(&mut reader, &mut prefix)? != prefix.len() {
        return Err(corrupt("truncated header"));
    }

    let mut counter: u32 = 0;
    loop {
        let mut header = [0u8; 5];
        let header_len = read_full(&mut reader, &mut header)?;
        if header_len == 0 {
            return Err(corrupt("truncated: final chunk missing"));
        }
        if header_len != header.len() || header[0] > 1 {
            return Err(corrupt("malformed chunk header"));
        }
        let last = header[0] == 1;
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(corrupt("chunk length out of range"));
        }

        let mut ciphertext = vec![0u8; len];
        if read_full(&mut reader, &mut ciphertext)? != len {
            return Err(corrupt("truncated chunk"));
        }

        let nonce = chunk_nonce(&prefix, counter, last);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: MAGIC,
                },
            )
            .map_err(|_| corrupt("decryption failed (wrong key or corrupted data)"))?;
        writer.write_all(&plaintext)?;

        if last {
            let mut trailing = [0u8; 1];
            if read_full(&mut reader, &mut trailing)? != 0 {
                return Err(corrupt("trailing data after final chunk"));
            }
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| corrupt("too many chunks"))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| BackupError::Transform(format!("flush failed: {e}")))?;
    file.sync_all()?;
    Ok(())
}
