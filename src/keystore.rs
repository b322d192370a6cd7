//! Persistent key material for signing session cookies.
//!
//! The key file holds one key per line, base64 encoded, oldest first. It is
//! only ever appended to. The newest key signs new cookies and every stored
//! key still verifies cookies issued under it.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Default key length in bytes.
pub const DEFAULT_KEY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {path} line {line}: not a base64 key record")]
    InvalidRecord { path: PathBuf, line: usize },
    #[error("could not generate auth key: {0}")]
    KeyGen(#[source] rand::Error),
    #[error("key length must be greater than zero")]
    ZeroLength,
}

/// Keys loaded from an auth key file.
#[derive(Debug, Clone)]
pub struct KeySet {
    path: PathBuf,
    keys: Vec<Vec<u8>>,
}

impl KeySet {
    /// Load the key file at `path`, creating it if missing.
    ///
    /// A fresh key of `key_len` bytes is generated and appended when the file
    /// holds no keys or when `force_rotate` is set.
    pub fn load(
        path: impl AsRef<Path>,
        force_rotate: bool,
        key_len: usize,
    ) -> Result<Self, KeyStoreError> {
        let path = path.as_ref().to_path_buf();
        if key_len == 0 {
            return Err(KeyStoreError::ZeroLength);
        }
        let io_err = |source| KeyStoreError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&path)
            .map_err(io_err)?;

        let mut keys = Vec::new();
        for (idx, line) in BufReader::new(&file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            let record = line.trim();
            if record.is_empty() {
                continue;
            }
            let key = BASE64_STANDARD
                .decode(record)
                .map_err(|_| KeyStoreError::InvalidRecord {
                    path: path.clone(),
                    line: idx + 1,
                })?;
            keys.push(key);
        }

        if keys.is_empty() || force_rotate {
            let mut key = vec![0u8; key_len];
            OsRng.try_fill_bytes(&mut key).map_err(KeyStoreError::KeyGen)?;

            let mut record = BASE64_STANDARD.encode(&key);
            record.push('\n');
            file.write_all(record.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;

            keys.push(key);
            info!(path = %path.display(), count = keys.len(), "Appended new auth key");
        }

        Ok(Self { path, keys })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All keys in file order, oldest first.
    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    /// Flattened `(authentication, encryption)` pairs in file order.
    /// Encryption is never enabled, so the second half is always `None`.
    pub fn key_pairs(&self) -> Vec<(&[u8], Option<&[u8]>)> {
        self.keys.iter().map(|k| (k.as_slice(), None)).collect()
    }

    /// The newest key, used to sign new cookies.
    pub fn signing_key(&self) -> &[u8] {
        self.keys.last().map(Vec::as_slice).unwrap_or_default()
    }

    /// Keys to try when verifying a cookie, newest first.
    pub fn verification_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().rev().map(Vec::as_slice)
    }
}
