//! Data key providers.
//!
//! The data key encrypts every secret bag. In a cloud deployment it would be
//! held by a vault; locally it lives in a file readable only by its owner.

use super::crypto::{generate_key, KEY_LEN};
use crate::error::{HavenError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

/// Source of the data key used to seal secrets.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Return the 256-bit data key, creating it if this provider supports that.
    async fn data_key(&self) -> Result<[u8; KEY_LEN]>;
}

/// Fixed key held in memory.
pub struct StaticKeyProvider {
    key: [u8; KEY_LEN],
}

impl StaticKeyProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// A provider with a freshly generated key.
    pub fn random() -> Self {
        Self::new(generate_key())
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn data_key(&self) -> Result<[u8; KEY_LEN]> {
        Ok(self.key)
    }
}

/// Key stored base64 encoded in a file with mode 0600.
///
/// The file is created with a random key on first use.
pub struct KeyFile {
    path: PathBuf,
    cached: OnceCell<[u8; KEY_LEN]>,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cached: OnceCell::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load_or_create(&self) -> Result<[u8; KEY_LEN]> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => decode_key(&self.path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match self.create().await {
                Ok(key) => Ok(key),
                // Another process created it first
                Err(HavenError::IoError { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    let content = tokio::fs::read_to_string(&self.path)
                        .await
                        .map_err(|e| HavenError::IoError { path: self.path.clone(), source: e })?;
                    decode_key(&self.path, &content)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(HavenError::IoError { path: self.path.clone(), source: e }),
        }
    }

    async fn create(&self) -> Result<[u8; KEY_LEN]> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HavenError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let key = generate_key();
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&self.path)
            .await
            .map_err(|e| HavenError::IoError { path: self.path.clone(), source: e })?;
        file.write_all(BASE64.encode(key).as_bytes())
            .await
            .map_err(|e| HavenError::IoError { path: self.path.clone(), source: e })?;
        file.sync_all()
            .await
            .map_err(|e| HavenError::IoError { path: self.path.clone(), source: e })?;

        info!("Created new data key");
        Ok(key)
    }
}

#[async_trait]
impl KeyProvider for KeyFile {
    async fn data_key(&self) -> Result<[u8; KEY_LEN]> {
        self.cached.get_or_try_init(|| self.load_or_create()).await.copied()
    }
}

fn decode_key(path: &Path, content: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(content.trim())
        .map_err(|e| HavenError::Crypto { reason: format!("Invalid key file {}: {e}", path.display()) })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| HavenError::Crypto {
        reason: format!("Key file {} holds {} bytes, expected {}", path.display(), bytes.len(), KEY_LEN),
    })
}
