//! Secret store interface and adapters
//!
//! The core only ever talks to raw byte storage through [`SecretStore`]:
//! - [`MemorySecretStore`] keeps secrets in process memory
//! - [`FileSecretStore`] keeps one sealed file per key in a directory
//! - [`ValidatingStore`] wraps any adapter and rejects unsafe keys
//!
//! Platform keychains plug in by implementing the trait.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::encryption::{open, seal, SymmetricKey, KEY_LEN};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maximum storage key length
pub const MAX_KEY_LEN: usize = 256;

/// Substrings rejected even though every character is allowed
const FORBIDDEN_KEY_PATTERNS: &[&str] = &["--", ".."];

/// Associated data for files sealed by [`FileSecretStore`]
const FILE_STORE_AAD: &[u8] = b"keyward.file-store";

/// Validate a storage key before it reaches an adapter
///
/// Keys are 1-256 characters of `[A-Za-z0-9_.-]` and must not contain
/// `--` or `..`.
pub fn validate_storage_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key length must be 1-{} characters, got {}",
            MAX_KEY_LEN,
            key.len()
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(StoreError::InvalidKey(format!(
            "key contains characters outside [A-Za-z0-9_.-]: {}",
            truncate_for_log(key)
        )));
    }

    if let Some(pattern) = FORBIDDEN_KEY_PATTERNS.iter().find(|p| key.contains(*p)) {
        return Err(StoreError::InvalidKey(format!(
            "key contains forbidden sequence '{}'",
            pattern
        )));
    }

    Ok(())
}

fn truncate_for_log(key: &str) -> String {
    key.chars().take(64).collect()
}

/// Raw byte storage keyed by string
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store (or replace) a value
    async fn store(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Retrieve a value, failing with `StoreError::NotFound` when absent
    async fn retrieve(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Delete a value; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Check whether a value exists
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Retrieve a value, mapping not-found to `None`
    async fn retrieve_optional(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.retrieve(key).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Adapter wrapper that validates every key before delegating
pub struct ValidatingStore {
    inner: Arc<dyn SecretStore>,
}

impl ValidatingStore {
    pub fn new(inner: Arc<dyn SecretStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SecretStore for ValidatingStore {
    async fn store(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_storage_key(key)?;
        self.inner.store(key, value).await
    }

    async fn retrieve(&self, key: &str) -> StoreResult<Vec<u8>> {
        validate_storage_key(key)?;
        self.inner.retrieve(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_storage_key(key)?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_storage_key(key)?;
        self.inner.exists(key).await
    }
}

/// In-memory secret store
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// List stored keys (sorted)
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<Vec<u8>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries.contains_key(key))
    }
}

/// File-backed secret store
///
/// Every value is sealed with AES-256-GCM under a store master key before it
/// touches the disk.
pub struct FileSecretStore {
    /// Storage directory
    storage_path: PathBuf,
    /// Master key sealing every file
    master_key: SymmetricKey,
}

impl FileSecretStore {
    /// Create a new file store
    ///
    /// # Arguments
    /// * `storage_path` - Directory where sealed secrets will be stored
    /// * `master_key` - Optional master key (if None, derived from `KEYWARD_MASTER_KEY`
    ///   or loaded/generated in the storage directory)
    pub async fn new<P: AsRef<Path>>(
        storage_path: P,
        master_key: Option<&[u8]>,
    ) -> StoreResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();

        fs::create_dir_all(&storage_path).await?;

        let master_key = match master_key {
            Some(key) => SymmetricKey::from_slice(key)
                .map_err(|_| StoreError::Backend(format!("Master key must be exactly {} bytes", KEY_LEN)))?,
            None => Self::derive_master_key(&storage_path).await?,
        };

        info!(path = %storage_path.display(), "Opened file secret store");

        Ok(Self {
            storage_path,
            master_key,
        })
    }

    /// Derive the master key from the environment, or load/generate one
    async fn derive_master_key(storage_path: &Path) -> StoreResult<SymmetricKey> {
        if let Ok(key_str) = std::env::var("KEYWARD_MASTER_KEY") {
            // If it's a hex string, decode it
            if let Ok(key_bytes) = hex::decode(&key_str) {
                if let Ok(key) = SymmetricKey::from_slice(&key_bytes) {
                    return Ok(key);
                }
            }
            // Otherwise, derive from string using SHA256
            let hash = Sha256::digest(key_str.as_bytes());
            return SymmetricKey::from_slice(&hash)
                .map_err(|e| StoreError::Backend(e.to_string()));
        }

        let key_file = storage_path.join(".master.key");
        match fs::read(&key_file).await {
            Ok(bytes) => SymmetricKey::from_slice(&bytes)
                .map_err(|_| StoreError::Backend("Corrupt master key file".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No KEYWARD_MASTER_KEY found, generating a local master key. This should be set in production!");
                let key = SymmetricKey::generate();
                fs::write(&key_file, key.as_bytes()).await?;
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get path for a secret file
    fn secret_path(&self, key: &str) -> PathBuf {
        // Sanitize key for filesystem
        let sanitized = key.replace(['/', '\\'], "_");
        self.storage_path.join(format!("{}.secret", sanitized))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn store(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let sealed = seal(&self.master_key, value, Some(FILE_STORE_AAD))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        // Write then rename so readers never observe a half-written file
        let path = self.secret_path(key);
        let tmp = path.with_extension("secret.tmp");
        fs::write(&tmp, sealed).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key = key, "Secret written");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.secret_path(key);
        let sealed = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        open(&self.master_key, &sealed, Some(FILE_STORE_AAD))
            .map_err(|_| StoreError::Backend(format!("Unreadable secret file for {}", key)))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.secret_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(fs::try_exists(self.secret_path(key)).await?)
    }
}
