//! Authenticated encryption with key-version tagging
//!
//! Versioned framing: the first 4 bytes are the big-endian key version, the
//! remainder is the AES-256-GCM combined blob (`nonce || ciphertext || tag`).
//! Blobs without a plausible version header are treated as legacy ciphertext.
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


use crate::error::{CryptoError, CryptoResult, KeyError, KeyResult};
use crate::key_rotation::KeyRotationManager;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key length
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag length
pub const TAG_LEN: usize = 16;
/// Length of the big-endian version header
pub const VERSION_HEADER_LEN: usize = 4;
/// Lowest self-describing key version
pub const MIN_KEY_VERSION: u32 = 1;
/// Versions at or above this value are not self-describing
pub const MAX_KEY_VERSION: u32 = 1000;

/// 256-bit symmetric key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Generate fresh key material from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidKeyMaterial(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Seal `plaintext` under `key`, binding the optional associated data
///
/// Returns `nonce || ciphertext || tag`.
pub fn seal(key: &SymmetricKey, plaintext: &[u8], aad: Option<&[u8]>) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    // Prepend nonce to ciphertext
    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Open a `nonce || ciphertext || tag` blob sealed by [`seal`]
pub fn open(key: &SymmetricKey, combined: &[u8], aad: Option<&[u8]>) -> CryptoResult<Vec<u8>> {
    if combined.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Ciphertext tagged with the key version that sealed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedCiphertext {
    pub version: u32,
    pub payload: Vec<u8>,
}

impl VersionedCiphertext {
    /// Whether `version` can be trusted as a version header
    pub fn is_valid_version(version: u32) -> bool {
        (MIN_KEY_VERSION..MAX_KEY_VERSION).contains(&version)
    }

    /// Serialize as `version (u32 BE) || payload`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VERSION_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.version.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a versioned blob; `None` when there is no plausible version header
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < VERSION_HEADER_LEN {
            return None;
        }
        let (header, payload) = bytes.split_at(VERSION_HEADER_LEN);
        let version = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if !Self::is_valid_version(version) {
            return None;
        }
        Some(Self {
            version,
            payload: payload.to_vec(),
        })
    }
}

/// AEAD engine sealing with the current key version and opening by the
/// version embedded in the ciphertext
pub struct EncryptionEngine {
    keys: Arc<KeyRotationManager>,
}

impl EncryptionEngine {
    pub fn new(keys: Arc<KeyRotationManager>) -> Self {
        Self { keys }
    }

    /// Encrypt with the current key version
    ///
    /// Fails with a compliance error when rotation is overdue and the policy
    /// blocks access to the current key.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> CryptoResult<VersionedCiphertext> {
        let (version, key) = self.keys.current_key().await?;
        let payload = seal(&key, plaintext, aad)?;
        debug!(key_version = version, "Sealed payload");
        Ok(VersionedCiphertext { version, payload })
    }

    /// Encrypt and serialize to the versioned wire framing
    pub async fn encrypt_to_bytes(&self, plaintext: &[u8], aad: Option<&[u8]>) -> CryptoResult<Vec<u8>> {
        Ok(self.encrypt(plaintext, aad).await?.to_bytes())
    }

    /// Decrypt a versioned ciphertext using exactly the key of its version
    pub async fn decrypt_versioned(
        &self,
        ciphertext: &VersionedCiphertext,
        aad: Option<&[u8]>,
    ) -> CryptoResult<Vec<u8>> {
        let key = self.keys.key_for_version(ciphertext.version).await?;
        open(&key, &ciphertext.payload, aad)
    }

    /// Decrypt raw bytes, falling back to the legacy path when no version
    /// header is present
    pub async fn decrypt(&self, data: &[u8], aad: Option<&[u8]>) -> CryptoResult<Vec<u8>> {
        match VersionedCiphertext::parse(data) {
            Some(versioned) => self.decrypt_versioned(&versioned, aad).await,
            None => self.decrypt_legacy(data, aad).await,
        }
    }

    /// Pre-versioning data: try the current key, then the single legacy key
    async fn decrypt_legacy(&self, data: &[u8], aad: Option<&[u8]>) -> CryptoResult<Vec<u8>> {
        debug!("No version header, using legacy decryption path");

        let (_, current) = self.keys.current_key_unchecked().await?;
        if let Ok(plaintext) = open(&current, data, aad) {
            return Ok(plaintext);
        }

        match self.keys.legacy_key().await? {
            Some(legacy) => open(&legacy, data, aad),
            None => Err(CryptoError::DecryptionFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key_rotation::RotationPolicy;
    use crate::store::MemorySecretStore;
    use chrono::Utc;

    fn engine() -> (EncryptionEngine, Arc<KeyRotationManager>) {
        let store = Arc::new(MemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = Arc::new(KeyRotationManager::new(store, clock, RotationPolicy::default()));
        (EncryptionEngine::new(keys.clone()), keys)
    }

    #[tokio::test]
    async fn test_round_trip_with_associated_data() {
        let (engine, _) = engine();
        let sealed = engine.encrypt(b"refresh-token", Some(b"svc")).await.unwrap();
        assert_eq!(sealed.version, 1);

        let opened = engine.decrypt(&sealed.to_bytes(), Some(b"svc")).await.unwrap();
        assert_eq!(opened, b"refresh-token");
    }

    #[tokio::test]
    async fn test_wrong_associated_data_is_generic_failure() {
        let (engine, _) = engine();
        let sealed = engine.encrypt_to_bytes(b"secret", Some(b"svc-a")).await.unwrap();

        let result = engine.decrypt(&sealed, Some(b"svc-b")).await;
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
        let result = engine.decrypt(&sealed, None).await;
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_tampered_payload_fails() {
        let (engine, _) = engine();
        let mut sealed = engine.encrypt_to_bytes(b"secret", None).await.unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            engine.decrypt(&sealed, None).await,
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_old_versions_stay_decryptable_after_rotation() {
        let (engine, keys) = engine();
        let before = engine.encrypt(b"before", None).await.unwrap();

        keys.rotate_key("scheduled").await.unwrap();
        let after = engine.encrypt(b"after", None).await.unwrap();

        assert_eq!(before.version, 1);
        assert_eq!(after.version, 2);
        assert_eq!(engine.decrypt_versioned(&before, None).await.unwrap(), b"before");
        assert_eq!(engine.decrypt_versioned(&after, None).await.unwrap(), b"after");

        // Relabelling new ciphertext with the old version must not open it
        let relabelled = VersionedCiphertext {
            version: 1,
            payload: after.payload.clone(),
        };
        assert!(engine.decrypt_versioned(&relabelled, None).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_version_is_reported() {
        let (engine, _) = engine();
        let sealed = engine.encrypt(b"x", None).await.unwrap();
        let unknown = VersionedCiphertext {
            version: 42,
            payload: sealed.payload,
        };

        let result = engine.decrypt(&unknown.to_bytes(), None).await;
        assert!(matches!(result, Err(CryptoError::UnsupportedKeyVersion(42))));
    }

    #[tokio::test]
    async fn test_legacy_ciphertext_uses_legacy_key() {
        let (engine, keys) = engine();
        let legacy = SymmetricKey::generate();
        keys.install_legacy_key(&legacy).await.unwrap();

        // Force a nonce whose first bytes cannot pass as a version header
        let blob = loop {
            let blob = seal(&legacy, b"old data", None).unwrap();
            if VersionedCiphertext::parse(&blob).is_none() {
                break blob;
            }
        };

        assert_eq!(engine.decrypt(&blob, None).await.unwrap(), b"old data");
    }

    #[test]
    fn test_version_header_range() {
        assert!(VersionedCiphertext::parse(&[0, 0, 0, 1, 9]).is_some());
        assert!(VersionedCiphertext::parse(&[0, 0, 0, 0, 9]).is_none());
        assert!(VersionedCiphertext::parse(&1000u32.to_be_bytes()).is_none());
        assert!(VersionedCiphertext::parse(&[0, 1]).is_none());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = SymmetricKey::generate();
        assert_eq!(format!("{:?}", key), "SymmetricKey([REDACTED])");
    }
}
