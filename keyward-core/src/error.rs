//! Error types for the credential security core
//!
//! Every component owns an error enum and maps the errors of the layer below
//! into its own vocabulary through explicit `From` implementations.
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Coarse error classification shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input, caller-fixable, never retried automatically
    Validation,
    /// Decryption or integrity failure
    Cryptographic,
    /// Policy violation such as an overdue key rotation
    Compliance,
    /// Rate limit or lockout, always carries a retry time
    RateLimit,
    /// Secret store failure
    Storage,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Cryptographic => "cryptographic",
            ErrorCategory::Compliance => "compliance",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Storage => "storage",
        }
    }
}

/// Secret store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Secret store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::InvalidKey(_) => ErrorCategory::Validation,
            _ => ErrorCategory::Storage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Unsupported key version: {0}")]
    UnsupportedKeyVersion(u32),

    #[error("Key rotation overdue for version {version} ({days_overdue} days past grace period)")]
    RotationOverdue { version: u32, days_overdue: i64 },

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Key rotation error: {0}")]
    Rotation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeyError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            KeyError::Storage(e) => e.category(),
            KeyError::UnsupportedKeyVersion(_) | KeyError::InvalidKeyMaterial(_) => {
                ErrorCategory::Cryptographic
            }
            KeyError::RotationOverdue { .. } => ErrorCategory::Compliance,
            KeyError::Rotation(_) => ErrorCategory::Validation,
            KeyError::Serialization(_) => ErrorCategory::Storage,
        }
    }
}

/// Authenticated encryption errors
///
/// `DecryptionFailed` deliberately carries no detail: a wrong key, a tampered
/// payload and a truncated blob are indistinguishable to the caller.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Unsupported key version: {0}")]
    UnsupportedKeyVersion(u32),

    #[error("Key unavailable: {0}")]
    Key(KeyError),
}

impl CryptoError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CryptoError::Key(e) => e.category(),
            _ => ErrorCategory::Cryptographic,
        }
    }
}

impl From<KeyError> for CryptoError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::UnsupportedKeyVersion(v) => CryptoError::UnsupportedKeyVersion(v),
            other => CryptoError::Key(other),
        }
    }
}

/// Rate limiter errors
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, retry after {retry_after}")]
    RateLimitExceeded { retry_after: DateTime<Utc> },

    #[error("Account locked until {unlock_at}")]
    AccountLocked { unlock_at: DateTime<Utc> },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RateLimitError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RateLimitError::RateLimitExceeded { .. } | RateLimitError::AccountLocked { .. } => {
                ErrorCategory::RateLimit
            }
            RateLimitError::Storage(e) => e.category(),
            RateLimitError::Serialization(_) => ErrorCategory::Storage,
        }
    }
}

/// Audit logging errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl AuditError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AuditError::Storage(e) => e.category(),
            AuditError::Crypto(e) => e.category(),
            AuditError::IntegrityViolation(_) => ErrorCategory::Cryptographic,
            AuditError::Serialization(_) | AuditError::Archive(_) => ErrorCategory::Storage,
        }
    }
}

/// Credential coordinator errors
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Invalid token format: {0}")]
    InvalidTokenFormat(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Credentials not found")]
    NotFound,

    #[error("Token expired at {expired_at}")]
    TokenExpired { expired_at: DateTime<Utc> },

    #[error("Rate limit exceeded, retry after {retry_after}")]
    RateLimited { retry_after: DateTime<Utc> },

    #[error("Account locked until {unlock_at}")]
    AccountLocked { unlock_at: DateTime<Utc> },

    #[error("User presence check was not satisfied")]
    PresenceDenied,

    #[error("Cryptographic error: {0}")]
    Crypto(CryptoError),

    #[error("Key error: {0}")]
    Key(KeyError),

    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CredentialError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CredentialError::InvalidTokenFormat(_)
            | CredentialError::InvalidCredentials(_)
            | CredentialError::NotFound
            | CredentialError::TokenExpired { .. }
            | CredentialError::PresenceDenied => ErrorCategory::Validation,
            CredentialError::RateLimited { .. } | CredentialError::AccountLocked { .. } => {
                ErrorCategory::RateLimit
            }
            CredentialError::Crypto(e) => e.category(),
            CredentialError::Key(e) => e.category(),
            CredentialError::Storage(e) => e.category(),
            CredentialError::Serialization(_) => ErrorCategory::Storage,
        }
    }

    /// Coarse message safe to show to an end user
    pub fn user_message(&self, now: DateTime<Utc>) -> String {
        match self {
            CredentialError::RateLimited { retry_after } => {
                let secs = (*retry_after - now).num_seconds().max(1);
                format!("Too many attempts, try again in {} seconds", secs)
            }
            CredentialError::AccountLocked { unlock_at } => {
                format!("Account locked until {}", unlock_at.to_rfc3339())
            }
            CredentialError::TokenExpired { .. } => "Session expired, please sign in again".to_string(),
            CredentialError::InvalidTokenFormat(_) | CredentialError::InvalidCredentials(_) => {
                "Invalid credentials".to_string()
            }
            CredentialError::Key(KeyError::RotationOverdue { .. }) => {
                "Security maintenance required, please try again later".to_string()
            }
            _ => "Authentication failed".to_string(),
        }
    }
}

impl From<StoreError> for CredentialError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => CredentialError::NotFound,
            other => CredentialError::Storage(other),
        }
    }
}

impl From<KeyError> for CredentialError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Storage(s) => CredentialError::Storage(s),
            other => CredentialError::Key(other),
        }
    }
}

impl From<CryptoError> for CredentialError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Key(k) => CredentialError::from(k),
            other => CredentialError::Crypto(other),
        }
    }
}

impl From<RateLimitError> for CredentialError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::RateLimitExceeded { retry_after } => {
                CredentialError::RateLimited { retry_after }
            }
            RateLimitError::AccountLocked { unlock_at } => CredentialError::AccountLocked { unlock_at },
            RateLimitError::Storage(s) => CredentialError::Storage(s),
            RateLimitError::Serialization(s) => CredentialError::Serialization(s),
        }
    }
}

/// Legacy data migration errors
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Migration session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    #[error("Insecure legacy keys still present after purge: {0:?}")]
    InsecureKeyPurgeFailed(Vec<String>),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::ChecksumMismatch { .. } => ErrorCategory::Cryptographic,
            MigrationError::SessionNotFound(_) | MigrationError::InvalidState(_) => {
                ErrorCategory::Validation
            }
            MigrationError::InsecureKeyPurgeFailed(_) => ErrorCategory::Compliance,
            MigrationError::Storage(e) => e.category(),
            MigrationError::Crypto(e) => e.category(),
            MigrationError::Serialization(_) => ErrorCategory::Storage,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type KeyResult<T> = Result<T, KeyError>;
pub type CryptoResult<T> = Result<T, CryptoError>;
pub type RateLimitResult<T> = Result<T, RateLimitError>;
pub type AuditResult<T> = Result<T, AuditError>;
pub type CredentialResult<T> = Result<T, CredentialError>;
pub type MigrationResult<T> = Result<T, MigrationError>;
