//! Credential coordinator
//!
//! Public surface for storing and retrieving encrypted credentials. Retrieval
//! is gated by the rate limiter and every operation is mirrored into the
//! audit log.
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


use crate::audit::{AuditEventType, AuditLogger, EventMetadata, EventResult, NewAuditEvent};
use crate::clock::Clock;
use crate::encryption::EncryptionEngine;
use crate::error::{CredentialError, CredentialResult, ErrorCategory, RateLimitError};
use crate::rate_limiter::{operations, RateLimitPolicy, RateLimitStatus, RateLimiter};
use crate::store::SecretStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keyward_config::CredentialSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub const CREDENTIALS_KEY: &str = "keyward.credentials.secure";
pub const ACCESS_TOKEN_KEY: &str = "keyward.credentials.access_token";
pub const METADATA_KEY: &str = "keyward.credentials.metadata";

/// Every storage key holding token material
pub const TOKEN_STORAGE_KEYS: [&str; 3] = [CREDENTIALS_KEY, ACCESS_TOKEN_KEY, METADATA_KEY];

/// Authentication secrets for one session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub token_type: String,
}

impl std::fmt::Debug for SecureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl SecureCredentials {
    /// Check the lifetime invariant and the structure of both tokens
    pub fn validate(&self) -> CredentialResult<()> {
        if self.expires_at <= self.issued_at {
            return Err(CredentialError::InvalidCredentials(
                "expiry must be after issue time".to_string(),
            ));
        }
        validate_token_format(&self.access_token)?;
        validate_token_format(&self.refresh_token)?;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn metadata(&self) -> CredentialMetadata {
        CredentialMetadata {
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            token_type: self.token_type.clone(),
        }
    }
}

/// Structural check for signed tokens (`header.payload.signature`)
///
/// Empty tokens are accepted; non-empty tokens need three non-empty
/// base64url segments.
pub fn validate_token_format(token: &str) -> CredentialResult<()> {
    if token.is_empty() {
        return Ok(());
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(CredentialError::InvalidTokenFormat(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let base64url = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=');
    for segment in segments {
        if segment.is_empty() || !segment.chars().all(base64url) {
            return Err(CredentialError::InvalidTokenFormat(
                "segments must be non-empty base64url".to_string(),
            ));
        }
    }
    Ok(())
}

/// Unencrypted expiry metadata for cheap refresh checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

/// Tokens returned by the identity provider after a refresh
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshResponse {
    pub access_token: String,
    /// Absent when the provider does not rotate refresh tokens
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl std::fmt::Debug for TokenRefreshResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefreshResponse")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Credential coordinator configuration
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Associated data for credential ciphertexts
    pub service_identifier: String,
    pub refresh_threshold: Duration,
    pub retrieval_policy: RateLimitPolicy,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self::from(&CredentialSettings::default())
    }
}

impl From<&CredentialSettings> for CredentialConfig {
    fn from(settings: &CredentialSettings) -> Self {
        Self {
            service_identifier: settings.service_identifier.clone(),
            refresh_threshold: Duration::seconds(settings.refresh_threshold_secs as i64),
            retrieval_policy: RateLimitPolicy::authentication(),
        }
    }
}

impl CredentialConfig {
    fn credentials_aad(&self) -> Vec<u8> {
        self.service_identifier.as_bytes().to_vec()
    }

    fn access_token_aad(&self) -> Vec<u8> {
        format!("{}.access_token", self.service_identifier).into_bytes()
    }
}

/// Result of a user-presence prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Granted,
    Denied,
    Cancelled,
}

/// External user-presence collaborator (biometric prompt or similar)
#[async_trait]
pub trait PresenceGate: Send + Sync {
    async fn verify(
        &self,
        reason: &str,
    ) -> Result<PresenceOutcome, Box<dyn std::error::Error + Send + Sync>>;
}

/// Absolute expiry for a token valid for `expires_in` seconds from `now`
fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> CredentialResult<DateTime<Utc>> {
    if expires_in <= 0 {
        return Err(CredentialError::InvalidCredentials(format!(
            "expires_in must be positive, got {}",
            expires_in
        )));
    }
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            CredentialError::InvalidCredentials(format!("expires_in {} is out of range", expires_in))
        })
}

/// Outcome of [`CredentialManager::clear_all_tokens`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub result: EventResult,
}

/// Stores and retrieves versioned, encrypted credentials
pub struct CredentialManager {
    store: Arc<dyn SecretStore>,
    engine: Arc<EncryptionEngine>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    config: CredentialConfig,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn SecretStore>,
        engine: Arc<EncryptionEngine>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            store,
            engine,
            limiter,
            audit,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Validate, encrypt and persist credentials plus their expiry metadata
    pub async fn store_secure_credentials(&self, credentials: &SecureCredentials) -> CredentialResult<()> {
        let started = Instant::now();
        let user = credentials.user_id.as_deref();

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::CredentialStoreAttempt,
                    EventResult::Success,
                    "store_secure_credentials",
                )
                .user(user)
                .resource(CREDENTIALS_KEY),
            )
            .await;

        let outcome = self.persist_credentials(credentials).await;

        let event = NewAuditEvent::new(
            AuditEventType::CredentialStored,
            if outcome.is_ok() { EventResult::Success } else { EventResult::Failure },
            "store_secure_credentials",
        )
        .user(user)
        .resource(CREDENTIALS_KEY)
        .duration(started.elapsed());

        match &outcome {
            Ok(()) => {
                info!(user_id = user.unwrap_or("-"), "Credentials stored");
                self.audit.record(event).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to store credentials");
                self.audit.record(event.failure(e.category(), e.to_string())).await;
            }
        }
        outcome
    }

    /// Decrypt the stored credentials
    ///
    /// With an identifier, the rate limiter is consulted before decrypting
    /// and the outcome is recorded afterwards; not-found, expired and
    /// decryption failures all count as failed attempts.
    pub async fn retrieve_secure_credentials(
        &self,
        identifier: Option<&str>,
    ) -> CredentialResult<SecureCredentials> {
        self.retrieve(identifier, None).await
    }

    /// Like [`retrieve_secure_credentials`](Self::retrieve_secure_credentials)
    /// behind a user-presence prompt
    ///
    /// A denied, cancelled or failed prompt is recorded as a failed attempt.
    pub async fn retrieve_with_presence_gate(
        &self,
        gate: &dyn PresenceGate,
        identifier: Option<&str>,
    ) -> CredentialResult<SecureCredentials> {
        self.retrieve(identifier, Some(gate)).await
    }

    /// Encrypt and persist a standalone access token
    pub async fn store_access_token(&self, token: &str) -> CredentialResult<()> {
        let started = Instant::now();

        let outcome = self.persist_access_token(token).await;

        let event = NewAuditEvent::new(
            AuditEventType::CredentialStored,
            if outcome.is_ok() { EventResult::Success } else { EventResult::Failure },
            "store_access_token",
        )
        .resource(ACCESS_TOKEN_KEY)
        .duration(started.elapsed());
        let event = match &outcome {
            Ok(()) => event,
            Err(e) => event.failure(e.category(), e.to_string()),
        };
        self.audit.record(event).await;
        outcome
    }

    /// Decrypt the standalone access token
    pub async fn retrieve_access_token(&self) -> CredentialResult<String> {
        let started = Instant::now();

        let outcome = self.load_access_token().await;

        let event = NewAuditEvent::new(
            AuditEventType::CredentialAccessed,
            if outcome.is_ok() { EventResult::Success } else { EventResult::Failure },
            "retrieve_access_token",
        )
        .resource(ACCESS_TOKEN_KEY)
        .duration(started.elapsed());
        let event = match &outcome {
            Ok(_) => event,
            Err(e) => event.failure(e.category(), e.to_string()),
        };
        self.audit.record(event).await;
        outcome
    }

    /// Replace stored credentials with a refresh response
    ///
    /// The user id and refresh token of existing credentials are kept when
    /// the response omits them; fresh credentials are created otherwise.
    pub async fn update_tokens_after_refresh(
        &self,
        response: &TokenRefreshResponse,
    ) -> CredentialResult<SecureCredentials> {
        let now = self.clock.now();
        let expires_at = match expiry_after(now, response.expires_in) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                self.audit
                    .record(
                        NewAuditEvent::new(
                            AuditEventType::TokenRefreshed,
                            EventResult::Failure,
                            "update_tokens_after_refresh",
                        )
                        .user(response.user_id.as_deref())
                        .failure(e.category(), e.to_string()),
                    )
                    .await;
                return Err(e);
            }
        };

        let existing = match self.load_credentials().await {
            Ok(credentials) => Some(credentials),
            Err(CredentialError::NotFound) => None,
            Err(e) => {
                warn!(error = %e, "Existing credentials unreadable, creating fresh credentials");
                None
            }
        };

        let updated = SecureCredentials {
            access_token: response.access_token.clone(),
            refresh_token: response
                .refresh_token
                .clone()
                .or_else(|| existing.as_ref().map(|c| c.refresh_token.clone()))
                .unwrap_or_default(),
            issued_at: now,
            expires_at,
            user_id: response
                .user_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|c| c.user_id.clone())),
            token_type: response
                .token_type
                .clone()
                .or_else(|| existing.as_ref().map(|c| c.token_type.clone()))
                .unwrap_or_else(|| "Bearer".to_string()),
        };

        self.store_secure_credentials(&updated).await?;
        self.store_access_token(&updated.access_token).await?;

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::TokenRefreshed,
                    EventResult::Success,
                    "update_tokens_after_refresh",
                )
                .user(updated.user_id.as_deref()),
            )
            .await;
        debug!(had_existing = existing.is_some(), "Tokens updated after refresh");

        Ok(updated)
    }

    /// Whether stored credentials are missing or expire within the refresh
    /// threshold
    pub async fn credentials_need_refresh(&self) -> CredentialResult<bool> {
        let Some(bytes) = self.store.retrieve_optional(METADATA_KEY).await? else {
            return Ok(true);
        };
        let metadata: CredentialMetadata = serde_json::from_slice(&bytes)?;
        Ok(self.clock.now() + self.config.refresh_threshold >= metadata.expires_at)
    }

    /// Delete every token-related key, tolerating individual failures
    pub async fn clear_all_tokens(&self) -> ClearOutcome {
        let started = Instant::now();
        let mut removed = Vec::new();
        let mut failed = Vec::new();

        for key in TOKEN_STORAGE_KEYS {
            match self.store.delete(key).await {
                Ok(()) => removed.push(key.to_string()),
                Err(e) => {
                    warn!(key = key, error = %e, "Failed to delete token key");
                    failed.push(key.to_string());
                }
            }
        }

        let result = if failed.is_empty() {
            EventResult::Success
        } else if removed.is_empty() {
            EventResult::Failure
        } else {
            EventResult::Partial
        };

        self.audit
            .record(
                NewAuditEvent::new(AuditEventType::CredentialDeleted, result, "clear_all_tokens")
                    .duration(started.elapsed())
                    .metadata(EventMetadata {
                        affected_keys: failed.clone(),
                        removed_count: Some(removed.len() as u32),
                        expected_count: Some(TOKEN_STORAGE_KEYS.len() as u32),
                        ..Default::default()
                    }),
            )
            .await;

        info!(removed = removed.len(), failed = failed.len(), "Cleared tokens");
        ClearOutcome {
            removed,
            failed,
            result,
        }
    }

    async fn persist_credentials(&self, credentials: &SecureCredentials) -> CredentialResult<()> {
        credentials.validate()?;

        let plaintext = Zeroizing::new(serde_json::to_vec(credentials)?);
        let aad = self.config.credentials_aad();
        let ciphertext = self.engine.encrypt_to_bytes(&plaintext, Some(&aad)).await?;
        self.store.store(CREDENTIALS_KEY, &ciphertext).await?;

        let metadata = serde_json::to_vec(&credentials.metadata())?;
        self.store.store(METADATA_KEY, &metadata).await?;
        Ok(())
    }

    async fn persist_access_token(&self, token: &str) -> CredentialResult<()> {
        if token.is_empty() {
            return Err(CredentialError::InvalidTokenFormat("token is empty".to_string()));
        }
        validate_token_format(token)?;

        let aad = self.config.access_token_aad();
        let ciphertext = self.engine.encrypt_to_bytes(token.as_bytes(), Some(&aad)).await?;
        self.store.store(ACCESS_TOKEN_KEY, &ciphertext).await?;
        Ok(())
    }

    async fn load_access_token(&self) -> CredentialResult<String> {
        let ciphertext = self.store.retrieve(ACCESS_TOKEN_KEY).await?;
        let aad = self.config.access_token_aad();
        let plaintext = Zeroizing::new(self.engine.decrypt(&ciphertext, Some(&aad)).await?);
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CredentialError::InvalidTokenFormat("token is not UTF-8".to_string()))
    }

    async fn load_credentials(&self) -> CredentialResult<SecureCredentials> {
        let ciphertext = self.store.retrieve(CREDENTIALS_KEY).await?;
        let aad = self.config.credentials_aad();
        let plaintext = Zeroizing::new(self.engine.decrypt(&ciphertext, Some(&aad)).await?);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn retrieve(
        &self,
        identifier: Option<&str>,
        gate: Option<&dyn PresenceGate>,
    ) -> CredentialResult<SecureCredentials> {
        let started = Instant::now();
        let policy = &self.config.retrieval_policy;

        if let Some(id) = identifier {
            self.gate_attempt(id, policy).await?;
        }

        let outcome = match gate {
            Some(gate) => match gate.verify("Access stored credentials").await {
                Ok(PresenceOutcome::Granted) => self.load_unexpired().await,
                Ok(outcome) => {
                    debug!(outcome = ?outcome, "User presence not confirmed");
                    Err(CredentialError::PresenceDenied)
                }
                Err(e) => {
                    warn!(error = %e, "User presence check failed");
                    Err(CredentialError::PresenceDenied)
                }
            },
            None => self.load_unexpired().await,
        };

        let outcome = match identifier {
            Some(id) => {
                match self
                    .limiter
                    .record_attempt(id, operations::CREDENTIAL_ACCESS, outcome.is_ok(), Some(policy))
                    .await
                {
                    Ok(()) => outcome,
                    Err(e) => {
                        let err = CredentialError::from(e);
                        self.audit_limit(id, &err).await;
                        Err(err)
                    }
                }
            }
            None => outcome,
        };

        let result = match &outcome {
            Ok(_) => EventResult::Success,
            Err(CredentialError::PresenceDenied) => EventResult::Denied,
            Err(e) if e.category() == ErrorCategory::RateLimit => EventResult::Denied,
            Err(_) => EventResult::Failure,
        };
        let user = outcome
            .as_ref()
            .ok()
            .and_then(|c| c.user_id.as_deref())
            .or(identifier);
        let event_type = if matches!(outcome, Err(CredentialError::PresenceDenied)) {
            AuditEventType::UnauthorizedAccess
        } else {
            AuditEventType::CredentialAccessed
        };

        let event = NewAuditEvent::new(event_type, result, "retrieve_secure_credentials")
            .user(user)
            .resource(CREDENTIALS_KEY)
            .duration(started.elapsed());
        let event = match &outcome {
            Ok(_) => event,
            Err(e) => event.failure(e.category(), e.to_string()),
        };
        self.audit.record(event).await;

        outcome
    }

    async fn load_unexpired(&self) -> CredentialResult<SecureCredentials> {
        let credentials = self.load_credentials().await?;
        if credentials.is_expired(self.clock.now()) {
            return Err(CredentialError::TokenExpired {
                expired_at: credentials.expires_at,
            });
        }
        Ok(credentials)
    }

    /// Reject early when the bucket is limited or locked, recording the
    /// rejected attempt first
    async fn gate_attempt(&self, identifier: &str, policy: &RateLimitPolicy) -> CredentialResult<()> {
        let status = self
            .limiter
            .check_limit(identifier, operations::CREDENTIAL_ACCESS, Some(policy))
            .await?;

        let rejection = match status {
            RateLimitStatus::Allowed { .. } => return Ok(()),
            RateLimitStatus::Limited { retry_after, .. } => {
                CredentialError::RateLimited { retry_after }
            }
            RateLimitStatus::Locked { unlock_at, .. } => CredentialError::AccountLocked { unlock_at },
        };

        let err = match self
            .limiter
            .record_attempt(identifier, operations::CREDENTIAL_ACCESS, false, Some(policy))
            .await
        {
            Ok(()) => rejection,
            Err(e @ RateLimitError::AccountLocked { .. })
            | Err(e @ RateLimitError::RateLimitExceeded { .. }) => CredentialError::from(e),
            Err(e) => {
                warn!(error = %e, "Failed to record rejected attempt");
                rejection
            }
        };

        self.audit_limit(identifier, &err).await;
        Err(err)
    }

    async fn audit_limit(&self, identifier: &str, err: &CredentialError) {
        let (event_type, metadata) = match err {
            CredentialError::AccountLocked { unlock_at } => (
                AuditEventType::AccountLocked,
                EventMetadata {
                    unlock_at: Some(*unlock_at),
                    ..Default::default()
                },
            ),
            CredentialError::RateLimited { retry_after } => (
                AuditEventType::RateLimitExceeded,
                EventMetadata {
                    retry_after: Some(*retry_after),
                    attempts_remaining: Some(0),
                    ..Default::default()
                },
            ),
            _ => return,
        };

        self.audit
            .record(
                NewAuditEvent::new(event_type, EventResult::Denied, "retrieve_secure_credentials")
                    .user(Some(identifier))
                    .metadata(metadata),
            )
            .await;
    }
}
