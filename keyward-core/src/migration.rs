//! Legacy data migration with checksum verification
//!
//! Moves plaintext legacy values into the versioned, encrypted layout. Every
//! key is written, re-read and re-checksummed before its legacy source is
//! deleted. Progress is persisted per session so an interrupted migration
//! can be resumed or rolled back.
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
use crate::error::{ErrorCategory, MigrationError, MigrationResult};
use crate::store::SecretStore;
use chrono::{DateTime, Utc};
use keyward_config::MigrationSettings;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const SESSION_PREFIX: &str = "keyward.migration.session.";
pub const COMPLETE_MARKER_KEY: &str = "keyward.migration.complete";
pub const SECURE_PREFIX: &str = "keyward.secure.";

/// Destination key for a migrated legacy key
pub fn destination_key(legacy_key: &str) -> String {
    format!("{}{}", SECURE_PREFIX, legacy_key)
}

fn session_key(id: Uuid) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

/// SHA-256 hex digest
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Known-insecure legacy keys purged after a fully verified migration
    pub insecure_legacy_keys: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::from(&MigrationSettings::default())
    }
}

impl From<&MigrationSettings> for MigrationConfig {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            insecure_legacy_keys: settings.insecure_legacy_keys.clone(),
        }
    }
}

/// Verification record for one migrated key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub key: String,
    pub original_checksum: String,
    pub migrated_checksum: String,
    pub timestamp: DateTime<Utc>,
    pub verified: bool,
}

impl MigrationRecord {
    pub fn new(key: &str, original_checksum: String, migrated_checksum: String, timestamp: DateTime<Utc>) -> Self {
        let verified = original_checksum == migrated_checksum;
        Self {
            key: key.to_string(),
            original_checksum,
            migrated_checksum,
            timestamp,
            verified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

/// Persisted progress of a multi-key migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dry_run: bool,
    pub status: MigrationStatus,
    /// Keys not yet verified
    pub pending: Vec<String>,
    pub records: Vec<MigrationRecord>,
    pub skipped: Vec<String>,
}

/// Outcome of a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub session_id: Uuid,
    pub dry_run: bool,
    pub records: Vec<MigrationRecord>,
    /// Keys with no legacy value
    pub skipped: Vec<String>,
    pub purged_insecure_keys: Vec<String>,
    /// Every key verified, insecure keys purged and marker written
    pub completed: bool,
}

impl MigrationReport {
    pub fn all_verified(&self) -> bool {
        self.records.iter().all(|r| r.verified)
    }

    /// Surface the first checksum mismatch as an error
    pub fn into_result(self) -> MigrationResult<Self> {
        match self.records.iter().find(|r| !r.verified) {
            Some(record) => Err(MigrationError::ChecksumMismatch {
                key: record.key.clone(),
                expected: record.original_checksum.clone(),
                actual: record.migrated_checksum.clone(),
            }),
            None => Ok(self),
        }
    }
}

/// Completion marker contents
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionMarker {
    session_id: Uuid,
    completed_at: DateTime<Utc>,
    keys: Vec<String>,
}

/// Outcome of a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub session_id: Uuid,
    pub restored: Vec<String>,
}

/// Moves legacy values from one store into the encrypted layout of another
pub struct MigrationService {
    legacy: Arc<dyn SecretStore>,
    destination: Arc<dyn SecretStore>,
    engine: Arc<EncryptionEngine>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    config: MigrationConfig,
}

impl MigrationService {
    pub fn new(
        legacy: Arc<dyn SecretStore>,
        destination: Arc<dyn SecretStore>,
        engine: Arc<EncryptionEngine>,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            legacy,
            destination,
            engine,
            audit,
            clock,
            config,
        }
    }

    /// Migrate the given legacy keys
    ///
    /// A dry run performs every write and verification step but removes its
    /// destination values again, keeps legacy data and never marks the
    /// migration complete.
    pub async fn perform_secure_migration(
        &self,
        keys: &[String],
        dry_run: bool,
    ) -> MigrationResult<MigrationReport> {
        let now = self.clock.now();
        let session = MigrationSession {
            id: Uuid::new_v4(),
            started_at: now,
            updated_at: now,
            dry_run,
            status: MigrationStatus::InProgress,
            pending: keys.to_vec(),
            records: Vec::new(),
            skipped: Vec::new(),
        };
        self.save_session(&session).await?;

        info!(session_id = %session.id, keys = keys.len(), dry_run, "Starting secure migration");
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::MigrationStarted,
                    EventResult::Success,
                    "perform_secure_migration",
                )
                .system()
                .metadata(EventMetadata {
                    migration_session: Some(session.id),
                    affected_keys: keys.to_vec(),
                    expected_count: Some(keys.len() as u32),
                    ..Default::default()
                }),
            )
            .await;

        self.run_session(session).await
    }

    /// Continue a session that was interrupted or failed
    pub async fn resume_migration(&self, session_id: Uuid) -> MigrationResult<MigrationReport> {
        let mut session = self.session(session_id).await?;
        match session.status {
            MigrationStatus::InProgress | MigrationStatus::Failed => {}
            status => {
                return Err(MigrationError::InvalidState(format!(
                    "session {} is {:?}",
                    session_id, status
                )))
            }
        }

        info!(session_id = %session_id, pending = session.pending.len(), "Resuming migration");
        session.status = MigrationStatus::InProgress;
        self.run_session(session).await
    }

    /// Restore every verified key of a session to its legacy location
    pub async fn rollback_migration(&self, session_id: Uuid) -> MigrationResult<RollbackReport> {
        let mut session = self.session(session_id).await?;
        if session.status == MigrationStatus::RolledBack {
            return Err(MigrationError::InvalidState(format!(
                "session {} already rolled back",
                session_id
            )));
        }

        let mut restored = Vec::new();
        if !session.dry_run {
            for record in session.records.iter().filter(|r| r.verified) {
                let dest = destination_key(&record.key);
                let Some(ciphertext) = self.destination.retrieve_optional(&dest).await? else {
                    warn!(key = %record.key, "Migrated value missing, nothing to restore");
                    continue;
                };
                let plaintext = Zeroizing::new(
                    self.engine
                        .decrypt(&ciphertext, Some(record.key.as_bytes()))
                        .await?,
                );
                self.legacy.store(&record.key, &plaintext).await?;
                self.destination.delete(&dest).await?;
                restored.push(record.key.clone());
            }

            if self.marker_session().await? == Some(session_id) {
                self.destination.delete(COMPLETE_MARKER_KEY).await?;
            }
        }

        session.status = MigrationStatus::RolledBack;
        session.updated_at = self.clock.now();
        self.save_session(&session).await?;

        info!(session_id = %session_id, restored = restored.len(), "Migration rolled back");
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::MigrationRolledBack,
                    EventResult::Success,
                    "rollback_migration",
                )
                .system()
                .metadata(EventMetadata {
                    migration_session: Some(session_id),
                    affected_keys: restored.clone(),
                    ..Default::default()
                }),
            )
            .await;

        Ok(RollbackReport {
            session_id,
            restored,
        })
    }

    /// Decrypt a migrated value
    pub async fn read_migrated(&self, legacy_key: &str) -> MigrationResult<Option<Vec<u8>>> {
        match self
            .destination
            .retrieve_optional(&destination_key(legacy_key))
            .await?
        {
            Some(ciphertext) => Ok(Some(
                self.engine
                    .decrypt(&ciphertext, Some(legacy_key.as_bytes()))
                    .await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn is_migration_complete(&self) -> MigrationResult<bool> {
        Ok(self.destination.exists(COMPLETE_MARKER_KEY).await?)
    }

    pub async fn session(&self, session_id: Uuid) -> MigrationResult<MigrationSession> {
        match self.destination.retrieve_optional(&session_key(session_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(MigrationError::SessionNotFound(session_id)),
        }
    }

    async fn save_session(&self, session: &MigrationSession) -> MigrationResult<()> {
        self.destination
            .store(&session_key(session.id), &serde_json::to_vec(session)?)
            .await?;
        Ok(())
    }

    async fn marker_session(&self) -> MigrationResult<Option<Uuid>> {
        match self.destination.retrieve_optional(COMPLETE_MARKER_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice::<CompletionMarker>(&bytes)
                .ok()
                .map(|m| m.session_id)),
            None => Ok(None),
        }
    }

    async fn run_session(&self, mut session: MigrationSession) -> MigrationResult<MigrationReport> {
        let mut mismatched = Vec::new();

        for key in session.pending.clone() {
            let outcome = match self.migrate_key(&key, session.dry_run).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    session.status = MigrationStatus::Failed;
                    session.updated_at = self.clock.now();
                    self.save_session(&session).await?;
                    self.audit_failure(&session, e.category(), &e.to_string()).await;
                    return Err(e);
                }
            };

            match outcome {
                Some(record) => {
                    if record.verified {
                        session.pending.retain(|k| k != &key);
                    } else {
                        mismatched.push(key.clone());
                    }
                    session.records.retain(|r| r.key != key);
                    session.records.push(record);
                }
                None => {
                    session.pending.retain(|k| k != &key);
                    if !session.skipped.contains(&key) {
                        session.skipped.push(key.clone());
                    }
                }
            }
            session.updated_at = self.clock.now();
            self.save_session(&session).await?;
        }

        let mut purged = Vec::new();
        let mut completed = false;

        if !mismatched.is_empty() {
            session.status = MigrationStatus::Failed;
            self.audit_failure(
                &session,
                ErrorCategory::Cryptographic,
                &format!("checksum mismatch for {}", mismatched.join(", ")),
            )
            .await;
        } else if session.dry_run {
            session.status = MigrationStatus::Completed;
            debug!(session_id = %session.id, "Dry run finished, legacy data untouched");
        } else {
            match self.purge_insecure_keys().await {
                Ok(removed) => purged = removed,
                Err(e) => {
                    session.status = MigrationStatus::Failed;
                    session.updated_at = self.clock.now();
                    self.save_session(&session).await?;
                    self.audit_failure(&session, e.category(), &e.to_string()).await;
                    return Err(e);
                }
            }

            let marker = CompletionMarker {
                session_id: session.id,
                completed_at: self.clock.now(),
                keys: session.records.iter().map(|r| r.key.clone()).collect(),
            };
            self.destination
                .store(COMPLETE_MARKER_KEY, &serde_json::to_vec(&marker)?)
                .await?;
            session.status = MigrationStatus::Completed;
            completed = true;

            info!(
                session_id = %session.id,
                migrated = session.records.len(),
                purged = purged.len(),
                "Secure migration completed"
            );
            self.audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::MigrationCompleted,
                        EventResult::Success,
                        "perform_secure_migration",
                    )
                    .system()
                    .metadata(EventMetadata {
                        migration_session: Some(session.id),
                        affected_keys: marker.keys,
                        removed_count: Some(purged.len() as u32),
                        ..Default::default()
                    }),
                )
                .await;
        }

        session.updated_at = self.clock.now();
        self.save_session(&session).await?;

        Ok(MigrationReport {
            session_id: session.id,
            dry_run: session.dry_run,
            records: session.records,
            skipped: session.skipped,
            purged_insecure_keys: purged,
            completed,
        })
    }

    /// Migrate one key; `None` when there is no legacy value
    async fn migrate_key(&self, key: &str, dry_run: bool) -> MigrationResult<Option<MigrationRecord>> {
        let Some(value) = self.legacy.retrieve_optional(key).await? else {
            debug!(key = key, "No legacy value, skipping");
            return Ok(None);
        };
        let value = Zeroizing::new(value);
        let original_checksum = checksum(&value);

        let dest = destination_key(key);
        let ciphertext = self.engine.encrypt_to_bytes(&value, Some(key.as_bytes())).await?;
        self.destination.store(&dest, &ciphertext).await?;

        let stored = self.destination.retrieve(&dest).await?;
        let migrated_checksum = match self.engine.decrypt(&stored, Some(key.as_bytes())).await {
            Ok(plaintext) => checksum(&Zeroizing::new(plaintext)),
            Err(e) => {
                warn!(key = key, error = %e, "Migrated value failed to decrypt");
                String::new()
            }
        };

        let record = MigrationRecord::new(key, original_checksum, migrated_checksum, self.clock.now());

        if !record.verified {
            warn!(key = key, "Checksum mismatch, rolling back destination value");
            self.destination.delete(&dest).await?;
            return Ok(Some(record));
        }

        if dry_run {
            self.destination.delete(&dest).await?;
        } else {
            self.legacy.delete(key).await?;
            debug!(key = key, "Legacy value migrated and removed");
        }
        Ok(Some(record))
    }

    /// Delete the known-insecure legacy keys and confirm they are gone
    async fn purge_insecure_keys(&self) -> MigrationResult<Vec<String>> {
        let mut purged = Vec::new();
        for key in &self.config.insecure_legacy_keys {
            if !self.legacy.exists(key).await? {
                continue;
            }
            if let Err(e) = self.legacy.delete(key).await {
                warn!(key = %key, error = %e, "Failed to delete insecure legacy key");
            }
            purged.push(key.clone());
        }

        let mut remaining = Vec::new();
        for key in &self.config.insecure_legacy_keys {
            if self.legacy.exists(key).await? {
                remaining.push(key.clone());
            }
        }
        if !remaining.is_empty() {
            return Err(MigrationError::InsecureKeyPurgeFailed(remaining));
        }

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged insecure legacy keys");
        }
        Ok(purged)
    }

    async fn audit_failure(&self, session: &MigrationSession, category: ErrorCategory, reason: &str) {
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::MigrationFailed,
                    EventResult::Failure,
                    "perform_secure_migration",
                )
                .system()
                .failure(category, reason)
                .metadata(EventMetadata {
                    migration_session: Some(session.id),
                    affected_keys: session.pending.clone(),
                    ..Default::default()
                }),
            )
            .await;
    }
}
