//! Composition root wiring every component of the security core
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


use crate::audit::{
    AlertSink, AuditConfig, AuditContext, AuditEventType, AuditLogger, DeviceInfo, EventResult,
    NewAuditEvent,
};
use crate::clock::{Clock, SystemClock};
use crate::credentials::{CredentialConfig, CredentialManager};
use crate::encryption::EncryptionEngine;
use crate::error::KeyResult;
use crate::key_rotation::{
    KeyRotationManager, KeyVersionRecord, RotationComplianceReport, RotationPolicy, REGISTRY_KEY,
};
use crate::migration::{MigrationConfig, MigrationService};
use crate::rate_limiter::RateLimiter;
use crate::store::{FileSecretStore, SecretStore, ValidatingStore};
use chrono::{DateTime, Utc};
use keyward_config::SecurityConfig;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DEVICE_ID_KEY: &str = "keyward.audit.device_id";

/// Builder for [`SecurityCore`]
pub struct SecurityCoreBuilder {
    store: Arc<dyn SecretStore>,
    legacy_store: Option<Arc<dyn SecretStore>>,
    clock: Arc<dyn Clock>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    config: SecurityConfig,
}

impl SecurityCoreBuilder {
    pub fn new(store: Arc<dyn SecretStore>, config: SecurityConfig) -> Self {
        Self {
            store,
            legacy_store: None,
            clock: Arc::new(SystemClock),
            alert_sink: None,
            config,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store holding pre-migration plaintext values (defaults to the main store)
    pub fn legacy_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.legacy_store = Some(store);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Wire every component; every store is wrapped in key validation
    pub async fn build(self) -> KeyResult<SecurityCore> {
        let store: Arc<dyn SecretStore> = Arc::new(ValidatingStore::new(self.store));
        let legacy_store: Arc<dyn SecretStore> = match self.legacy_store {
            Some(legacy) => Arc::new(ValidatingStore::new(legacy)),
            None => store.clone(),
        };
        let clock = self.clock;
        let config = self.config;

        let fresh_install = !store.exists(REGISTRY_KEY).await?;
        let keys = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            RotationPolicy::from(&config.rotation),
        ));
        let engine = Arc::new(EncryptionEngine::new(keys.clone()));
        let limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone()));

        let device_id = match &config.audit.device_id {
            Some(id) => id.clone(),
            None => device_id(store.as_ref()).await?,
        };
        let context = AuditContext::new(DeviceInfo {
            device_id,
            platform: config.audit.platform.clone(),
            app_version: config.audit.app_version.clone(),
        });
        let mut audit = AuditLogger::new(
            store.clone(),
            engine.clone(),
            clock.clone(),
            AuditConfig::from(&config.audit),
            context,
        );
        if let Some(sink) = self.alert_sink {
            audit = audit.with_alert_sink(sink);
        }
        let audit = Arc::new(audit);

        let credentials = Arc::new(CredentialManager::new(
            store.clone(),
            engine.clone(),
            limiter.clone(),
            audit.clone(),
            clock.clone(),
            CredentialConfig::from(&config.credentials),
        ));
        let migration = Arc::new(MigrationService::new(
            legacy_store,
            store.clone(),
            engine.clone(),
            audit.clone(),
            clock.clone(),
            MigrationConfig::from(&config.migration),
        ));

        let core = SecurityCore {
            store,
            clock,
            keys,
            engine,
            limiter,
            audit,
            credentials,
            migration,
        };

        if config.rotation.auto_rotate_when_overdue {
            core.enforce_compliance_rotation().await?;
        }

        let key_version = core.keys.current_version().await?;
        if fresh_install {
            core.audit
                .record(
                    NewAuditEvent::new(AuditEventType::KeyGenerated, EventResult::Success, "initial_key")
                        .system()
                        .key_version(key_version),
                )
                .await;
        }

        info!(key_version, "Security core initialized");
        Ok(core)
    }
}

/// Stable per-installation device id, generated on first use
async fn device_id(store: &dyn SecretStore) -> KeyResult<String> {
    if let Some(bytes) = store.retrieve_optional(DEVICE_ID_KEY).await? {
        if let Ok(id) = String::from_utf8(bytes) {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4().to_string();
    store.store(DEVICE_ID_KEY, id.as_bytes()).await?;
    Ok(id)
}

/// Owns every component of the credential security core
pub struct SecurityCore {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    keys: Arc<KeyRotationManager>,
    engine: Arc<EncryptionEngine>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    credentials: Arc<CredentialManager>,
    migration: Arc<MigrationService>,
}

impl SecurityCore {
    pub fn builder(store: Arc<dyn SecretStore>, config: SecurityConfig) -> SecurityCoreBuilder {
        SecurityCoreBuilder::new(store, config)
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn keys(&self) -> &Arc<KeyRotationManager> {
        &self.keys
    }

    pub fn engine(&self) -> &Arc<EncryptionEngine> {
        &self.engine
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn migration(&self) -> &Arc<MigrationService> {
        &self.migration
    }

    /// Rotate to a new key version on explicit request
    pub async fn rotate_keys(&self, reason: &str) -> KeyResult<KeyVersionRecord> {
        match self.keys.rotate_key(reason).await {
            Ok(record) => {
                self.audit
                    .record(
                        NewAuditEvent::new(AuditEventType::KeyRotated, EventResult::Success, "rotate_keys")
                            .key_version(record.version)
                            .resource(reason),
                    )
                    .await;
                Ok(record)
            }
            Err(e) => {
                self.audit
                    .record(
                        NewAuditEvent::new(AuditEventType::KeyRotated, EventResult::Failure, "rotate_keys")
                            .failure(e.category(), e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Rotate when the current key is overdue, logged as a system action
    pub async fn enforce_compliance_rotation(&self) -> KeyResult<Option<KeyVersionRecord>> {
        let rotated = self.keys.enforce_compliance_rotation().await?;
        if let Some(record) = &rotated {
            warn!(key_version = record.version, "Compliance rotation performed");
            self.audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::KeyRotated,
                        EventResult::Success,
                        "enforce_compliance_rotation",
                    )
                    .system()
                    .key_version(record.version)
                    .resource(record.rotation_reason.clone()),
                )
                .await;
        }
        Ok(rotated)
    }

    /// Accept the risk of continuing with an overdue key
    pub async fn acknowledge_overdue_risk(&self, reason: &str) -> KeyResult<u32> {
        let version = self.keys.acknowledge_overdue_risk(reason).await?;
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::OverdueRiskAccepted,
                    EventResult::Success,
                    "acknowledge_overdue_risk",
                )
                .key_version(version)
                .resource(reason),
            )
            .await;
        Ok(version)
    }

    /// Destroy the key material of a non-current version
    ///
    /// Data sealed under that version becomes permanently unreadable.
    pub async fn retire_version(&self, version: u32) -> KeyResult<()> {
        let result = self.keys.retire_version(version).await;
        let event = match &result {
            Ok(()) => NewAuditEvent::new(AuditEventType::KeyDeleted, EventResult::Success, "retire_version"),
            Err(e) => NewAuditEvent::new(AuditEventType::KeyDeleted, EventResult::Failure, "retire_version")
                .failure(e.category(), e.to_string()),
        };
        self.audit.record(event.key_version(version)).await;
        result
    }

    pub async fn rotation_compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> KeyResult<RotationComplianceReport> {
        let report = self.keys.compliance_report(from, to).await?;
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::ComplianceExport,
                    EventResult::Success,
                    "rotation_compliance_report",
                )
                .system()
                .key_version(report.current_version),
            )
            .await;
        Ok(report)
    }
}

/// Build a security core over the file-backed store configured in `config`
pub async fn init_security_core(config: &SecurityConfig) -> KeyResult<SecurityCore> {
    info!(path = %config.storage.path, "Initializing security core");
    let store = FileSecretStore::new(&config.storage.path, None).await?;
    SecurityCore::builder(Arc::new(store), config.clone()).build().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemorySecretStore;
    use chrono::Duration;

    async fn core(clock: Arc<ManualClock>, store: Arc<MemorySecretStore>) -> SecurityCore {
        SecurityCore::builder(store, SecurityConfig::default())
            .clock(clock)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_rotation_is_audited() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let core = core(clock.clone(), Arc::new(MemorySecretStore::new())).await;

        let record = core.rotate_keys("scheduled").await.unwrap();
        assert_eq!(record.version, 2);

        let now = clock.now();
        let events = core
            .audit()
            .retrieve_events(now - Duration::hours(1), now, Some(&[AuditEventType::KeyRotated]), None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.key_version, Some(2));
    }

    #[tokio::test]
    async fn test_overdue_key_rotated_on_startup() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemorySecretStore::new());
        let first = core(clock.clone(), store.clone()).await;
        assert_eq!(first.keys().current_version().await.unwrap(), 1);
        drop(first);

        clock.advance(Duration::days(121));
        let restarted = core(clock.clone(), store).await;
        assert_eq!(restarted.keys().current_version().await.unwrap(), 2);

        let history = restarted.keys().rotation_history().await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledged_overdue_key_can_encrypt() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut config = SecurityConfig::default();
        config.rotation.auto_rotate_when_overdue = false;
        let core = SecurityCore::builder(Arc::new(MemorySecretStore::new()), config)
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        clock.advance(Duration::days(200));
        assert!(core.engine().encrypt(b"x", None).await.is_err());

        assert_eq!(core.acknowledge_overdue_risk("release freeze").await.unwrap(), 1);
        assert!(core.engine().encrypt(b"x", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected_through_core_store() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let core = core(clock, Arc::new(MemorySecretStore::new())).await;
        assert!(core.store().store("bad key/../x", b"v").await.is_err());
    }

    #[tokio::test]
    async fn test_key_lifecycle_events() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemorySecretStore::new());
        let start = clock.now() - Duration::hours(1);

        let first = core(clock.clone(), store.clone()).await;
        drop(first);
        // Reopening an existing installation generates nothing new
        let core = core(clock.clone(), store).await;

        let generated = core
            .audit()
            .retrieve_events(start, clock.now(), Some(&[AuditEventType::KeyGenerated]), None)
            .await
            .unwrap();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].metadata.key_version, Some(1));

        core.rotate_keys("scheduled").await.unwrap();
        core.retire_version(1).await.unwrap();
        assert!(core.retire_version(2).await.is_err());

        let deleted = core
            .audit()
            .retrieve_events(start, clock.now(), Some(&[AuditEventType::KeyDeleted]), None)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].result, EventResult::Success);
        assert_eq!(deleted[0].metadata.key_version, Some(1));
        assert_eq!(deleted[1].result, EventResult::Failure);
    }
}
