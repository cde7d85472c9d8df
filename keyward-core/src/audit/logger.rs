//! Append-only encrypted audit log
//!
//! Every event carries an HMAC-SHA256 integrity tag over its canonical JSON
//! serialization and is sealed with the encryption engine before being
//! appended to a single newline-delimited blob in the secret store. Each
//! line has the form `{event id} {base64(versioned ciphertext)}` and the
//! event id is bound as associated data.
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


use super::event::{
    AuditContext, AuditEvent, AuditEventType, AuditIndexEntry, EventMetadata, EventResult,
    NewAuditEvent, RiskLevel,
};
use super::report::{
    ComplianceExport, ComplianceReport, ReportMetadata, ReportPeriod, ReportSummary, EXPORT_AAD,
};
use crate::clock::Clock;
use crate::encryption::{EncryptionEngine, SymmetricKey};
use crate::error::{AuditError, AuditResult, ErrorCategory};
use crate::store::SecretStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use keyward_config::AuditSettings;
use sha2::Sha256;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const LOG_KEY: &str = "keyward.audit.log";
pub const INDEX_KEY: &str = "keyward.audit.index";
pub const INTEGRITY_KEY: &str = "keyward.audit.integrity_key";
pub const ARCHIVES_KEY: &str = "keyward.audit.archives";
pub const LAST_RETENTION_KEY: &str = "keyward.audit.last_retention";
pub const ARCHIVE_PREFIX: &str = "keyward.audit.archive.";

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Audit logger tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Log blob size (bytes) that triggers rotation into an archive
    pub max_log_size: u64,
    pub retention_days: u32,
    pub enable_realtime_alerts: bool,
    pub export_encryption: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_log_size: 100 * 1024 * 1024,
            retention_days: 90,
            enable_realtime_alerts: true,
            export_encryption: false,
        }
    }
}

impl From<&AuditSettings> for AuditConfig {
    fn from(settings: &AuditSettings) -> Self {
        Self {
            max_log_size: settings.max_log_size,
            retention_days: settings.retention_days,
            enable_realtime_alerts: settings.enable_realtime_alerts,
            export_encryption: settings.export_encryption,
        }
    }
}

/// Receiver of realtime alerts for high and critical events
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Default sink: one `warn!` record per alert
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        warn!(
            event_id = %event.id,
            event_type = ?event.event_type,
            risk_level = ?event.risk_level,
            user_id = event.user_id.as_deref().unwrap_or("-"),
            operation = %event.operation_details.operation,
            "Security alert"
        );
        Ok(())
    }
}

/// An audit write that could not be persisted
#[derive(Debug, Clone)]
pub struct AuditFailure {
    pub event_type: AuditEventType,
    pub occurred_at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
}

/// Append-only, integrity-protected, encrypted event log
pub struct AuditLogger {
    store: Arc<dyn SecretStore>,
    engine: Arc<EncryptionEngine>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
    context: AuditContext,
    alert_sink: Arc<dyn AlertSink>,
    integrity_key: OnceCell<SymmetricKey>,
    /// Serializes every mutation of the log, index and archive list
    write_lock: Mutex<()>,
    failures: broadcast::Sender<AuditFailure>,
}

impl AuditLogger {
    pub fn new(
        store: Arc<dyn SecretStore>,
        engine: Arc<EncryptionEngine>,
        clock: Arc<dyn Clock>,
        config: AuditConfig,
        context: AuditContext,
    ) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            store,
            engine,
            clock,
            config,
            context,
            alert_sink: Arc::new(TracingAlertSink),
            integrity_key: OnceCell::new(),
            write_lock: Mutex::new(()),
            failures,
        }
    }

    /// Replace the realtime alert sink
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn context(&self) -> &AuditContext {
        &self.context
    }

    /// Subscribe to audit write failures
    pub fn subscribe_failures(&self) -> broadcast::Receiver<AuditFailure> {
        self.failures.subscribe()
    }

    /// Append an event to the log
    pub async fn log_event(&self, new: NewAuditEvent) -> AuditResult<AuditEvent> {
        let _guard = self.write_lock.lock().await;

        let event = self.append_locked(new).await?;

        if let Err(e) = self.maybe_apply_retention_locked().await {
            warn!(error = %e, "Audit retention pass failed");
        }

        self.raise_alert(&event);
        Ok(event)
    }

    /// Best-effort variant of [`log_event`](Self::log_event)
    ///
    /// Failures are logged and published on the failure channel, never
    /// returned to the caller.
    pub async fn record(&self, new: NewAuditEvent) -> Option<AuditEvent> {
        let event_type = new.event_type;
        match self.log_event(new).await {
            Ok(event) => Some(event),
            Err(e) => {
                error!(
                    event_type = ?event_type,
                    category = e.category().as_str(),
                    error = %e,
                    "Failed to write audit event"
                );
                // No subscribers is fine
                let _ = self.failures.send(AuditFailure {
                    event_type,
                    occurred_at: self.clock.now(),
                    category: e.category(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Decrypt and verify every event in the log, returning those matching
    /// the filters in ascending timestamp order
    ///
    /// Lines that fail to decrypt or verify are skipped and reported as an
    /// `IntegrityViolation` event.
    pub async fn retrieve_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        event_types: Option<&[AuditEventType]>,
        risk_levels: Option<&[RiskLevel]>,
    ) -> AuditResult<Vec<AuditEvent>> {
        let log = self.store.retrieve_optional(LOG_KEY).await?.unwrap_or_default();
        let (verified, rejected) = self.verified_events(&log).await;
        if !rejected.is_empty() {
            self.record(integrity_violation("retrieve_events", &rejected)).await;
        }

        let mut events: Vec<AuditEvent> = verified
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .filter(|e| event_types.map_or(true, |types| types.contains(&e.event_type)))
            .filter(|e| risk_levels.map_or(true, |risks| risks.contains(&e.risk_level)))
            .collect();

        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// Filter the unencrypted index without decrypting the log
    pub async fn indexed_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        event_types: Option<&[AuditEventType]>,
        risk_levels: Option<&[RiskLevel]>,
    ) -> AuditResult<Vec<AuditIndexEntry>> {
        let mut entries: Vec<AuditIndexEntry> = self
            .load_index()
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .filter(|e| event_types.map_or(true, |types| types.contains(&e.event_type)))
            .filter(|e| risk_levels.map_or(true, |risks| risks.contains(&e.risk_level)))
            .collect();

        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// Drop verified events older than the retention window and rewrite the log
    ///
    /// Lines that cannot be decrypted or verified are never dropped; they are
    /// kept byte for byte and reported as an `IntegrityViolation` event.
    /// Returns the number of removed entries.
    pub async fn apply_retention_policy(&self) -> AuditResult<usize> {
        let _guard = self.write_lock.lock().await;
        self.apply_retention_locked().await
    }

    /// Compress the current log into an archive and start a fresh one
    ///
    /// Returns the archive name, or `None` when the log was empty.
    pub async fn rotate_log(&self) -> AuditResult<Option<String>> {
        let _guard = self.write_lock.lock().await;
        self.rotate_locked().await
    }

    /// Names of all archives, oldest first
    pub async fn archives(&self) -> AuditResult<Vec<String>> {
        match self.store.retrieve_optional(ARCHIVES_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Decompress an archive and return its verified events
    pub async fn read_archive(&self, name: &str) -> AuditResult<Vec<AuditEvent>> {
        if !self.archives().await?.iter().any(|a| a == name) {
            return Err(AuditError::Archive(format!("unknown archive {}", name)));
        }

        let compressed = self.store.retrieve(name).await?;
        let mut log = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut log)
            .map_err(|e| AuditError::Archive(e.to_string()))?;

        let (mut events, rejected) = self.verified_events(&log).await;
        if !rejected.is_empty() {
            self.record(integrity_violation("read_archive", &rejected)).await;
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// Build a compliance report over the given period
    ///
    /// The export itself is logged as a system event before the events are
    /// collected.
    pub async fn generate_compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        event_types: Option<&[AuditEventType]>,
        risk_levels: Option<&[RiskLevel]>,
    ) -> AuditResult<ComplianceExport> {
        self.record(
            NewAuditEvent::new(
                AuditEventType::ComplianceExport,
                EventResult::Success,
                "generate_compliance_report",
            )
            .system(),
        )
        .await;

        let events = self.retrieve_events(from, to, event_types, risk_levels).await?;
        let summary = ReportSummary::from_events(&events);

        let report = ComplianceReport {
            generated_at: self.clock.now(),
            report_period: ReportPeriod { from, to },
            events,
            summary,
            metadata: ReportMetadata {
                generator: "keyward-core".to_string(),
                generator_version: env!("CARGO_PKG_VERSION").to_string(),
                device_id: self.context.device_info.device_id.clone(),
                retention_days: self.config.retention_days,
                integrity_algorithm: "HMAC-SHA256".to_string(),
                encryption_algorithm: "AES-256-GCM".to_string(),
                export_encrypted: self.config.export_encryption,
                standards: vec!["SOC2".to_string(), "HIPAA".to_string(), "PCI-DSS".to_string()],
            },
        };

        let json = report.to_sorted_json()?;
        let (payload, encrypted) = if self.config.export_encryption {
            (self.engine.encrypt_to_bytes(json.as_bytes(), Some(EXPORT_AAD)).await?, true)
        } else {
            (json.into_bytes(), false)
        };

        info!(
            events = report.summary.total_events,
            encrypted, "Generated compliance report"
        );

        Ok(ComplianceExport {
            report,
            payload,
            encrypted,
        })
    }

    /// Decrypt an encrypted export payload back to its JSON text
    pub async fn decrypt_export(&self, payload: &[u8]) -> AuditResult<String> {
        let plaintext = self.engine.decrypt(payload, Some(EXPORT_AAD)).await?;
        String::from_utf8(plaintext)
            .map_err(|_| AuditError::IntegrityViolation("export is not valid UTF-8".to_string()))
    }

    async fn append_locked(&self, new: NewAuditEvent) -> AuditResult<AuditEvent> {
        let (event, line) = self.seal_event(new).await?;

        let current_size = self
            .store
            .retrieve_optional(LOG_KEY)
            .await?
            .map_or(0, |log| log.len());
        if current_size > 0 && (current_size + line.len()) as u64 > self.config.max_log_size {
            info!(current_size, "Audit log size limit reached, rotating");
            self.rotate_locked().await?;
        }

        self.append_line(&event, &line).await?;
        debug!(event_id = %event.id, event_type = ?event.event_type, "Audit event appended");
        Ok(event)
    }

    async fn seal_event(&self, new: NewAuditEvent) -> AuditResult<(AuditEvent, String)> {
        let mut event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            event_type: new.event_type,
            result: new.result,
            risk_level: new.event_type.risk_level(),
            user_id: new.user_id,
            session_id: self.context.session_id.clone(),
            device_info: self.context.device_info.clone(),
            network_info: self.context.network_info.clone(),
            operation_details: new.operation_details,
            metadata: new.metadata,
            integrity: String::new(),
        };
        event.integrity = hex::encode(self.integrity_tag(&event).await?);

        let id = event.id.to_string();
        let json = serde_json::to_vec(&event)?;
        let ciphertext = self.engine.encrypt_to_bytes(&json, Some(id.as_bytes())).await?;
        let line = format!("{} {}\n", id, BASE64.encode(ciphertext));

        Ok((event, line))
    }

    async fn append_line(&self, event: &AuditEvent, line: &str) -> AuditResult<()> {
        let mut log = self.store.retrieve_optional(LOG_KEY).await?.unwrap_or_default();
        log.extend_from_slice(line.as_bytes());
        self.store.store(LOG_KEY, &log).await?;

        let mut index = self.load_index().await?;
        index.push(AuditIndexEntry::from(event));
        self.store.store(INDEX_KEY, &serde_json::to_vec(&index)?).await?;
        Ok(())
    }

    async fn load_index(&self) -> AuditResult<Vec<AuditIndexEntry>> {
        match self.store.retrieve_optional(INDEX_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn rotate_locked(&self) -> AuditResult<Option<String>> {
        let log = match self.store.retrieve_optional(LOG_KEY).await? {
            Some(log) if !log.is_empty() => log,
            _ => return Ok(None),
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&log)
            .map_err(|e| AuditError::Archive(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| AuditError::Archive(e.to_string()))?;

        let mut archives = self.archives().await?;
        let base = format!("{}{}", ARCHIVE_PREFIX, self.clock.now().format("%Y%m%dT%H%M%SZ"));
        let mut name = base.clone();
        let mut suffix = 1;
        while archives.contains(&name) {
            name = format!("{}.{}", base, suffix);
            suffix += 1;
        }

        self.store.store(&name, &compressed).await?;
        archives.push(name.clone());
        self.store.store(ARCHIVES_KEY, &serde_json::to_vec(&archives)?).await?;
        self.store.delete(LOG_KEY).await?;
        self.store.delete(INDEX_KEY).await?;

        info!(
            archive = %name,
            original_bytes = log.len(),
            compressed_bytes = compressed.len(),
            "Audit log rotated"
        );

        let (event, line) = self
            .seal_event(
                NewAuditEvent::new(AuditEventType::LogRotated, EventResult::Success, "rotate_log")
                    .system()
                    .resource(name.clone()),
            )
            .await?;
        self.append_line(&event, &line).await?;

        Ok(Some(name))
    }

    async fn maybe_apply_retention_locked(&self) -> AuditResult<()> {
        let now = self.clock.now();
        let last_run = self
            .store
            .retrieve_optional(LAST_RETENTION_KEY)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        let due = last_run.map_or(true, |t| now - t >= Duration::days(1));
        let oversized = self
            .store
            .retrieve_optional(LOG_KEY)
            .await?
            .map_or(false, |log| log.len() as u64 > self.config.max_log_size);

        if due || oversized {
            self.apply_retention_locked().await?;
        }
        Ok(())
    }

    async fn apply_retention_locked(&self) -> AuditResult<usize> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(i64::from(self.config.retention_days));

        let log = self.store.retrieve_optional(LOG_KEY).await?.unwrap_or_default();
        let index = self.load_index().await?;

        // Original lines are kept byte for byte so retained events are unchanged
        let mut kept_log = Vec::with_capacity(log.len());
        let mut kept_index = Vec::new();
        let mut rejected = Vec::new();
        let mut removed = 0usize;
        for line in log_lines(&log) {
            match self.open_line(line).await {
                Some(event) if event.timestamp < cutoff => {
                    removed += 1;
                    continue;
                }
                Some(event) => kept_index.push(AuditIndexEntry::from(&event)),
                None => {
                    let id = line_id(line);
                    if let Some(entry) = id.and_then(|id| index.iter().find(|e| e.id == id)) {
                        kept_index.push(entry.clone());
                    }
                    rejected.push(id.map_or_else(|| "unparseable".to_string(), |id| id.to_string()));
                }
            }
            kept_log.extend_from_slice(line);
            kept_log.push(b'\n');
        }

        if removed > 0 {
            self.store.store(LOG_KEY, &kept_log).await?;
            self.store
                .store(INDEX_KEY, &serde_json::to_vec(&kept_index)?)
                .await?;
        }
        self.store
            .store(LAST_RETENTION_KEY, now.to_rfc3339().as_bytes())
            .await?;

        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "Retention kept audit entries failing verification");
            self.append_and_alert_locked(integrity_violation("apply_retention_policy", &rejected))
                .await?;
        }

        if removed > 0 {
            info!(removed, retained = kept_index.len(), "Applied audit retention policy");
            self.append_and_alert_locked(
                NewAuditEvent::new(
                    AuditEventType::RetentionApplied,
                    EventResult::Success,
                    "apply_retention_policy",
                )
                .system()
                .metadata(EventMetadata {
                    removed_count: Some(removed as u32),
                    ..Default::default()
                }),
            )
            .await?;
        }

        if kept_log.len() as u64 > self.config.max_log_size {
            self.rotate_locked().await?;
        }

        Ok(removed)
    }

    /// Append a maintenance event while already holding the write lock
    async fn append_and_alert_locked(&self, new: NewAuditEvent) -> AuditResult<()> {
        let (event, line) = self.seal_event(new).await?;
        self.append_line(&event, &line).await?;
        self.raise_alert(&event);
        Ok(())
    }

    /// Decrypt and verify each line, returning verified events and the ids
    /// of rejected lines
    async fn verified_events(&self, log: &[u8]) -> (Vec<AuditEvent>, Vec<String>) {
        let mut verified = Vec::new();
        let mut rejected = Vec::new();

        for line in log_lines(log) {
            match self.open_line(line).await {
                Some(event) => verified.push(event),
                None => rejected.push(
                    line_id(line).map_or_else(|| "unparseable".to_string(), |id| id.to_string()),
                ),
            }
        }

        if !rejected.is_empty() {
            warn!(
                rejected = rejected.len(),
                "Skipped audit entries failing decryption or integrity checks"
            );
        }
        (verified, rejected)
    }

    async fn open_line(&self, line: &[u8]) -> Option<AuditEvent> {
        let line = std::str::from_utf8(line).ok()?;
        let (id, encoded) = line.split_once(' ')?;
        let id_uuid = Uuid::parse_str(id).ok()?;
        let ciphertext = BASE64.decode(encoded.trim_end()).ok()?;
        let plaintext = self.engine.decrypt(&ciphertext, Some(id.as_bytes())).await.ok()?;
        let event: AuditEvent = serde_json::from_slice(&plaintext).ok()?;

        if event.id != id_uuid {
            return None;
        }
        match self.verify_integrity(&event).await {
            Ok(true) => Some(event),
            Ok(false) => {
                warn!(event_id = %event.id, "Audit event failed integrity verification");
                None
            }
            Err(e) => {
                warn!(error = %e, "Integrity key unavailable");
                None
            }
        }
    }

    async fn integrity_key(&self) -> AuditResult<&SymmetricKey> {
        self.integrity_key
            .get_or_try_init(|| async {
                if let Some(bytes) = self.store.retrieve_optional(INTEGRITY_KEY).await? {
                    return SymmetricKey::from_slice(&bytes).map_err(|_| {
                        AuditError::IntegrityViolation("stored integrity key is malformed".to_string())
                    });
                }
                let key = SymmetricKey::generate();
                self.store.store(INTEGRITY_KEY, key.as_bytes()).await?;
                info!("Generated audit integrity key");
                Ok::<_, AuditError>(key)
            })
            .await
    }

    async fn integrity_tag(&self, event: &AuditEvent) -> AuditResult<Vec<u8>> {
        let key = self.integrity_key().await?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| AuditError::IntegrityViolation(e.to_string()))?;
        mac.update(&canonical_bytes(event)?);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify_integrity(&self, event: &AuditEvent) -> AuditResult<bool> {
        let Ok(expected) = hex::decode(&event.integrity) else {
            return Ok(false);
        };
        let key = self.integrity_key().await?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| AuditError::IntegrityViolation(e.to_string()))?;
        mac.update(&canonical_bytes(event)?);
        Ok(mac.verify_slice(&expected).is_ok())
    }

    fn raise_alert(&self, event: &AuditEvent) {
        if !self.config.enable_realtime_alerts || !event.risk_level.is_high() {
            return;
        }
        if let Err(e) = self.alert_sink.alert(event) {
            warn!(event_id = %event.id, error = %e, "Realtime alert delivery failed");
        }
    }
}

fn log_lines(log: &[u8]) -> impl Iterator<Item = &[u8]> {
    log.split(|b| *b == b'\n').filter(|line| !line.is_empty())
}

/// Event id prefix of a raw log line, readable without any key
fn line_id(line: &[u8]) -> Option<Uuid> {
    let line = std::str::from_utf8(line).ok()?;
    let (id, _) = line.split_once(' ')?;
    Uuid::parse_str(id).ok()
}

fn integrity_violation(operation: &str, rejected: &[String]) -> NewAuditEvent {
    NewAuditEvent::new(AuditEventType::IntegrityViolation, EventResult::Failure, operation)
        .system()
        .failure(
            ErrorCategory::Cryptographic,
            format!("{} audit entries failed decryption or integrity verification", rejected.len()),
        )
        .metadata(EventMetadata {
            affected_keys: rejected.to_vec(),
            ..Default::default()
        })
}

/// Canonical serialization: every field except `integrity`, keys sorted
fn canonical_bytes(event: &AuditEvent) -> AuditResult<Vec<u8>> {
    let mut value = serde_json::to_value(event)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("integrity");
    }
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::DeviceInfo;
    use crate::clock::ManualClock;
    use crate::key_rotation::{KeyRotationManager, RotationPolicy};
    use crate::store::MemorySecretStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        logger: AuditLogger,
        store: Arc<MemorySecretStore>,
        clock: Arc<ManualClock>,
        engine: Arc<EncryptionEngine>,
    }

    fn harness(config: AuditConfig) -> Harness {
        let store = Arc::new(MemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            RotationPolicy::default(),
        ));
        let engine = Arc::new(EncryptionEngine::new(keys));
        let context = AuditContext::new(DeviceInfo {
            device_id: "device-1".into(),
            platform: "test".into(),
            app_version: "1.0.0".into(),
        });
        let logger = AuditLogger::new(store.clone(), engine.clone(), clock.clone(), config, context);
        Harness {
            logger,
            store,
            clock,
            engine,
        }
    }

    fn login_failure(user: &str) -> NewAuditEvent {
        NewAuditEvent::new(
            AuditEventType::AuthenticationFailure,
            EventResult::Failure,
            "authenticate",
        )
        .user(Some(user))
    }

    fn wide_range() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - Duration::days(3650), now + Duration::days(3650))
    }

    #[tokio::test]
    async fn test_log_and_retrieve() {
        let h = harness(AuditConfig::default());
        let logged = h.logger.log_event(login_failure("alice")).await.unwrap();
        assert_eq!(logged.risk_level, RiskLevel::High);
        assert!(!logged.integrity.is_empty());

        let (from, to) = wide_range();
        let events = h.logger.retrieve_events(from, to, None, None).await.unwrap();
        assert_eq!(events, vec![logged]);
    }

    #[tokio::test]
    async fn test_log_is_encrypted_at_rest() {
        let h = harness(AuditConfig::default());
        h.logger.log_event(login_failure("alice@example.com")).await.unwrap();

        let raw = h.store.retrieve(LOG_KEY).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains("alice@example.com"));
        assert!(!text.contains("authentication_failure"));
    }

    #[tokio::test]
    async fn test_flipped_byte_excludes_only_that_entry() {
        let h = harness(AuditConfig::default());
        let first = h.logger.log_event(login_failure("a")).await.unwrap();
        let second = h.logger.log_event(login_failure("b")).await.unwrap();
        let third = h.logger.log_event(login_failure("c")).await.unwrap();

        let raw = h.store.retrieve(LOG_KEY).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 3);

        // Flip a byte inside the ciphertext of the second entry
        let (id, encoded) = lines[1].split_once(' ').unwrap();
        let mut ciphertext = BASE64.decode(encoded).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        lines[1] = format!("{} {}", id, BASE64.encode(ciphertext));
        h.store
            .store(LOG_KEY, format!("{}\n", lines.join("\n")).as_bytes())
            .await
            .unwrap();

        let (from, to) = wide_range();
        let events = h.logger.retrieve_events(from, to, None, None).await.unwrap();
        assert_eq!(events, vec![first, third]);
        assert!(!events.iter().any(|e| e.id == second.id));
    }

    #[tokio::test]
    async fn test_forged_integrity_tag_is_rejected() {
        let h = harness(AuditConfig::default());
        let original = h.logger.log_event(login_failure("mallory")).await.unwrap();

        // Re-encrypt a modified event with valid AEAD but a stale HMAC
        let mut forged = original.clone();
        forged.result = EventResult::Success;
        let id = forged.id.to_string();
        let ciphertext = h
            .engine
            .encrypt_to_bytes(&serde_json::to_vec(&forged).unwrap(), Some(id.as_bytes()))
            .await
            .unwrap();
        let line = format!("{} {}\n", id, BASE64.encode(ciphertext));
        h.store.store(LOG_KEY, line.as_bytes()).await.unwrap();

        let (from, to) = wide_range();
        let events = h.logger.retrieve_events(from, to, None, None).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_filters_and_ordering() {
        let h = harness(AuditConfig::default());
        h.logger.log_event(login_failure("a")).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        h.logger
            .log_event(NewAuditEvent::new(
                AuditEventType::CredentialStored,
                EventResult::Success,
                "store",
            ))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(1));
        h.logger.log_event(login_failure("b")).await.unwrap();

        let (from, to) = wide_range();
        let failures = h
            .logger
            .retrieve_events(from, to, Some(&[AuditEventType::AuthenticationFailure]), None)
            .await
            .unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].timestamp < failures[1].timestamp);

        let low = h
            .logger
            .retrieve_events(from, to, None, Some(&[RiskLevel::Low]))
            .await
            .unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].event_type, AuditEventType::CredentialStored);

        let indexed = h
            .logger
            .indexed_events(from, to, Some(&[AuditEventType::AuthenticationFailure]), None)
            .await
            .unwrap();
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed[0].user_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_retention_removes_old_events_and_keeps_recent() {
        let h = harness(AuditConfig {
            retention_days: 30,
            ..Default::default()
        });
        h.logger.log_event(login_failure("old")).await.unwrap();
        h.clock.advance(Duration::days(40));
        let recent = h.logger.log_event(login_failure("recent")).await.unwrap();

        h.logger.apply_retention_policy().await.unwrap();

        let (from, to) = (h.clock.now() - Duration::days(3650), h.clock.now());
        let events = h
            .logger
            .retrieve_events(from, to, Some(&[AuditEventType::AuthenticationFailure]), None)
            .await
            .unwrap();
        assert_eq!(events, vec![recent]);

        let retention_events = h
            .logger
            .retrieve_events(from, to, Some(&[AuditEventType::RetentionApplied]), None)
            .await
            .unwrap();
        assert_eq!(retention_events.len(), 1);
        assert_eq!(retention_events[0].metadata.removed_count, Some(1));
    }

    #[tokio::test]
    async fn test_retention_never_drops_unverifiable_lines() {
        let h = harness(AuditConfig {
            retention_days: 30,
            ..Default::default()
        });
        let old = h.logger.log_event(login_failure("old")).await.unwrap();
        let tampered = h.logger.log_event(login_failure("tampered")).await.unwrap();

        let raw = String::from_utf8(h.store.retrieve(LOG_KEY).await.unwrap()).unwrap();
        let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
        let (id, encoded) = lines[1].split_once(' ').unwrap();
        let mut ciphertext = BASE64.decode(encoded).unwrap();
        ciphertext[20] ^= 0x01;
        lines[1] = format!("{} {}", id, BASE64.encode(ciphertext));
        let tampered_line = lines[1].clone();
        h.store
            .store(LOG_KEY, format!("{}\n", lines.join("\n")).as_bytes())
            .await
            .unwrap();

        h.clock.advance(Duration::days(40));
        assert_eq!(h.logger.apply_retention_policy().await.unwrap(), 1);

        let raw = String::from_utf8(h.store.retrieve(LOG_KEY).await.unwrap()).unwrap();
        assert_eq!(raw.lines().next(), Some(tampered_line.as_str()));

        let (from, to) = (h.clock.now() - Duration::days(3650), h.clock.now());
        let indexed = h.logger.indexed_events(from, to, None, None).await.unwrap();
        assert!(indexed.iter().any(|e| e.id == tampered.id));
        assert!(!indexed.iter().any(|e| e.id == old.id));

        let violations = h
            .logger
            .retrieve_events(from, to, Some(&[AuditEventType::IntegrityViolation]), None)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].metadata.affected_keys, vec![tampered.id.to_string()]);
        assert_eq!(violations[0].risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_size_limit_rotates_into_readable_archive() {
        let h = harness(AuditConfig {
            max_log_size: 2048,
            ..Default::default()
        });
        let first = h.logger.log_event(login_failure("a")).await.unwrap();

        let mut logged = 1;
        while h.logger.archives().await.unwrap().is_empty() {
            h.logger.log_event(login_failure("a")).await.unwrap();
            logged += 1;
            assert!(logged < 100, "log never rotated");
        }

        let archives = h.logger.archives().await.unwrap();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].starts_with(ARCHIVE_PREFIX));

        let archived = h.logger.read_archive(&archives[0]).await.unwrap();
        assert!(archived.iter().any(|e| e.id == first.id));

        let (from, to) = wide_range();
        let live = h.logger.retrieve_events(from, to, None, None).await.unwrap();
        assert!(live.iter().any(|e| e.event_type == AuditEventType::LogRotated));
        assert!(!live.iter().any(|e| e.id == first.id));
    }

    #[tokio::test]
    async fn test_manual_rotation_and_unknown_archive() {
        let h = harness(AuditConfig::default());
        assert!(h.logger.rotate_log().await.unwrap().is_none());

        h.logger.log_event(login_failure("a")).await.unwrap();
        let name = h.logger.rotate_log().await.unwrap().unwrap();
        assert_eq!(h.logger.read_archive(&name).await.unwrap().len(), 1);

        let err = h.logger.read_archive("keyward.audit.archive.nope").await.unwrap_err();
        assert!(matches!(err, AuditError::Archive(_)));
    }

    #[tokio::test]
    async fn test_compliance_report_structure() {
        let h = harness(AuditConfig::default());
        h.logger.log_event(login_failure("a")).await.unwrap();
        h.logger.log_event(login_failure("b")).await.unwrap();

        let (from, to) = wide_range();
        let export = h
            .logger
            .generate_compliance_report(from, to, None, None)
            .await
            .unwrap();
        assert!(!export.encrypted);

        let json: serde_json::Value = serde_json::from_slice(&export.payload).unwrap();
        for field in ["generatedAt", "reportPeriod", "events", "summary", "metadata"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["summary"]["uniqueUsers"], 2);
        assert_eq!(
            export.report.summary.events_by_type[&AuditEventType::ComplianceExport],
            1
        );
        assert_eq!(export.report.summary.high_risk_events, 2);
    }

    #[tokio::test]
    async fn test_encrypted_export() {
        let h = harness(AuditConfig {
            export_encryption: true,
            ..Default::default()
        });
        h.logger.log_event(login_failure("a")).await.unwrap();

        let (from, to) = wide_range();
        let export = h
            .logger
            .generate_compliance_report(from, to, None, None)
            .await
            .unwrap();
        assert!(export.encrypted);
        assert!(serde_json::from_slice::<serde_json::Value>(&export.payload).is_err());

        let json = h.logger.decrypt_export(&export.payload).await.unwrap();
        assert!(json.contains("\"reportPeriod\""));
    }

    struct CountingSink(AtomicUsize);

    impl AlertSink for CountingSink {
        fn alert(&self, _event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("pager offline".into())
        }
    }

    #[tokio::test]
    async fn test_alerts_only_for_high_risk_and_never_fail_the_write() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let h = harness(AuditConfig::default());
        let logger = h.logger.with_alert_sink(sink.clone());

        logger.log_event(login_failure("a")).await.unwrap();
        logger
            .log_event(NewAuditEvent::new(
                AuditEventType::CredentialStored,
                EventResult::Success,
                "store",
            ))
            .await
            .unwrap();

        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_writes_reach_failure_channel() {
        let store = Arc::new(MemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            RotationPolicy::default(),
        ));
        keys.rotate_key("initial").await.unwrap();
        let engine = Arc::new(EncryptionEngine::new(keys));
        let context = AuditContext::new(DeviceInfo {
            device_id: "device-1".into(),
            platform: "test".into(),
            app_version: "1.0.0".into(),
        });
        let logger = AuditLogger::new(store, engine, clock.clone(), AuditConfig::default(), context);
        let mut failures = logger.subscribe_failures();

        // Overdue key blocks sealing
        clock.advance(Duration::days(200));
        assert!(logger.record(login_failure("a")).await.is_none());

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.event_type, AuditEventType::AuthenticationFailure);
        assert_eq!(failure.category, ErrorCategory::Compliance);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_events() {
        let h = harness(AuditConfig::default());
        let logger = Arc::new(h.logger);

        let mut handles = Vec::new();
        for i in 0..10 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger.log_event(login_failure(&format!("user-{i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (from, to) = wide_range();
        let events = logger.retrieve_events(from, to, None, None).await.unwrap();
        assert_eq!(events.len(), 10);
        assert_eq!(logger.indexed_events(from, to, None, None).await.unwrap().len(), 10);
    }
}
