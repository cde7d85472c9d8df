//! Key versioning and rotation
//!
//! Versions only move forward: `NoKey -> Active(1) -> Active(2) -> ...`.
//! Key material of every retained version stays readable so ciphertext sealed
//! under an old version keeps decrypting after a rotation.
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


use crate::clock::Clock;
use crate::encryption::{SymmetricKey, MAX_KEY_VERSION};
use crate::error::{KeyError, KeyResult};
use crate::store::SecretStore;
use chrono::{DateTime, Duration, Utc};
use keyward_config::RotationSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const REGISTRY_KEY: &str = "keyward.keys.registry";
pub const ROTATION_TRAIL_KEY: &str = "keyward.keys.rotation_trail";
pub const LEGACY_KEY: &str = "keyward.keys.legacy";
pub const OVERDUE_ACK_KEY: &str = "keyward.keys.overdue_ack";

/// Storage key holding the material of one key version
pub fn material_key(version: u32) -> String {
    format!("keyward.keys.v{}", version)
}

/// Key version record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersionRecord {
    /// Version number (incremental)
    pub version: u32,
    /// When this version was created
    pub created_at: DateTime<Utc>,
    /// Why the version was created
    pub rotation_reason: String,
}

/// Time-based rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Age after which rotation is due
    pub rotation_interval_days: u32,
    /// Grace period after the interval before rotation is overdue
    pub max_overdue_days: u32,
    /// Refuse to hand out the current key once overdue (unless acknowledged)
    pub block_when_overdue: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_days: 90,
            max_overdue_days: 30,
            block_when_overdue: true,
        }
    }
}

impl From<&RotationSettings> for RotationPolicy {
    fn from(settings: &RotationSettings) -> Self {
        Self {
            rotation_interval_days: settings.interval_days,
            max_overdue_days: settings.max_overdue_days,
            block_when_overdue: settings.block_when_overdue,
        }
    }
}

impl RotationPolicy {
    fn interval(&self) -> Duration {
        Duration::days(i64::from(self.rotation_interval_days))
    }

    fn overdue_after(&self) -> Duration {
        Duration::days(i64::from(self.rotation_interval_days) + i64::from(self.max_overdue_days))
    }

    /// Key created at `created_at` has exceeded the rotation interval
    pub fn rotation_needed(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at > self.interval()
    }

    /// Key created at `created_at` has exceeded interval plus grace period
    pub fn rotation_overdue(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at > self.overdue_after()
    }

    /// Whole days past the grace period (zero when not overdue)
    pub fn days_overdue(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        ((now - created_at) - self.overdue_after()).num_days().max(0)
    }
}

/// Who initiated a rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    /// First key generated for an empty store
    Initial,
    /// Explicit caller request
    Manual,
    /// System-initiated because rotation was overdue
    Compliance,
}

/// Entry of the rotation compliance trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub from_version: Option<u32>,
    pub to_version: u32,
    pub reason: String,
    pub trigger: RotationTrigger,
}

/// Period during which a version stayed current past its grace period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueGap {
    pub version: u32,
    pub active_from: DateTime<Utc>,
    pub active_until: DateTime<Utc>,
    pub days_overdue: i64,
}

/// Read-only summary of rotation history over a date range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
    /// Rotations (initial key generation excluded) in the period
    pub rotation_count: usize,
    pub average_interval_days: Option<f64>,
    pub overdue_gaps: Vec<OverdueGap>,
    pub current_version: u32,
    pub rotation_needed: bool,
    pub rotation_overdue: bool,
    pub events: Vec<RotationEvent>,
}

/// Snapshot of the current rotation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationStatus {
    pub current_version: u32,
    pub current_created_at: DateTime<Utc>,
    pub rotation_needed: bool,
    pub rotation_overdue: bool,
    pub overdue_acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverdueAcknowledgement {
    version: u32,
    acknowledged_at: DateTime<Utc>,
    reason: String,
}

/// Immutable view of all retained keys; replaced wholesale on rotation
#[derive(Debug, Clone)]
struct KeyRing {
    current: u32,
    records: Vec<KeyVersionRecord>,
    keys: BTreeMap<u32, Arc<SymmetricKey>>,
    overdue_acknowledged: bool,
}

impl KeyRing {
    fn current_record(&self) -> KeyResult<&KeyVersionRecord> {
        self.records
            .iter()
            .find(|r| r.version == self.current)
            .ok_or(KeyError::UnsupportedKeyVersion(self.current))
    }

    fn current_key(&self) -> KeyResult<(u32, Arc<SymmetricKey>)> {
        self.keys
            .get(&self.current)
            .map(|k| (self.current, k.clone()))
            .ok_or(KeyError::UnsupportedKeyVersion(self.current))
    }
}

/// Owns key generation, version tracking, and rotation policy
///
/// Readers take an `Arc<KeyRing>` snapshot so "current version" and "key for
/// that version" always come from the same ring; rotation builds a new ring
/// and swaps it in under the write lock.
pub struct KeyRotationManager {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
    ring: RwLock<Option<Arc<KeyRing>>>,
    /// Serializes ring loading and every mutation
    rotation_lock: Mutex<()>,
}

impl KeyRotationManager {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>, policy: RotationPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            ring: RwLock::new(None),
            rotation_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Get the current key ring, loading (or initializing) it on first use
    async fn ring(&self) -> KeyResult<Arc<KeyRing>> {
        if let Some(ring) = self.ring.read().await.as_ref() {
            return Ok(ring.clone());
        }

        let _guard = self.rotation_lock.lock().await;
        self.ring_locked().await
    }

    /// Same as `ring`, for callers already holding `rotation_lock`
    async fn ring_locked(&self) -> KeyResult<Arc<KeyRing>> {
        if let Some(ring) = self.ring.read().await.as_ref() {
            return Ok(ring.clone());
        }

        let ring = Arc::new(self.load_or_initialize().await?);
        *self.ring.write().await = Some(ring.clone());
        Ok(ring)
    }

    async fn load_or_initialize(&self) -> KeyResult<KeyRing> {
        let records = self.load_registry().await?;

        if records.is_empty() {
            info!("No key versions found, generating initial key");
            let empty = KeyRing {
                current: 0,
                records: Vec::new(),
                keys: BTreeMap::new(),
                overdue_acknowledged: false,
            };
            let (ring, record) = self.create_version(&empty, "initial key").await?;
            self.record_rotation(&empty, &record, RotationTrigger::Initial)
                .await;
            return Ok(ring);
        }

        let mut keys = BTreeMap::new();
        for record in &records {
            match self.store.retrieve_optional(&material_key(record.version)).await? {
                Some(bytes) => {
                    keys.insert(record.version, Arc::new(SymmetricKey::from_slice(&bytes)?));
                }
                None => debug!(key_version = record.version, "Key version retired, material absent"),
            }
        }

        let current = records.iter().map(|r| r.version).max().unwrap_or_default();
        if !keys.contains_key(&current) {
            return Err(KeyError::InvalidKeyMaterial(format!(
                "material for current version {} is missing",
                current
            )));
        }

        let overdue_acknowledged = match self.store.retrieve_optional(OVERDUE_ACK_KEY).await? {
            Some(bytes) => serde_json::from_slice::<OverdueAcknowledgement>(&bytes)?.version == current,
            None => false,
        };

        debug!(current_version = current, retained = keys.len(), "Loaded key ring");
        Ok(KeyRing {
            current,
            records,
            keys,
            overdue_acknowledged,
        })
    }

    async fn load_registry(&self) -> KeyResult<Vec<KeyVersionRecord>> {
        match self.store.retrieve_optional(REGISTRY_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Generate and persist the next version on top of `ring`
    ///
    /// Once the registry write succeeds the version exists and the returned
    /// ring must replace the in-memory one.
    async fn create_version(
        &self,
        ring: &KeyRing,
        reason: &str,
    ) -> KeyResult<(KeyRing, KeyVersionRecord)> {
        let version = ring.current + 1;
        if version >= MAX_KEY_VERSION {
            return Err(KeyError::Rotation(format!(
                "key version space exhausted at {}",
                ring.current
            )));
        }

        let now = self.clock.now();
        let key = SymmetricKey::generate();
        let record = KeyVersionRecord {
            version,
            created_at: now,
            rotation_reason: reason.to_string(),
        };

        // Material first: a registry entry must never point at missing material
        self.store.store(&material_key(version), key.as_bytes()).await?;

        let mut records = ring.records.clone();
        records.push(record.clone());
        self.store
            .store(REGISTRY_KEY, &serde_json::to_vec(&records)?)
            .await?;

        let mut keys = ring.keys.clone();
        keys.insert(version, Arc::new(key));

        Ok((
            KeyRing {
                current: version,
                records,
                keys,
                overdue_acknowledged: false,
            },
            record,
        ))
    }

    /// Append the rotation to the compliance trail; failures are logged only
    async fn record_rotation(
        &self,
        previous: &KeyRing,
        record: &KeyVersionRecord,
        trigger: RotationTrigger,
    ) {
        let event = RotationEvent {
            id: Uuid::new_v4(),
            occurred_at: record.created_at,
            from_version: (previous.current > 0).then_some(previous.current),
            to_version: record.version,
            reason: record.rotation_reason.clone(),
            trigger,
        };
        if let Err(e) = self.append_trail(event).await {
            error!(key_version = record.version, error = %e, "Failed to append rotation trail");
        }
    }

    async fn append_trail(&self, event: RotationEvent) -> KeyResult<()> {
        let mut trail = self.rotation_history().await?;
        trail.push(event);
        self.store
            .store(ROTATION_TRAIL_KEY, &serde_json::to_vec(&trail)?)
            .await?;
        Ok(())
    }

    async fn rotate(&self, reason: &str, trigger: RotationTrigger) -> KeyResult<KeyVersionRecord> {
        let _guard = self.rotation_lock.lock().await;
        let ring = self.ring_locked().await?;

        info!(
            from_version = ring.current,
            to_version = ring.current + 1,
            reason = reason,
            trigger = ?trigger,
            "Rotating encryption key"
        );

        let (next, record) = self.create_version(&ring, reason).await?;
        *self.ring.write().await = Some(Arc::new(next));

        self.record_rotation(&ring, &record, trigger).await;
        // A leftover acknowledgement names the old version and no longer applies
        if let Err(e) = self.store.delete(OVERDUE_ACK_KEY).await {
            warn!(error = %e, "Failed to clear overdue acknowledgement");
        }

        Ok(record)
    }

    /// Rotate to a new key version on explicit request
    pub async fn rotate_key(&self, reason: &str) -> KeyResult<KeyVersionRecord> {
        self.rotate(reason, RotationTrigger::Manual).await
    }

    /// Rotate automatically when the current version is overdue
    ///
    /// Returns the new version record when a rotation happened.
    pub async fn enforce_compliance_rotation(&self) -> KeyResult<Option<KeyVersionRecord>> {
        if !self.is_rotation_overdue().await? {
            return Ok(None);
        }

        warn!("Key rotation overdue, rotating for compliance");
        let record = self
            .rotate("compliance: rotation overdue", RotationTrigger::Compliance)
            .await?;
        Ok(Some(record))
    }

    /// Get the current key version and its material
    ///
    /// Fails with `RotationOverdue` when the policy blocks overdue keys and
    /// the risk has not been acknowledged for this version.
    pub async fn current_key(&self) -> KeyResult<(u32, Arc<SymmetricKey>)> {
        let ring = self.ring().await?;
        let record = ring.current_record()?;
        let now = self.clock.now();

        if self.policy.block_when_overdue
            && !ring.overdue_acknowledged
            && self.policy.rotation_overdue(record.created_at, now)
        {
            return Err(KeyError::RotationOverdue {
                version: ring.current,
                days_overdue: self.policy.days_overdue(record.created_at, now),
            });
        }

        ring.current_key()
    }

    /// Current key without the compliance gate, for decrypt-side fallbacks
    pub(crate) async fn current_key_unchecked(&self) -> KeyResult<(u32, Arc<SymmetricKey>)> {
        self.ring().await?.current_key()
    }

    /// Get the retained key for exactly `version`
    pub async fn key_for_version(&self, version: u32) -> KeyResult<Arc<SymmetricKey>> {
        self.ring()
            .await?
            .keys
            .get(&version)
            .cloned()
            .ok_or(KeyError::UnsupportedKeyVersion(version))
    }

    pub async fn current_version(&self) -> KeyResult<u32> {
        Ok(self.ring().await?.current)
    }

    /// Versions whose key material is still retained, ascending
    pub async fn active_versions(&self) -> KeyResult<Vec<KeyVersionRecord>> {
        let ring = self.ring().await?;
        Ok(ring
            .records
            .iter()
            .filter(|r| ring.keys.contains_key(&r.version))
            .cloned()
            .collect())
    }

    pub async fn is_rotation_needed(&self) -> KeyResult<bool> {
        let ring = self.ring().await?;
        Ok(self
            .policy
            .rotation_needed(ring.current_record()?.created_at, self.clock.now()))
    }

    pub async fn is_rotation_overdue(&self) -> KeyResult<bool> {
        let ring = self.ring().await?;
        Ok(self
            .policy
            .rotation_overdue(ring.current_record()?.created_at, self.clock.now()))
    }

    pub async fn status(&self) -> KeyResult<RotationStatus> {
        let ring = self.ring().await?;
        let record = ring.current_record()?;
        let now = self.clock.now();
        Ok(RotationStatus {
            current_version: ring.current,
            current_created_at: record.created_at,
            rotation_needed: self.policy.rotation_needed(record.created_at, now),
            rotation_overdue: self.policy.rotation_overdue(record.created_at, now),
            overdue_acknowledged: ring.overdue_acknowledged,
        })
    }

    /// Explicitly accept the risk of using the overdue current version
    ///
    /// The acknowledgement only covers the current version and is cleared by
    /// the next rotation.
    pub async fn acknowledge_overdue_risk(&self, reason: &str) -> KeyResult<u32> {
        let _guard = self.rotation_lock.lock().await;
        let ring = self.ring_locked().await?;

        let ack = OverdueAcknowledgement {
            version: ring.current,
            acknowledged_at: self.clock.now(),
            reason: reason.to_string(),
        };
        self.store
            .store(OVERDUE_ACK_KEY, &serde_json::to_vec(&ack)?)
            .await?;

        let mut next = (*ring).clone();
        next.overdue_acknowledged = true;
        *self.ring.write().await = Some(Arc::new(next));

        warn!(key_version = ring.current, reason = reason, "Overdue key risk acknowledged");
        Ok(ring.current)
    }

    /// Remove the key material of a non-current version
    ///
    /// Ciphertext sealed under a retired version becomes undecryptable.
    pub async fn retire_version(&self, version: u32) -> KeyResult<()> {
        let _guard = self.rotation_lock.lock().await;
        let ring = self.ring_locked().await?;

        if version == ring.current {
            return Err(KeyError::Rotation(format!(
                "cannot retire current version {}",
                version
            )));
        }
        if !ring.keys.contains_key(&version) {
            return Err(KeyError::UnsupportedKeyVersion(version));
        }

        self.store.delete(&material_key(version)).await?;

        let mut next = (*ring).clone();
        next.keys.remove(&version);
        *self.ring.write().await = Some(Arc::new(next));

        info!(key_version = version, "Key version retired");
        Ok(())
    }

    /// Install the single non-versioned key used by pre-versioning data
    pub async fn install_legacy_key(&self, key: &SymmetricKey) -> KeyResult<()> {
        self.store.store(LEGACY_KEY, key.as_bytes()).await?;
        Ok(())
    }

    pub async fn legacy_key(&self) -> KeyResult<Option<SymmetricKey>> {
        match self.store.retrieve_optional(LEGACY_KEY).await? {
            Some(bytes) => Ok(Some(SymmetricKey::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Full rotation compliance trail, oldest first
    pub async fn rotation_history(&self) -> KeyResult<Vec<RotationEvent>> {
        match self.store.retrieve_optional(ROTATION_TRAIL_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Summarize rotations within `[from, to]`
    pub async fn compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> KeyResult<RotationComplianceReport> {
        let ring = self.ring().await?;
        let now = self.clock.now();
        let in_period = |t: &DateTime<Utc>| *t >= from && *t <= to;

        let events: Vec<RotationEvent> = self
            .rotation_history()
            .await?
            .into_iter()
            .filter(|e| in_period(&e.occurred_at))
            .collect();
        let rotation_count = events
            .iter()
            .filter(|e| e.trigger != RotationTrigger::Initial)
            .count();

        let mut records = ring.records.clone();
        records.sort_by_key(|r| r.version);

        let intervals: Vec<f64> = records
            .windows(2)
            .filter(|pair| in_period(&pair[1].created_at))
            .map(|pair| (pair[1].created_at - pair[0].created_at).num_seconds() as f64 / 86_400.0)
            .collect();
        let average_interval_days = if intervals.is_empty() {
            None
        } else {
            Some(intervals.iter().sum::<f64>() / intervals.len() as f64)
        };

        let mut overdue_gaps = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let active_until = records.get(i + 1).map(|r| r.created_at).unwrap_or(now);
            let overlaps = record.created_at <= to && active_until >= from;
            if overlaps && self.policy.rotation_overdue(record.created_at, active_until) {
                overdue_gaps.push(OverdueGap {
                    version: record.version,
                    active_from: record.created_at,
                    active_until,
                    days_overdue: self.policy.days_overdue(record.created_at, active_until),
                });
            }
        }

        let current = ring.current_record()?;
        Ok(RotationComplianceReport {
            generated_at: now,
            period_from: from,
            period_to: to,
            rotation_count,
            average_interval_days,
            overdue_gaps,
            current_version: ring.current,
            rotation_needed: self.policy.rotation_needed(current.created_at, now),
            rotation_overdue: self.policy.rotation_overdue(current.created_at, now),
            events,
        })
    }
}
