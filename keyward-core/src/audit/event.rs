//! Audit event definitions
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


use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Security-relevant event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Authentication events
    AuthenticationSuccess,
    AuthenticationFailure,
    AccountLocked,
    RateLimitExceeded,
    UnauthorizedAccess,

    // Credential events
    CredentialStoreAttempt,
    CredentialStored,
    CredentialAccessed,
    CredentialDeleted,
    TokenRefreshed,

    // Key events
    KeyGenerated,
    KeyRotated,
    KeyDeleted,
    OverdueRiskAccepted,

    // Migration events
    MigrationStarted,
    MigrationCompleted,
    MigrationFailed,
    MigrationRolledBack,

    // Log maintenance and compliance
    IntegrityViolation,
    ComplianceExport,
    LogRotated,
    RetentionApplied,
}

impl AuditEventType {
    /// Static risk classification of the event type
    pub fn risk_level(&self) -> RiskLevel {
        match self {
            AuditEventType::IntegrityViolation | AuditEventType::MigrationFailed => {
                RiskLevel::Critical
            }
            AuditEventType::AuthenticationFailure
            | AuditEventType::AccountLocked
            | AuditEventType::RateLimitExceeded
            | AuditEventType::UnauthorizedAccess
            | AuditEventType::OverdueRiskAccepted => RiskLevel::High,
            AuditEventType::CredentialAccessed
            | AuditEventType::CredentialDeleted
            | AuditEventType::KeyRotated
            | AuditEventType::KeyDeleted
            | AuditEventType::MigrationRolledBack
            | AuditEventType::ComplianceExport => RiskLevel::Medium,
            AuditEventType::AuthenticationSuccess
            | AuditEventType::CredentialStoreAttempt
            | AuditEventType::CredentialStored
            | AuditEventType::TokenRefreshed
            | AuditEventType::KeyGenerated
            | AuditEventType::MigrationStarted
            | AuditEventType::MigrationCompleted
            | AuditEventType::LogRotated
            | AuditEventType::RetentionApplied => RiskLevel::Low,
        }
    }
}

/// Risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// High and critical events trigger realtime alerts
    pub fn is_high(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// Outcome of the audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    Success,
    Failure,
    Partial,
    Denied,
    Timeout,
}

impl EventResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, EventResult::Failure | EventResult::Denied | EventResult::Timeout)
    }
}

/// Whether the user or the system initiated the operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[default]
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
    pub app_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// What was done, to what, and how long it took
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDetails {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Internal failure cause; only ever written to the audit log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed per-event metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default)]
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_session: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u32>,
}

/// A persisted audit event
///
/// `integrity` is the HMAC over the canonical serialization of every other
/// field; events are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub result: EventResult,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    pub device_info: DeviceInfo,
    pub network_info: NetworkInfo,
    pub operation_details: OperationDetails,
    pub metadata: EventMetadata,
    pub integrity: String,
}

/// Unencrypted index entry used for cheap filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIndexEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub result: EventResult,
}

impl From<&AuditEvent> for AuditIndexEntry {
    fn from(event: &AuditEvent) -> Self {
        Self {
            id: event.id,
            timestamp: event.timestamp,
            event_type: event.event_type,
            risk_level: event.risk_level,
            user_id: event.user_id.clone(),
            result: event.result,
        }
    }
}

/// Device/session context stamped onto every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub session_id: String,
    pub device_info: DeviceInfo,
    pub network_info: NetworkInfo,
}

impl AuditContext {
    /// Context for a fresh session on the given device
    pub fn new(device_info: DeviceInfo) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_info,
            network_info: NetworkInfo::default(),
        }
    }
}

/// Event description supplied by callers; the logger fills in identity,
/// timing, context, risk, and integrity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEvent {
    pub event_type: AuditEventType,
    pub result: EventResult,
    pub user_id: Option<String>,
    pub operation_details: OperationDetails,
    pub metadata: EventMetadata,
}

impl NewAuditEvent {
    pub fn new(event_type: AuditEventType, result: EventResult, operation: impl Into<String>) -> Self {
        Self {
            event_type,
            result,
            user_id: None,
            operation_details: OperationDetails {
                operation: operation.into(),
                ..Default::default()
            },
            metadata: EventMetadata::default(),
        }
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.operation_details.resource = Some(resource.into());
        self
    }

    pub fn duration(mut self, elapsed: std::time::Duration) -> Self {
        self.operation_details.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn failure(mut self, category: ErrorCategory, reason: impl Into<String>) -> Self {
        self.operation_details.error_category = Some(category);
        self.operation_details.reason = Some(reason.into());
        self
    }

    /// Mark as system-initiated
    pub fn system(mut self) -> Self {
        self.metadata.source = EventSource::System;
        self
    }

    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        let source = self.metadata.source;
        self.metadata = EventMetadata { source, ..metadata };
        self
    }

    pub fn key_version(mut self, version: u32) -> Self {
        self.metadata.key_version = Some(version);
        self
    }
}
