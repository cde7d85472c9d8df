//! Compliance report types
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


use super::event::{AuditEvent, AuditEventType, EventResult, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Associated data bound into encrypted export bundles
pub const EXPORT_AAD: &[u8] = b"keyward.compliance-export";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Aggregate counts over the reported events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_events: usize,
    pub events_by_type: BTreeMap<AuditEventType, usize>,
    pub events_by_risk_level: BTreeMap<RiskLevel, usize>,
    pub events_by_result: BTreeMap<EventResult, usize>,
    pub unique_users: usize,
    pub unique_sessions: usize,
    pub high_risk_events: usize,
    pub failure_events: usize,
}

impl ReportSummary {
    pub fn from_events(events: &[AuditEvent]) -> Self {
        let mut summary = ReportSummary {
            total_events: events.len(),
            ..Default::default()
        };
        let mut users = HashSet::new();
        let mut sessions = HashSet::new();

        for event in events {
            *summary.events_by_type.entry(event.event_type).or_default() += 1;
            *summary.events_by_risk_level.entry(event.risk_level).or_default() += 1;
            *summary.events_by_result.entry(event.result).or_default() += 1;
            if let Some(user) = &event.user_id {
                users.insert(user.as_str());
            }
            sessions.insert(event.session_id.as_str());
            if event.risk_level.is_high() {
                summary.high_risk_events += 1;
            }
            if event.result.is_failure() {
                summary.failure_events += 1;
            }
        }

        summary.unique_users = users.len();
        summary.unique_sessions = sessions.len();
        summary
    }
}

/// Provenance of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub generator: String,
    pub generator_version: String,
    pub device_id: String,
    pub retention_days: u32,
    pub integrity_algorithm: String,
    pub encryption_algorithm: String,
    pub export_encrypted: bool,
    pub standards: Vec<String>,
}

/// Read-only aggregation of audit history for external review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub report_period: ReportPeriod,
    pub events: Vec<AuditEvent>,
    pub summary: ReportSummary,
    pub metadata: ReportMetadata,
}

impl ComplianceReport {
    /// Pretty-printed JSON with keys sorted at every level
    pub fn to_sorted_json(&self) -> serde_json::Result<String> {
        // serde_json maps are ordered, so a round-trip through Value sorts keys
        let value = serde_json::to_value(self)?;
        serde_json::to_string_pretty(&value)
    }
}

/// Serialized report as handed to the caller
#[derive(Debug, Clone)]
pub struct ComplianceExport {
    pub report: ComplianceReport,
    /// Sorted JSON, or versioned AEAD ciphertext of it when `encrypted`
    pub payload: Vec<u8>,
    pub encrypted: bool,
}
