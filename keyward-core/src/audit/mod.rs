//! Security audit logging
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


pub mod event;
pub mod logger;
pub mod report;

pub use event::{
    AuditContext, AuditEvent, AuditEventType, AuditIndexEntry, DeviceInfo, EventMetadata,
    EventResult, EventSource, NetworkInfo, NewAuditEvent, OperationDetails, RiskLevel,
};
pub use logger::{AlertSink, AuditConfig, AuditFailure, AuditLogger, TracingAlertSink};
pub use report::{ComplianceExport, ComplianceReport, ReportMetadata, ReportPeriod, ReportSummary};
