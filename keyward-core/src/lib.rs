//! Credential security core
//!
//! Versioned authenticated encryption, key rotation, rate limiting with
//! exponential backoff, an integrity-protected encrypted audit log, a
//! credential coordinator, and legacy data migration, all over an abstract
//! secret store.
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


pub mod audit;
pub mod clock;
pub mod credentials;
pub mod encryption;
pub mod error;
pub mod key_rotation;
pub mod migration;
pub mod rate_limiter;
pub mod service;
pub mod store;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, EventResult, NewAuditEvent, RiskLevel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{
    CredentialManager, PresenceGate, PresenceOutcome, SecureCredentials, TokenRefreshResponse,
};
pub use encryption::{EncryptionEngine, SymmetricKey, VersionedCiphertext};
pub use error::*;
pub use key_rotation::{KeyRotationManager, KeyVersionRecord, RotationPolicy};
pub use migration::{MigrationReport, MigrationService};
pub use rate_limiter::{RateLimitPolicy, RateLimitStatus, RateLimiter};
pub use service::{init_security_core, SecurityCore, SecurityCoreBuilder};
pub use store::{FileSecretStore, MemorySecretStore, SecretStore, ValidatingStore};
