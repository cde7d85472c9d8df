//! Rate limiting for credential access
//!
//! Sliding-window failure counting per `(identifier, operation)` with
//! exponential-backoff lockouts. State is persisted in the secret store and
//! every decision is recomputed from stored timestamps.
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
use crate::error::{RateLimitError, RateLimitResult};
use crate::store::SecretStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Attempts older than this are purged from persisted state
pub const ATTEMPT_RETENTION_HOURS: i64 = 24;

const STATE_KEY_PREFIX: &str = "keyward.rate_limit";
const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_OPERATION_LEN: usize = 64;

/// Well-known operation names
pub mod operations {
    pub const AUTHENTICATION: &str = "authentication";
    pub const CREDENTIAL_ACCESS: &str = "credential_access";
    pub const TOKEN_ACCESS: &str = "token_access";
}

/// Rate limiting policy
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    /// Failed attempts allowed inside the window
    pub max_attempts: u32,
    /// Sliding window length
    pub time_window: Duration,
    /// Lockout applied when the window is saturated (zero: window-only limiting)
    pub base_lockout: Duration,
    /// Cap for exponential backoff
    pub max_lockout: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
    pub exponential_backoff: bool,
}

impl RateLimitPolicy {
    /// Authentication attempts: 5 failures per minute, 60s base lockout
    pub fn authentication() -> Self {
        Self {
            max_attempts: 5,
            time_window: Duration::seconds(60),
            base_lockout: Duration::seconds(60),
            max_lockout: Duration::seconds(3600),
            backoff_multiplier: 2.0,
            exponential_backoff: true,
        }
    }

    /// Sensitive operations: 3 failures per minute, 300s base lockout, 2h cap
    pub fn sensitive() -> Self {
        Self {
            max_attempts: 3,
            time_window: Duration::seconds(60),
            base_lockout: Duration::seconds(300),
            max_lockout: Duration::seconds(7200),
            backoff_multiplier: 2.0,
            exponential_backoff: true,
        }
    }

    /// Effectively unlimited policy for non-production builds
    #[cfg(feature = "testing-bypass")]
    pub fn testing() -> Self {
        Self {
            max_attempts: u32::MAX,
            time_window: Duration::seconds(1),
            base_lockout: Duration::zero(),
            max_lockout: Duration::zero(),
            backoff_multiplier: 1.0,
            exponential_backoff: false,
        }
    }

    /// Lockout for the given number of consecutive failures
    ///
    /// `min(base * multiplier^(consecutive_failures - 1), max)` with backoff
    /// enabled, `min(base, max)` otherwise.
    pub fn lockout_duration(&self, consecutive_failures: u32) -> Duration {
        if self.base_lockout <= Duration::zero() {
            return Duration::zero();
        }
        if !self.exponential_backoff {
            return self.base_lockout.min(self.max_lockout);
        }

        let exponent = consecutive_failures.saturating_sub(1).min(64) as i32;
        let secs = (self.base_lockout.num_seconds() as f64) * self.backoff_multiplier.powi(exponent);
        let secs = secs.min(self.max_lockout.num_seconds() as f64);
        Duration::seconds(secs as i64)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::authentication()
    }
}

/// One recorded attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub timestamp: DateTime<Utc>,
    pub successful: bool,
}

/// Persisted state of one `(identifier, operation)` bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub attempts: Vec<Attempt>,
    pub lockout_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Drop attempts older than the retention horizon; true when anything changed
    fn prune(&mut self, now: DateTime<Utc>) -> bool {
        let horizon = now - Duration::hours(ATTEMPT_RETENTION_HOURS);
        let before = self.attempts.len();
        self.attempts.retain(|a| a.timestamp > horizon);
        self.attempts.len() != before
    }

    fn active_lockout(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lockout_until.filter(|until| *until > now)
    }

    /// Failure timestamps inside the window that follow the last success
    fn failures_in_window(&self, now: DateTime<Utc>, window: Duration) -> Vec<DateTime<Utc>> {
        let window_start = now - window;
        let last_success = self
            .attempts
            .iter()
            .filter(|a| a.successful)
            .map(|a| a.timestamp)
            .max();

        self.attempts
            .iter()
            .filter(|a| !a.successful && a.timestamp > window_start)
            .filter(|a| last_success.map_or(true, |s| a.timestamp > s))
            .map(|a| a.timestamp)
            .collect()
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed {
        remaining: u32,
    },
    Limited {
        retry_after: DateTime<Utc>,
        remaining: u32,
    },
    Locked {
        unlock_at: DateTime<Utc>,
        total_failures: u32,
    },
}

impl RateLimitStatus {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitStatus::Allowed { .. })
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Persisted state key for a bucket
///
/// Both parts are sanitized so caller-supplied identifiers cannot inject
/// storage-key syntax.
pub fn state_key(identifier: &str, operation: &str) -> String {
    let operation: String = sanitize_component(operation)
        .chars()
        .take(MAX_OPERATION_LEN)
        .collect();
    let identifier = if identifier.chars().count() > MAX_IDENTIFIER_LEN {
        hex::encode(Sha256::digest(identifier.as_bytes()))
    } else {
        sanitize_component(identifier)
    };
    format!("{}.{}.{}", STATE_KEY_PREFIX, operation, identifier)
}

/// Per-identifier, per-operation rate limiter
pub struct RateLimiter {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    /// Serializes every read-modify-write of persisted state
    lock: Mutex<()>,
    #[cfg(feature = "testing-bypass")]
    bypass: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
            #[cfg(feature = "testing-bypass")]
            bypass: false,
        }
    }

    /// Limiter that allows everything; only compiled with `testing-bypass`
    #[cfg(feature = "testing-bypass")]
    pub fn with_bypass(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        warn!("Rate limiter bypass enabled");
        Self {
            bypass: true,
            ..Self::new(store, clock)
        }
    }

    fn bypassed(&self) -> bool {
        #[cfg(feature = "testing-bypass")]
        {
            self.bypass
        }
        #[cfg(not(feature = "testing-bypass"))]
        {
            false
        }
    }

    async fn load_state(&self, key: &str) -> RateLimitResult<RateLimitState> {
        match self.store.retrieve_optional(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(RateLimitState::default()),
        }
    }

    async fn save_state(&self, key: &str, state: &RateLimitState) -> RateLimitResult<()> {
        self.store.store(key, &serde_json::to_vec(state)?).await?;
        Ok(())
    }

    fn evaluate(state: &RateLimitState, policy: &RateLimitPolicy, now: DateTime<Utc>) -> RateLimitStatus {
        if let Some(unlock_at) = state.active_lockout(now) {
            return RateLimitStatus::Locked {
                unlock_at,
                total_failures: state.consecutive_failures,
            };
        }

        let failures = state.failures_in_window(now, policy.time_window);
        let count = failures.len() as u32;
        match failures.iter().min() {
            Some(oldest) if count >= policy.max_attempts => RateLimitStatus::Limited {
                retry_after: *oldest + policy.time_window,
                remaining: 0,
            },
            _ => RateLimitStatus::Allowed {
                remaining: policy.max_attempts.saturating_sub(count),
            },
        }
    }

    /// Check whether another attempt is allowed
    ///
    /// Read-only apart from purging expired attempts.
    pub async fn check_limit(
        &self,
        identifier: &str,
        operation: &str,
        policy: Option<&RateLimitPolicy>,
    ) -> RateLimitResult<RateLimitStatus> {
        let default_policy = RateLimitPolicy::default();
        let policy = policy.unwrap_or(&default_policy);
        if self.bypassed() {
            return Ok(RateLimitStatus::Allowed {
                remaining: policy.max_attempts,
            });
        }

        let _guard = self.lock.lock().await;
        let key = state_key(identifier, operation);
        let now = self.clock.now();

        let mut state = self.load_state(&key).await?;
        if state.prune(now) {
            self.save_state(&key, &state).await?;
        }

        let status = Self::evaluate(&state, policy, now);
        debug!(operation = operation, status = ?status, "Rate limit checked");
        Ok(status)
    }

    /// Record an attempt
    ///
    /// The attempt is always persisted. A failure that saturates the window
    /// returns `AccountLocked` (or `RateLimitExceeded` for window-only
    /// policies) after it has been recorded.
    pub async fn record_attempt(
        &self,
        identifier: &str,
        operation: &str,
        successful: bool,
        policy: Option<&RateLimitPolicy>,
    ) -> RateLimitResult<()> {
        if self.bypassed() {
            return Ok(());
        }
        let default_policy = RateLimitPolicy::default();
        let policy = policy.unwrap_or(&default_policy);

        let _guard = self.lock.lock().await;
        let key = state_key(identifier, operation);
        let now = self.clock.now();

        let mut state = self.load_state(&key).await?;
        state.prune(now);
        state.attempts.push(Attempt {
            timestamp: now,
            successful,
        });
        state.last_attempt = Some(now);

        if successful {
            state.consecutive_failures = 0;
            state.lockout_until = None;
            self.save_state(&key, &state).await?;
            debug!(operation = operation, "Successful attempt recorded, failures reset");
            return Ok(());
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.failures_in_window(now, policy.time_window);
        if (failures.len() as u32) < policy.max_attempts {
            self.save_state(&key, &state).await?;
            debug!(
                operation = operation,
                consecutive_failures = state.consecutive_failures,
                "Failed attempt recorded"
            );
            return Ok(());
        }

        let lockout = policy.lockout_duration(state.consecutive_failures);
        if lockout > Duration::zero() {
            let candidate = now + lockout;
            let unlock_at = state
                .active_lockout(now)
                .map_or(candidate, |existing| existing.max(candidate));
            state.lockout_until = Some(unlock_at);
            self.save_state(&key, &state).await?;

            warn!(
                operation = operation,
                consecutive_failures = state.consecutive_failures,
                lockout_secs = lockout.num_seconds(),
                "Lockout applied"
            );
            return Err(RateLimitError::AccountLocked { unlock_at });
        }

        self.save_state(&key, &state).await?;
        let retry_after = failures
            .iter()
            .min()
            .map_or(now, |oldest| *oldest + policy.time_window);
        warn!(operation = operation, "Rate limit exceeded");
        Err(RateLimitError::RateLimitExceeded { retry_after })
    }

    /// Current persisted state of a bucket
    pub async fn state(&self, identifier: &str, operation: &str) -> RateLimitResult<RateLimitState> {
        let _guard = self.lock.lock().await;
        self.load_state(&state_key(identifier, operation)).await
    }

    /// Clear a bucket entirely
    pub async fn reset(&self, identifier: &str, operation: &str) -> RateLimitResult<()> {
        let _guard = self.lock.lock().await;
        self.store.delete(&state_key(identifier, operation)).await?;
        debug!(operation = operation, "Rate limit state reset");
        Ok(())
    }
}
