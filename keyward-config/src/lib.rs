//! Configuration management for the Keyward credential core

use config::{Config, Environment};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix (`KEYWARD_AUDIT__RETENTION_DAYS=30`)
pub const ENV_PREFIX: &str = "KEYWARD";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Secret store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory used by the file-backed secret store
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "./keyward-store".to_string(),
        }
    }
}

/// Key rotation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub interval_days: u32,
    pub max_overdue_days: u32,
    /// Refuse to hand out the current key once rotation is overdue
    pub block_when_overdue: bool,
    /// Rotate automatically before sealing new credentials when overdue
    pub auto_rotate_when_overdue: bool,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            interval_days: 90,
            max_overdue_days: 30,
            block_when_overdue: true,
            auto_rotate_when_overdue: true,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Maximum size of the live log blob in bytes before it is archived
    pub max_log_size: u64,
    pub retention_days: u32,
    pub enable_realtime_alerts: bool,
    pub export_encryption: bool,
    pub device_id: Option<String>,
    pub platform: String,
    pub app_version: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            max_log_size: 100 * 1024 * 1024,
            retention_days: 90,
            enable_realtime_alerts: true,
            export_encryption: false,
            device_id: None,
            platform: std::env::consts::OS.to_string(),
            app_version: "unknown".to_string(),
        }
    }
}

/// Credential storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Associated data bound into every credential ciphertext
    pub service_identifier: String,
    /// Credentials expiring within this many seconds need a refresh
    pub refresh_threshold_secs: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            service_identifier: "keyward.credentials".to_string(),
            refresh_threshold_secs: 300,
        }
    }
}

/// Legacy data migration configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Known-insecure legacy keys purged once every key is verified
    pub insecure_legacy_keys: Vec<String>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            insecure_legacy_keys: vec![
                "user_password".to_string(),
                "plaintext_password".to_string(),
                "stored_pin".to_string(),
                "auth_token_plain".to_string(),
                "refresh_token_plain".to_string(),
            ],
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub storage: StorageSettings,
    pub rotation: RotationSettings,
    pub audit: AuditSettings,
    pub credentials: CredentialSettings,
    pub migration: MigrationSettings,
    pub log_level: Option<String>,
}

impl SecurityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let source = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("migration.insecure_legacy_keys")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_config(source)
    }

    /// Deserialize and validate an already assembled configuration source
    pub fn from_config(source: Config) -> Result<Self, ConfigError> {
        let config: SecurityConfig = source.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.interval_days == 0 {
            return Err(ConfigError::Invalid(
                "rotation.interval_days must be at least 1".to_string(),
            ));
        }
        if self.audit.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "audit.retention_days must be at least 1".to_string(),
            ));
        }
        if self.audit.max_log_size == 0 {
            return Err(ConfigError::Invalid(
                "audit.max_log_size must be positive".to_string(),
            ));
        }
        if self.credentials.service_identifier.is_empty() {
            return Err(ConfigError::Invalid(
                "credentials.service_identifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.rotation.interval_days, 90);
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.audit.max_log_size, 100 * 1024 * 1024);
        assert_eq!(config.credentials.service_identifier, "keyward.credentials");
        assert_eq!(config.log_level(), "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_are_applied() {
        let source = Config::builder()
            .set_override("audit.retention_days", 30)
            .unwrap()
            .set_override("rotation.block_when_overdue", false)
            .unwrap()
            .set_override("log_level", "debug")
            .unwrap()
            .build()
            .unwrap();

        let config = SecurityConfig::from_config(source).unwrap();
        assert_eq!(config.audit.retention_days, 30);
        assert!(!config.rotation.block_when_overdue);
        // untouched sections keep their defaults
        assert_eq!(config.rotation.interval_days, 90);
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let source = Config::builder()
            .set_override("audit.retention_days", 0)
            .unwrap()
            .build()
            .unwrap();

        let result = SecurityConfig::from_config(source);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
