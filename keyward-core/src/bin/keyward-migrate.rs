//! Migrate legacy plaintext secrets into the encrypted, versioned layout
//!
//! Usage:
//!   KEYWARD_MIGRATE_KEYS=api_token,refresh_token cargo run --bin keyward-migrate
//!
//! Environment:
//!   KEYWARD_MIGRATE_KEYS      comma separated legacy keys to migrate
//!   KEYWARD_MIGRATE_DRY_RUN   `true` to verify without deleting legacy data
//!   KEYWARD_MIGRATE_RESUME    session id of an interrupted migration
//!   KEYWARD_MIGRATE_ROLLBACK  session id of a migration to undo

use anyhow::{bail, Context};
use keyward_config::SecurityConfig;
use keyward_core::init_security_core;
use keyward_core::migration::MigrationReport;
use keyward_logging::init_console_logging;
use std::env;
use tracing::{error, info};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SecurityConfig::from_env().context("failed to load configuration")?;
    init_console_logging("keyward-migrate", config.log_level());

    println!("🔐 Keyward Secure Migration");
    println!("{}", "=".repeat(50));
    println!();

    let core = init_security_core(&config)
        .await
        .context("failed to initialize security core")?;
    let migration = core.migration();

    if let Some(session_id) = session_from_env("KEYWARD_MIGRATE_ROLLBACK")? {
        let rollback = migration.rollback_migration(session_id).await?;
        println!("Rolled back session {}", rollback.session_id);
        println!("  ↩️  Restored: {}", rollback.restored.len());
        for key in &rollback.restored {
            println!("     - {}", key);
        }
        return Ok(());
    }

    let report = match session_from_env("KEYWARD_MIGRATE_RESUME")? {
        Some(session_id) => {
            info!(session_id = %session_id, "Resuming migration");
            migration.resume_migration(session_id).await?
        }
        None => {
            let keys: Vec<String> = env::var("KEYWARD_MIGRATE_KEYS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if keys.is_empty() {
                bail!("KEYWARD_MIGRATE_KEYS is empty, nothing to migrate");
            }
            let dry_run = env::var("KEYWARD_MIGRATE_DRY_RUN")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);
            migration.perform_secure_migration(&keys, dry_run).await?
        }
    };

    print_summary(&report);

    if let Err(e) = report.into_result() {
        error!(error = %e, "Migration verification failed");
        return Err(e.into());
    }
    Ok(())
}

fn session_from_env(var: &str) -> anyhow::Result<Option<Uuid>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            let id = Uuid::parse_str(value.trim()).with_context(|| format!("{} is not a session id", var))?;
            Ok(Some(id))
        }
        _ => Ok(None),
    }
}

fn print_summary(report: &MigrationReport) {
    let verified = report.records.iter().filter(|r| r.verified).count();
    let failed = report.records.len() - verified;

    println!();
    println!("{}", "=".repeat(50));
    println!("Migration Summary (session {}):", report.session_id);
    if report.dry_run {
        println!("  🧪 Dry run: legacy data left in place");
    }
    println!("  ✅ Verified: {}", verified);
    println!("  ⏭️  Skipped: {}", report.skipped.len());
    println!("  ❌ Checksum mismatches: {}", failed);
    println!("  🧹 Insecure keys purged: {}", report.purged_insecure_keys.len());
    println!();

    if report.completed {
        println!("✅ Migration complete!");
    } else if failed > 0 {
        println!("Resume with KEYWARD_MIGRATE_RESUME={}", report.session_id);
    }
}
