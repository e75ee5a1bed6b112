use std::io::IsTerminal;
use std::path::Path;

use accountdb_config::AppConfig;
use accountdb_db::email_verification::{STATUS_INDEX, TOKEN_INDEX, VERIFICATION_COLUMNS};
use accountdb_db::{AccountStore, ColumnInfo, IndexInfo};
use anyhow::{Context, Result, bail};
use dialoguer::Confirm;
use serde::Serialize;
use tracing::{info, warn};

use crate::report;

#[derive(Debug, Serialize)]
struct VerifyReport {
    complete: bool,
    columns: Vec<ColumnInfo>,
    indexes: Vec<IndexInfo>,
}

pub fn init(store: &AccountStore, json: bool) -> Result<()> {
    let tables = store.tables()?;
    if json {
        return report::print_json(&tables);
    }
    report::print_tables(&tables);
    Ok(())
}

pub fn migrate(store: &AccountStore, json: bool) -> Result<()> {
    let runs = store.migrate().context("migration failed")?;
    if json {
        return report::print_json(&runs);
    }
    report::print_runs(&runs);
    Ok(())
}

pub fn revert(
    store: &AccountStore,
    config: &AppConfig,
    version: u32,
    yes: bool,
    json: bool,
) -> Result<()> {
    if !config.migrations.allow_revert {
        bail!("reverts are disabled (migrations.allow_revert = false)");
    }
    if !confirm_revert(version, yes)? {
        println!("Revert cancelled.");
        return Ok(());
    }

    let run = store
        .revert(version)
        .with_context(|| format!("revert of migration {version} failed"))?;
    warn!("migration {version} reverted");
    if json {
        return report::print_json(&run);
    }
    report::print_runs(std::slice::from_ref(&run));
    Ok(())
}

fn confirm_revert(version: u32, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("refusing to revert migration {version} without --yes in a non-interactive session");
    }

    Confirm::new()
        .with_prompt(format!(
            "Revert migration {version}? Data in the dropped columns is lost"
        ))
        .default(false)
        .interact()
        .context("confirmation cancelled")
}

pub fn status(store: &AccountStore, json: bool) -> Result<()> {
    let status = store.migration_status()?;
    if json {
        return report::print_json(&status);
    }
    report::print_status(&status);
    Ok(())
}

pub fn verify(store: &AccountStore, json: bool) -> Result<()> {
    let columns = store.verify_columns()?;
    let indexes = store.verification_indexes()?;
    let complete = is_complete(&columns, &indexes);
    let verify = VerifyReport {
        complete,
        columns,
        indexes,
    };

    if json {
        report::print_json(&verify)?;
    } else {
        report::print_columns(&verify.columns);
        report::print_indexes(&verify.indexes);
    }

    if !complete {
        bail!(
            "email verification schema incomplete: {} of {} columns, {} indexes",
            verify.columns.len(),
            VERIFICATION_COLUMNS.len(),
            verify.indexes.len()
        );
    }
    info!("email verification schema verified");
    Ok(())
}

fn is_complete(columns: &[ColumnInfo], indexes: &[IndexInfo]) -> bool {
    let has_columns = VERIFICATION_COLUMNS
        .iter()
        .all(|name| columns.iter().any(|c| c.name == *name));
    let has_indexes = [TOKEN_INDEX, STATUS_INDEX]
        .iter()
        .all(|name| indexes.iter().any(|i| i.name == *name));
    has_columns && has_indexes
}

pub fn health(store: &AccountStore, json: bool) -> Result<()> {
    let health = store.health()?;
    if json {
        return report::print_json(&health);
    }
    report::print_health(&health);
    Ok(())
}

pub fn apply(store: &AccountStore, file: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    info!("applying {}", file.display());

    let outcome = store
        .apply_script(&text)
        .with_context(|| format!("failed to apply {}", file.display()))?;
    if json {
        return report::print_json(&outcome);
    }
    report::print_script(&outcome);
    Ok(())
}

pub fn issue_token(
    store: &AccountStore,
    config: &AppConfig,
    user_id: i64,
    json: bool,
) -> Result<()> {
    let hours = config.verification.token_ttl_hours;
    let ttl = chrono::Duration::try_hours(hours)
        .with_context(|| format!("token lifetime of {hours} hours is out of range"))?;
    let issued = store
        .issue_verification_token(user_id, ttl)
        .with_context(|| format!("failed to issue token for user {user_id}"))?;

    if json {
        return report::print_json(&serde_json::json!({
            "user_id": user_id,
            "token": issued.token,
            "expires": issued.expires.to_rfc3339(),
        }));
    }
    println!("{}", issued.token);
    println!("expires {}", issued.expires.to_rfc3339());
    Ok(())
}

pub fn unverified(store: &AccountStore, json: bool) -> Result<()> {
    let ids = store.unverified_users()?;
    if json {
        return report::print_json(&ids);
    }
    for id in &ids {
        println!("{id}");
    }
    info!("{} unverified user(s)", ids.len());
    Ok(())
}
