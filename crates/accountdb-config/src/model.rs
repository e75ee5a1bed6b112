use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, read from `accountdb.yml` / `accountdb.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub migrations: MigrationsConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// How long a statement waits on the engine's write lock before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accountdb.sqlite3"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationsConfig {
    /// When false the CLI refuses to run any reversal, even with `--yes`.
    pub allow_revert: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { allow_revert: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Lifetime of a freshly issued email-verification token.
    pub token_ttl_hours: i64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24,
        }
    }
}
