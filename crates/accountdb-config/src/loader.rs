use std::path::{Path, PathBuf};

use accountdb_common::{Error, Result};
use chrono::TimeDelta;
use tracing::{debug, info};

use crate::model::AppConfig;

const DEFAULT_FILES: [&str; 3] = ["accountdb.yml", "accountdb.yaml", "accountdb.toml"];

/// Loads `AppConfig` from disk and layers environment overrides on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`, or from the first default file found in
    /// the working directory. Falls back to defaults when no file exists.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::find_default(Path::new(".")) {
                Some(p) => Self::from_file(&p)?,
                None => {
                    debug!("no config file found, using defaults");
                    AppConfig::default()
                }
            },
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }

    fn find_default(dir: &Path) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }

    /// Apply `ACCOUNTDB_DATABASE`, `DATABASE_URL` and `ACCOUNTDB_LOG`.
    /// `ACCOUNTDB_DATABASE` wins over `DATABASE_URL` when both are set.
    pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("ACCOUNTDB_DATABASE").filter(|v| !v.is_empty()) {
            config.database.path = PathBuf::from(path);
        } else if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            config.database.path = database_path_from_url(&url)?;
        }

        if let Some(level) = lookup("ACCOUNTDB_LOG").filter(|v| !v.is_empty()) {
            config.log.level = level;
        }

        Ok(())
    }

    /// Reject values the store cannot act on: a busy timeout SQLite cannot
    /// represent, and token lifetimes that are not positive or overflow.
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.database.busy_timeout_ms > i32::MAX as u64 {
            return Err(Error::Config(format!(
                "database.busy_timeout_ms must be at most {}, got {}",
                i32::MAX,
                config.database.busy_timeout_ms
            )));
        }

        let hours = config.verification.token_ttl_hours;
        if hours < 1 || TimeDelta::try_hours(hours).is_none() {
            return Err(Error::Config(format!(
                "verification.token_ttl_hours out of range: {hours}"
            )));
        }
        Ok(())
    }
}

/// Turn a `DATABASE_URL` into a file path. Accepts `sqlite://path`,
/// `sqlite:path` and bare paths.
pub fn database_path_from_url(url: &str) -> Result<PathBuf> {
    if let Some(rest) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    {
        if rest.is_empty() {
            return Err(Error::Config("DATABASE_URL has an empty path".into()));
        }
        return Ok(PathBuf::from(rest));
    }

    if url.contains("://") {
        let scheme = url.split("://").next().unwrap_or_default();
        return Err(Error::Config(format!(
            "unsupported database scheme: {scheme}"
        )));
    }

    Ok(PathBuf::from(url))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_yaml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accountdb.yml");
        std::fs::write(
            &path,
            "database:\n  path: /var/lib/app/users.db\nmigrations:\n  allow_revert: false\n",
        )
        .unwrap();

        let config = ConfigLoader::from_file(&path).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/app/users.db"));
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(!config.migrations.allow_revert);
        assert_eq!(config.verification.token_ttl_hours, 24);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accountdb.toml");
        std::fs::write(&path, "[log]\nlevel = \"debug\"\njson = true\n").unwrap();

        let config = ConfigLoader::from_file(&path).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accountdb.ini");
        std::fs::write(&path, "x=1").unwrap();

        let err = ConfigLoader::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }

    #[test]
    fn finds_default_file_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigLoader::find_default(dir.path()).is_none());

        std::fs::write(dir.path().join("accountdb.toml"), "").unwrap();
        let found = ConfigLoader::find_default(dir.path()).unwrap();
        assert!(found.ends_with("accountdb.toml"));
    }

    #[test]
    fn explicit_database_env_wins_over_url() {
        let vars = env(&[
            ("ACCOUNTDB_DATABASE", "/tmp/explicit.db"),
            ("DATABASE_URL", "sqlite:///tmp/url.db"),
        ]);
        let mut config = AppConfig::default();
        ConfigLoader::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/explicit.db"));
    }

    #[test]
    fn database_url_is_stripped() {
        let vars = env(&[("DATABASE_URL", "sqlite:///tmp/url.db"), ("ACCOUNTDB_LOG", "warn")]);
        let mut config = AppConfig::default();
        ConfigLoader::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/url.db"));
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn defaults_pass_validation() {
        ConfigLoader::validate(&AppConfig::default()).unwrap();
    }

    #[test]
    fn token_ttl_must_be_positive_and_representable() {
        for hours in [0, -5, i64::MAX] {
            let mut config = AppConfig::default();
            config.verification.token_ttl_hours = hours;
            let err = ConfigLoader::validate(&config).unwrap_err();
            assert!(
                err.to_string().contains("token_ttl_hours out of range"),
                "{hours}: {err}"
            );
        }

        let mut config = AppConfig::default();
        config.verification.token_ttl_hours = 1;
        ConfigLoader::validate(&config).unwrap();
    }

    #[test]
    fn busy_timeout_must_fit_sqlite() {
        let mut config = AppConfig::default();
        config.database.busy_timeout_ms = i32::MAX as u64;
        ConfigLoader::validate(&config).unwrap();

        config.database.busy_timeout_ms = u64::from(u32::MAX);
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_validates_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accountdb.toml");
        std::fs::write(&path, "[verification]\ntoken_ttl_hours = -5\n").unwrap();

        let err = ConfigLoader::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("token_ttl_hours out of range: -5"));
    }

    #[test]
    fn database_url_parsing() {
        assert_eq!(
            database_path_from_url("sqlite:users.db").unwrap(),
            PathBuf::from("users.db")
        );
        assert_eq!(
            database_path_from_url("./users.db").unwrap(),
            PathBuf::from("./users.db")
        );
        assert!(database_path_from_url("sqlite://").is_err());

        let err = database_path_from_url("postgresql://u:p@host/db").unwrap_err();
        assert!(err.to_string().contains("unsupported database scheme: postgresql"));
    }
}
