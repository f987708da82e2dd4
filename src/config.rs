//! Migrator configuration
//!
//! Settings are read from the `[migration]` section of `config/config.toml`
//! (optional) and from `HARBORMASTER__MIGRATION__*` environment variables,
//! which take precedence:
//!
//! ```toml
//! [migration]
//! keyspace = "app"
//! replication_factor = 3
//! migrations_dir = "migrations"
//! ```

use crate::migration::source::DEFAULT_FILE_PATTERN;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "config/config.toml";
const ENV_PREFIX: &str = "HARBORMASTER";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigratorConfig {
    /// Keyspace holding the control tables and receiving the migrations
    pub keyspace: String,
    /// Replication factor if the keyspace has to be created (store default 1)
    #[serde(default)]
    pub replication_factor: Option<u32>,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    /// Regex matched against file names in `migrations_dir`
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_file_pattern() -> String {
    DEFAULT_FILE_PATTERN.to_string()
}

impl MigratorConfig {
    /// Configuration for `keyspace` with every other setting at its default
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            replication_factor: None,
            migrations_dir: default_migrations_dir(),
            file_pattern: default_file_pattern(),
        }
    }

    /// Load from `config/config.toml` if present, then the environment
    ///
    /// A config file that exists but cannot be parsed is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no usable `migration` section with a keyspace is found.
    pub fn load() -> Result<Self, ConfigError> {
        let file = File::with_name(DEFAULT_CONFIG_FILE).required(false);
        let settings = match with_env(Config::builder().add_source(file)) {
            Ok(settings) => settings,
            Err(err) => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    log::warn!(
                        "Failed to load {}, falling back to environment: {}",
                        DEFAULT_CONFIG_FILE,
                        err
                    );
                }
                with_env(Config::builder()).map_err(|env_err| {
                    ConfigError::Message(format!(
                        "Failed to load configuration from file and env: {}, then env-only error: {}",
                        err, env_err
                    ))
                })?
            }
        };
        section(&settings)
    }

    /// Load from the file at `path`, then the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing or malformed, or has no
    /// usable `migration` section.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::from(path.as_ref()).required(true);
        let settings = with_env(Config::builder().add_source(file))?;
        section(&settings)
    }
}

fn with_env(builder: ConfigBuilder<DefaultState>) -> Result<Config, ConfigError> {
    builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
}

fn section(settings: &Config) -> Result<MigratorConfig, ConfigError> {
    settings.get::<MigratorConfig>("migration").map_err(|e| {
        ConfigError::Message(format!(
            "Migration configuration could not be loaded from file or environment: {}",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbormaster.toml");
        fs::write(
            &path,
            r#"
[migration]
keyspace = "orders"
replication_factor = 3
migrations_dir = "db/cql"
file_pattern = "^\\d+_.*\\.cql$"
"#,
        )
        .unwrap();

        let config = MigratorConfig::load_from(&path).unwrap();
        assert_eq!(config.keyspace, "orders");
        assert_eq!(config.replication_factor, Some(3));
        assert_eq!(config.migrations_dir, PathBuf::from("db/cql"));
        assert_eq!(config.file_pattern, r"^\d+_.*\.cql$");
    }

    #[test]
    fn test_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbormaster.toml");
        fs::write(&path, "[migration]\nkeyspace = \"orders\"\n").unwrap();

        let config = MigratorConfig::load_from(&path).unwrap();
        assert_eq!(config, MigratorConfig::new("orders"));
    }

    #[test]
    fn test_missing_keyspace_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbormaster.toml");
        fs::write(&path, "[migration]\nreplication_factor = 2\n").unwrap();

        assert!(MigratorConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(MigratorConfig::load_from("/definitely/not/here.toml").is_err());
    }
}
