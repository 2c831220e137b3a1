//! Config file loading with layered precedence.
//!
//! The load algorithm:
//! 1. Start from built-in defaults.
//! 2. Merge the config file, when one exists.
//! 3. Apply `PALISADE_*` environment variables.
//! 4. Apply CLI flag overrides.
//! 5. Validate.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate::validate;

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// The default config file location.
pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/palisade/config.toml";

/// Flag-level overrides, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `--socket`.
    pub socket_path: Option<PathBuf>,
    /// `--log-level`.
    pub log_level: Option<String>,
    /// `--daemonize`.
    pub daemonize: Option<bool>,
}

impl CliOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(socket_path) = &self.socket_path {
            config.server.socket_path = socket_path.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(daemonize) = self.daemonize {
            config.server.daemonize = daemonize;
        }
    }
}

/// Load the configuration with full precedence.
///
/// `config_path` of `None` means the default location; a missing file at
/// the default location is fine (defaults apply), but an explicitly given
/// path must exist.
///
/// # Errors
///
/// Returns a [`ConfigError`] when a file is unreadable or malformed, or
/// when the merged configuration fails validation.
pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> ConfigResult<Config> {
    let (path, required) = match config_path {
        Some(p) => (p.to_path_buf(), true),
        None => (discover_config_path(), false),
    };

    let mut config = match try_read(&path)? {
        Some(contents) => {
            let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.display().to_string(),
                source,
            })?;
            info!(path = %path.display(), "Loaded config file");
            config
        },
        None if required => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            });
        },
        None => {
            debug!(path = %path.display(), "No config file; using defaults");
            Config::default()
        },
    };

    apply_env_overrides(&mut config)?;
    overrides.apply(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Load a config from one file with no env or CLI layering (tooling).
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file is missing, malformed, or
/// invalid.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let contents = try_read(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::ParseError {
        path: path.display().to_string(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

/// The system location, falling back to the per-user config directory
/// when the system file does not exist (unprivileged development runs).
fn discover_config_path() -> PathBuf {
    let system = PathBuf::from(DEFAULT_CONFIG_PATH);
    if system.exists() {
        return system;
    }
    directories::ProjectDirs::from("", "", "palisade")
        .map_or(system, |dirs| dirs.config_dir().join("config.toml"))
}

/// Read a file in one operation, returning `None` when it does not exist.
///
/// The size cap is checked after the read so there is no stat/read race.
fn try_read(path: &Path) -> ConfigResult<Option<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source,
            });
        },
    };

    if contents.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::invalid(
            path.display().to_string(),
            format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                contents.len()
            ),
        ));
    }

    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_default_path_gives_defaults() {
        // The default path will not exist in the test environment.
        let config = load(None, &CliOverrides::default()).unwrap();
        assert_eq!(config.ttl.idle_timeout, 600);
    }

    #[test]
    fn test_load_explicit_missing_path_fails() {
        let err = load(
            Some(Path::new("/definitely/not/here.toml")),
            &CliOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n[server]\nsocket_path = \"/tmp/from-file.sock\"\n").unwrap();

        let overrides = CliOverrides {
            socket_path: Some("/tmp/from-cli.sock".into()),
            ..CliOverrides::default()
        };
        let config = load(Some(&path), &overrides).unwrap();

        // CLI wins over file; file wins over defaults.
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/from-cli.sock"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\n").unwrap();
        let err = load(Some(&path), &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_invalid_merged_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        let err = load(Some(&path), &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_oversize_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut contents = String::from("# padding\n");
        contents.push_str(&"#x\n".repeat(400_000));
        std::fs::write(&path, contents).unwrap();
        assert!(load_file(&path).is_err());
    }
}
