//! Environment variable overrides.
//!
//! Applied after the file layer and before CLI flags. Only the documented
//! `PALISADE_*` variables are consulted; anything else in the environment
//! is ignored.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// The documented override variables.
pub(crate) const ENV_VARS: [&str; 8] = [
    "PALISADE_SOCKET",
    "PALISADE_PID_FILE",
    "PALISADE_KEYSTORE_DB",
    "PALISADE_MATRIX_ENABLED",
    "PALISADE_MATRIX_HOMESERVER",
    "PALISADE_LOG_LEVEL",
    "PALISADE_LOG_OUTPUT",
    "PALISADE_LOG_FILE",
];

/// Apply overrides from the process environment.
///
/// # Errors
///
/// Returns a validation error when a boolean variable holds something
/// other than `true`/`false`/`1`/`0`.
pub fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    let vars: HashMap<String, String> = ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| ((*name).to_owned(), v)))
        .collect();
    apply_from_map(config, &vars)
}

/// Testable core of [`apply_env_overrides`].
pub(crate) fn apply_from_map(
    config: &mut Config,
    vars: &HashMap<String, String>,
) -> ConfigResult<()> {
    if let Some(value) = vars.get("PALISADE_SOCKET") {
        config.server.socket_path = PathBuf::from(value);
    }
    if let Some(value) = vars.get("PALISADE_PID_FILE") {
        config.server.pid_file = PathBuf::from(value);
    }
    if let Some(value) = vars.get("PALISADE_KEYSTORE_DB") {
        config.keystore.db_path = PathBuf::from(value);
    }
    if let Some(value) = vars.get("PALISADE_MATRIX_ENABLED") {
        config.matrix.enabled = parse_bool("PALISADE_MATRIX_ENABLED", value)?;
    }
    if let Some(value) = vars.get("PALISADE_MATRIX_HOMESERVER") {
        config.matrix.homeserver_url = value.clone();
    }
    if let Some(value) = vars.get("PALISADE_LOG_LEVEL") {
        config.logging.level = value.clone();
    }
    if let Some(value) = vars.get("PALISADE_LOG_OUTPUT") {
        config.logging.output = value.clone();
    }
    if let Some(value) = vars.get("PALISADE_LOG_FILE") {
        config.logging.file = Some(PathBuf::from(value));
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> ConfigResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::invalid(
            name,
            format!("expected true/false/1/0, got {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_applied() {
        let mut config = Config::default();
        let vars = HashMap::from([
            ("PALISADE_SOCKET".to_owned(), "/tmp/p.sock".to_owned()),
            ("PALISADE_MATRIX_ENABLED".to_owned(), "true".to_owned()),
            ("PALISADE_LOG_LEVEL".to_owned(), "debug".to_owned()),
        ]);
        apply_from_map(&mut config, &vars).unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/p.sock"));
        assert!(config.matrix.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut config = Config::default();
        let vars = HashMap::from([("PALISADE_MATRIX_ENABLED".to_owned(), "yes".to_owned())]);
        let err = apply_from_map(&mut config, &vars).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_unset_vars_leave_defaults() {
        let mut config = Config::default();
        apply_from_map(&mut config, &HashMap::new()).unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/run/palisade/bridge.sock"));
    }
}
