//! Configuration validation.
//!
//! Enumerated values are closed sets; the validator rejects anything
//! outside them rather than falling back to a default.

use palisade_core::Provider;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];
const LOG_OUTPUTS: [&str; 3] = ["stdout", "stderr", "file"];

/// Validate a fully-merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    // Logging enums.
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::invalid(
            "logging.level",
            format!("{:?} is not one of {LOG_LEVELS:?}", config.logging.level),
        ));
    }
    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::invalid(
            "logging.format",
            format!("{:?} is not one of {LOG_FORMATS:?}", config.logging.format),
        ));
    }
    if !LOG_OUTPUTS.contains(&config.logging.output.as_str()) {
        return Err(ConfigError::invalid(
            "logging.output",
            format!("{:?} is not one of {LOG_OUTPUTS:?}", config.logging.output),
        ));
    }
    if config.logging.output == "file" && config.logging.file.is_none() {
        return Err(ConfigError::invalid(
            "logging.file",
            "required when logging.output is \"file\"",
        ));
    }

    // Budget.
    if !(config.budget.alert_threshold > 0.0 && config.budget.alert_threshold <= 1.0) {
        return Err(ConfigError::invalid(
            "budget.alert_threshold",
            "must be within (0, 1]",
        ));
    }
    if config.budget.daily_limit_usd < 0.0 || config.budget.monthly_limit_usd < 0.0 {
        return Err(ConfigError::invalid("budget", "limits must be non-negative"));
    }
    for (provider, cost) in &config.budget.provider_costs {
        if provider.parse::<Provider>().is_err() {
            return Err(ConfigError::invalid(
                "budget.provider_costs",
                format!("unknown provider tag {provider:?}"),
            ));
        }
        if !(cost.is_finite() && *cost >= 0.0) {
            return Err(ConfigError::invalid(
                "budget.provider_costs",
                format!("cost for {provider:?} must be a non-negative number"),
            ));
        }
    }

    // Matrix.
    if config.matrix.enabled {
        if config.matrix.homeserver_url.is_empty() {
            return Err(ConfigError::invalid(
                "matrix.homeserver_url",
                "required when matrix.enabled is true",
            ));
        }
        if !(config.matrix.homeserver_url.starts_with("https://")
            || config.matrix.homeserver_url.starts_with("http://"))
        {
            return Err(ConfigError::invalid(
                "matrix.homeserver_url",
                "must be an http(s) URL",
            ));
        }
        if config.matrix.username.is_empty() {
            return Err(ConfigError::invalid(
                "matrix.username",
                "required when matrix.enabled is true",
            ));
        }
        if config.matrix.sync_interval == 0 {
            return Err(ConfigError::invalid("matrix.sync_interval", "must be positive"));
        }
        if config.matrix.command_sigil.is_empty() {
            return Err(ConfigError::invalid("matrix.command_sigil", "must not be empty"));
        }
    }

    // TTL.
    if config.ttl.check_interval == 0 {
        return Err(ConfigError::invalid("ttl.check_interval", "must be positive"));
    }
    if config.ttl.idle_timeout == 0 {
        return Err(ConfigError::invalid("ttl.idle_timeout", "must be positive"));
    }

    // Event bus.
    if config.eventbus.websocket_enabled {
        if config.eventbus.websocket_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "eventbus.websocket_addr",
                format!("{:?} is not a host:port address", config.eventbus.websocket_addr),
            ));
        }
        if !config.eventbus.websocket_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "eventbus.websocket_path",
                "must start with '/'",
            ));
        }
        if config.eventbus.max_subscribers == 0 {
            return Err(ConfigError::invalid("eventbus.max_subscribers", "must be positive"));
        }
    }

    // Container.
    if config.container.max_containers == 0 {
        return Err(ConfigError::invalid("container.max_containers", "must be positive"));
    }
    if config.container.image.is_empty() {
        return Err(ConfigError::invalid("container.image", "must not be empty"));
    }
    if !config.container.bind_path.is_absolute() {
        return Err(ConfigError::invalid(
            "container.bind_path",
            "must be an absolute in-container path",
        ));
    }

    // Server.
    if config.server.shutdown_timeout == 0 {
        return Err(ConfigError::invalid("server.shutdown_timeout", "must be positive"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_owned();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_file_output_requires_path() {
        let mut config = Config::default();
        config.logging.output = "file".to_owned();
        assert!(validate(&config).is_err());

        config.logging.file = Some("/var/log/palisade.log".into());
        validate(&config).unwrap();
    }

    #[test]
    fn test_matrix_enabled_requires_homeserver() {
        let mut config = Config::default();
        config.matrix.enabled = true;
        assert!(validate(&config).is_err());

        config.matrix.homeserver_url = "https://matrix.example.org".to_owned();
        config.matrix.username = "bridge".to_owned();
        validate(&config).unwrap();
    }

    #[test]
    fn test_unknown_provider_cost_rejected() {
        let mut config = Config::default();
        config.budget.provider_costs.insert("aws".to_owned(), 0.1);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("provider"));
    }

    #[test]
    fn test_alert_threshold_bounds() {
        let mut config = Config::default();
        config.budget.alert_threshold = 0.0;
        assert!(validate(&config).is_err());
        config.budget.alert_threshold = 1.5;
        assert!(validate(&config).is_err());
        config.budget.alert_threshold = 1.0;
        validate(&config).unwrap();
    }

    #[test]
    fn test_bad_websocket_addr_rejected() {
        let mut config = Config::default();
        config.eventbus.websocket_enabled = true;
        config.eventbus.websocket_addr = "not-an-addr".to_owned();
        assert!(validate(&config).is_err());

        config.eventbus.websocket_addr = "127.0.0.1:8799".to_owned();
        validate(&config).unwrap();
    }
}
