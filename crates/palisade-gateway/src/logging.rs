//! Logging setup from the `[logging]` config section.

use palisade_config::LoggingSection;
use tracing_subscriber::EnvFilter;

/// Errors from logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log file could not be opened.
    #[error("log file {path}: {source}")]
    File {
        /// Configured file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A subscriber was already installed.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Install the global tracing subscriber per the config.
///
/// `RUST_LOG` still wins over the configured level when set, which keeps
/// per-crate directives available for debugging.
///
/// # Errors
///
/// [`LoggingError`] when the file sink cannot be opened or a subscriber
/// is already installed.
pub fn setup_logging(config: &LoggingSection) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (config.output.as_str(), config.format.as_str()) {
        ("file", format) => {
            let path = config
                .file
                .clone()
                .unwrap_or_else(|| "/var/log/palisade.log".into());
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| LoggingError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            let builder = builder.with_writer(file).with_ansi(false);
            if format == "json" {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        },
        ("stdout", "json") => builder.with_writer(std::io::stdout).json().try_init(),
        ("stdout", _) => builder.with_writer(std::io::stdout).try_init(),
        (_, "json") => builder.with_writer(std::io::stderr).json().try_init(),
        _ => builder.with_writer(std::io::stderr).try_init(),
    };

    result.map_err(|_| LoggingError::AlreadyInitialized)
}
