//! Palisade Config - configuration loading and validation.
//!
//! Precedence, lowest to highest: built-in defaults → config file →
//! `PALISADE_*` environment variables → CLI flags. Every section defaults
//! to safe production values so a bare `[section]` header in TOML produces
//! a working configuration.
//!
//! Secret-bearing fields (the chat account password) are excluded from
//! every serialized form of the configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod env;
mod error;
mod loader;
mod types;
mod validate;

pub use env::apply_env_overrides;
pub use error::{ConfigError, ConfigResult};
pub use loader::{CliOverrides, load, load_file};
pub use types::{
    BudgetSection, Config, ContainerSection, EventBusSection, KeystoreSection, LoggingSection,
    MatrixSection, RetrySection, ServerSection, TtlSection, ZeroTrustSection,
};
pub use validate::validate;
