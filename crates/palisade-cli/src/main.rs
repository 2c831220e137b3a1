//! The `palisade` binary: run the daemon, or talk to it over the socket.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::{Parser, Subcommand};
use palisade_config::{load, CliOverrides};

mod client;

#[derive(Debug, Parser)]
#[command(name = "palisade", version, about = "Local security bridge for AI agent containers")]
struct Cli {
    /// Config file path (default: /etc/palisade/config.toml).
    #[arg(long, env = "PALISADE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// RPC socket path override.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level override (debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bridge daemon (foreground; use a supervisor for daemon mode).
    Daemon,

    /// Bridge status summary.
    Status,
    /// Bridge health, including engine and chat channel reachability.
    Health,

    /// Store a credential.
    StoreKey {
        /// Credential id.
        id: String,
        /// Provider tag (openai, anthropic, openrouter, google, xai, custom).
        provider: String,
        /// The secret token.
        token: String,
        /// Display label.
        #[arg(long)]
        display_name: Option<String>,
        /// Overwrite an existing credential with the same id.
        #[arg(long)]
        replace: bool,
    },
    /// List credential metadata.
    ListKeys,
    /// Delete a credential.
    DeleteKey {
        /// Credential id.
        id: String,
    },
    /// Check that a credential exists, is unexpired, and decrypts.
    ValidateKey {
        /// Credential id.
        id: String,
    },

    /// Start a container bound to a credential.
    Start {
        /// Credential id.
        key_id: String,
        /// Image override.
        #[arg(long)]
        image: Option<String>,
    },
    /// Stop a container.
    Stop {
        /// Internal container id.
        container_id: String,
        /// Stop reason recorded in the audit log.
        #[arg(long, default_value = "cli")]
        reason: String,
    },

    /// Query stored error reports.
    Errors {
        /// Filter by code (e.g. CTX-001).
        #[arg(long)]
        code: Option<String>,
        /// Only unresolved reports.
        #[arg(long)]
        unresolved: bool,
    },
    /// Budget counters for the global scope or one credential.
    Budget {
        /// Credential id (omit for the global scope).
        #[arg(long)]
        key_id: Option<String>,
    },
}

fn main() -> ProcessExitCode {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        socket_path: cli.socket.clone(),
        log_level: cli.log_level.clone(),
        daemonize: None,
    };
    let config = match load(cli.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("palisade: invalid configuration: {e}");
            return ProcessExitCode::from(2);
        },
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("palisade: failed to start runtime: {e}");
            return ProcessExitCode::from(1);
        },
    };

    match cli.command {
        Command::Daemon => {
            if let Err(e) = palisade_gateway::logging::setup_logging(&config.logging) {
                eprintln!("palisade: logging setup failed: {e}");
                return ProcessExitCode::from(1);
            }
            let exit = runtime.block_on(palisade_gateway::run_daemon(config));
            let code = u8::try_from(exit.code()).unwrap_or(1);
            ProcessExitCode::from(code)
        },
        command => {
            let request = client_request(command);
            match runtime.block_on(client::call(&config.server.socket_path, &request.0, request.1)) {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
                    ProcessExitCode::SUCCESS
                },
                Err(e) => {
                    eprintln!("palisade: {e}");
                    ProcessExitCode::from(1)
                },
            }
        },
    }
}

/// Map a client subcommand to its RPC method and params.
fn client_request(command: Command) -> (String, serde_json::Value) {
    use serde_json::json;
    match command {
        Command::Daemon => unreachable!("handled by main"),
        Command::Status => ("status".to_owned(), json!({})),
        Command::Health => ("bridge.health".to_owned(), json!({})),
        Command::StoreKey {
            id,
            provider,
            token,
            display_name,
            replace,
        } => (
            "store_key".to_owned(),
            json!({
                "id": id,
                "provider": provider,
                "token": token,
                "display_name": display_name,
                "replace": replace,
            }),
        ),
        Command::ListKeys => ("list_keys".to_owned(), json!({})),
        Command::DeleteKey { id } => ("delete_key".to_owned(), json!({"id": id})),
        Command::ValidateKey { id } => ("validate_key".to_owned(), json!({"id": id})),
        Command::Start { key_id, image } => (
            "start".to_owned(),
            json!({"key_id": key_id, "image": image}),
        ),
        Command::Stop { container_id, reason } => (
            "stop".to_owned(),
            json!({"container_id": container_id, "reason": reason}),
        ),
        Command::Errors { code, unresolved } => {
            let mut params = json!({});
            if let Some(code) = code {
                params["code"] = json!(code);
            }
            if unresolved {
                params["resolved"] = json!(false);
            }
            ("get_errors".to_owned(), params)
        },
        Command::Budget { key_id } => ("budget_status".to_owned(), json!({"key_id": key_id})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_client_request_mapping() {
        let (method, params) = client_request(Command::Start {
            key_id: "k1".to_owned(),
            image: None,
        });
        assert_eq!(method, "start");
        assert_eq!(params["key_id"], "k1");

        let (method, params) = client_request(Command::Errors {
            code: Some("CTX-001".to_owned()),
            unresolved: true,
        });
        assert_eq!(method, "get_errors");
        assert_eq!(params["code"], "CTX-001");
        assert_eq!(params["resolved"], false);
    }
}
