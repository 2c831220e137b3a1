//! The chat command parser.
//!
//! A message body beginning with the configured sigil is parsed into a
//! dispatch record equivalent to an RPC call. All argument validation
//! lives here — handlers can assume well-formed params.

use base64::Engine as _;
use serde_json::{json, Value};
use thiserror::Error;

/// Maximum attached-config content after decoding, bytes.
pub const MAX_CONFIG_CONTENT: usize = 1_048_576;

/// A parsed command, ready for the RPC dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// RPC method name.
    pub method: String,
    /// RPC params object.
    pub params: Value,
}

/// Parser failures, surfaced to the originating room as usage errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The body does not start with the sigil.
    #[error("not a command")]
    NotACommand,

    /// Unknown command word.
    #[error("unknown command: {0}")]
    Unknown(String),

    /// Wrong arguments for a known command.
    #[error("usage: {0}")]
    Usage(&'static str),

    /// A config name failed path validation.
    #[error("invalid config name: {0}")]
    BadConfigName(String),

    /// Config content is too large or failed to decode.
    #[error("invalid config content: {0}")]
    BadConfigContent(String),
}

/// Validate an attached-config file name.
///
/// Rejects traversal (`..`), absolute paths, and backslashes. The name
/// becomes a file under `<runtime-dir>/configs/` and must never be able
/// to escape it.
///
/// # Errors
///
/// [`CommandError::BadConfigName`] with the reason.
pub fn validate_config_name(name: &str) -> Result<(), CommandError> {
    if name.is_empty() || name.len() > 255 {
        return Err(CommandError::BadConfigName(
            "name must be 1-255 characters".to_owned(),
        ));
    }
    if name.contains("..") {
        return Err(CommandError::BadConfigName(format!(
            "path traversal rejected in {name:?}"
        )));
    }
    if name.starts_with('/') {
        return Err(CommandError::BadConfigName(format!(
            "absolute paths rejected: {name:?}"
        )));
    }
    if name.contains('\\') {
        return Err(CommandError::BadConfigName(format!(
            "backslashes rejected in {name:?}"
        )));
    }
    if name.contains('/') {
        return Err(CommandError::BadConfigName(format!(
            "subdirectories rejected in {name:?}"
        )));
    }
    if name.starts_with('.') {
        return Err(CommandError::BadConfigName(format!(
            "hidden files rejected: {name:?}"
        )));
    }
    Ok(())
}

/// Decode attach-config content per the encoding token and enforce the cap.
///
/// # Errors
///
/// [`CommandError::BadConfigContent`] on bad base64 or oversize content.
pub fn decode_config_content(content: &str, encoding: &str) -> Result<Vec<u8>, CommandError> {
    let bytes = match encoding {
        "raw" => content.as_bytes().to_vec(),
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(content.trim())
            .map_err(|e| CommandError::BadConfigContent(format!("base64: {e}")))?,
        other => {
            return Err(CommandError::BadConfigContent(format!(
                "unknown encoding {other:?} (expected raw or base64)"
            )));
        },
    };
    if bytes.len() > MAX_CONFIG_CONTENT {
        return Err(CommandError::BadConfigContent(format!(
            "{} bytes exceeds the {MAX_CONFIG_CONTENT} byte cap",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Parse a chat message body into a dispatch record.
///
/// # Errors
///
/// [`CommandError::NotACommand`] when the sigil is absent; usage and
/// validation failures otherwise.
pub fn parse(body: &str, sigil: &str) -> Result<ParsedCommand, CommandError> {
    let rest = body.strip_prefix(sigil).ok_or(CommandError::NotACommand)?;
    let mut tokens = rest.split_whitespace();
    let command = tokens.next().ok_or(CommandError::NotACommand)?;
    let args: Vec<&str> = tokens.collect();

    match command {
        "status" => no_args("status", &args, "/status"),
        "health" => no_args("bridge.health", &args, "/health"),
        "keys" => no_args("list_keys", &args, "/keys"),
        "budget" => no_args("budget_status", &args, "/budget"),
        "errors" => no_args("get_errors", &args, "/errors"),
        "configs" => no_args("list_configs", &args, "/configs"),

        "start" => match args.as_slice() {
            [key_id] => Ok(ParsedCommand {
                method: "start".to_owned(),
                params: json!({"key_id": key_id}),
            }),
            [key_id, image] => Ok(ParsedCommand {
                method: "start".to_owned(),
                params: json!({"key_id": key_id, "image": image}),
            }),
            _ => Err(CommandError::Usage("/start <key_id> [image]")),
        },

        "stop" => match args.as_slice() {
            [container_id] => Ok(ParsedCommand {
                method: "stop".to_owned(),
                params: json!({"container_id": container_id, "reason": "chat_command"}),
            }),
            _ => Err(CommandError::Usage("/stop <container_id>")),
        },

        "store_key" => match args.as_slice() {
            [id, provider, token] => Ok(ParsedCommand {
                method: "store_key".to_owned(),
                params: json!({"id": id, "provider": provider, "token": token}),
            }),
            _ => Err(CommandError::Usage("/store_key <id> <provider> <token>")),
        },

        "delete_key" => match args.as_slice() {
            [id] => Ok(ParsedCommand {
                method: "delete_key".to_owned(),
                params: json!({"id": id}),
            }),
            _ => Err(CommandError::Usage("/delete_key <id>")),
        },

        "attach_config" => {
            // /attach_config <name> [base64] <content...>
            let (name, encoding, content) = match args.as_slice() {
                [name, "base64", rest @ ..] if !rest.is_empty() => {
                    (*name, "base64", rest.join(" "))
                },
                [name, rest @ ..] if !rest.is_empty() => (*name, "raw", rest.join(" ")),
                _ => return Err(CommandError::Usage("/attach_config <name> [base64] <content>")),
            };
            validate_config_name(name)?;
            // Decode once here to fail fast; the handler decodes again
            // from the params it receives.
            decode_config_content(&content, encoding)?;
            Ok(ParsedCommand {
                method: "attach_config".to_owned(),
                params: json!({"name": name, "content": content, "encoding": encoding}),
            })
        },

        other => Err(CommandError::Unknown(other.to_owned())),
    }
}

fn no_args(method: &str, args: &[&str], usage: &'static str) -> Result<ParsedCommand, CommandError> {
    if args.is_empty() {
        Ok(ParsedCommand {
            method: method.to_owned(),
            params: json!({}),
        })
    } else {
        Err(CommandError::Usage(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_a_command() {
        assert!(matches!(parse("hello", "/"), Err(CommandError::NotACommand)));
        assert!(matches!(parse("", "/"), Err(CommandError::NotACommand)));
    }

    #[test]
    fn test_status_and_friends() {
        assert_eq!(parse("/status", "/").unwrap().method, "status");
        assert_eq!(parse("/keys", "/").unwrap().method, "list_keys");
        assert_eq!(parse("/budget", "/").unwrap().method, "budget_status");
    }

    #[test]
    fn test_custom_sigil() {
        assert_eq!(parse("!status", "!").unwrap().method, "status");
        assert!(matches!(parse("/status", "!"), Err(CommandError::NotACommand)));
    }

    #[test]
    fn test_start_with_args() {
        let cmd = parse("/start k1", "/").unwrap();
        assert_eq!(cmd.method, "start");
        assert_eq!(cmd.params["key_id"], "k1");

        let cmd = parse("/start k1 custom:image", "/").unwrap();
        assert_eq!(cmd.params["image"], "custom:image");

        assert!(matches!(parse("/start", "/"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(parse("/frobnicate", "/"), Err(CommandError::Unknown(_))));
    }

    #[test]
    fn test_config_name_traversal_rejected() {
        let err = validate_config_name("../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("traversal"));

        assert!(validate_config_name("/etc/passwd").is_err());
        assert!(validate_config_name("a\\b").is_err());
        assert!(validate_config_name("sub/dir.toml").is_err());
        assert!(validate_config_name(".hidden").is_err());
        assert!(validate_config_name("").is_err());

        validate_config_name("agent-config.toml").unwrap();
    }

    #[test]
    fn test_config_content_cap() {
        let big = "x".repeat(MAX_CONFIG_CONTENT + 1);
        assert!(decode_config_content(&big, "raw").is_err());

        let fine = "x".repeat(1000);
        assert_eq!(decode_config_content(&fine, "raw").unwrap().len(), 1000);
    }

    #[test]
    fn test_config_content_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("key = 1\n");
        let decoded = decode_config_content(&encoded, "base64").unwrap();
        assert_eq!(decoded, b"key = 1\n");

        assert!(decode_config_content("!!!not-base64!!!", "base64").is_err());
        assert!(decode_config_content("x", "hex").is_err());
    }

    #[test]
    fn test_attach_config_command() {
        let cmd = parse("/attach_config app.toml key = 1", "/").unwrap();
        assert_eq!(cmd.method, "attach_config");
        assert_eq!(cmd.params["name"], "app.toml");
        assert_eq!(cmd.params["encoding"], "raw");
        assert_eq!(cmd.params["content"], "key = 1");

        let cmd = parse("/attach_config app.toml base64 a2V5ID0gMQo=", "/").unwrap();
        assert_eq!(cmd.params["encoding"], "base64");
    }

    #[test]
    fn test_attach_config_traversal_via_chat() {
        let err = parse("/attach_config ../../etc/passwd x", "/").unwrap_err();
        assert!(matches!(err, CommandError::BadConfigName(_)));
    }
}
