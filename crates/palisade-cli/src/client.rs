//! One-shot JSON-RPC client over the bridge socket.

use std::path::Path;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one request and return its `result`.
///
/// # Errors
///
/// Connection failures, malformed responses, and RPC-level errors (the
/// error's code and message are surfaced verbatim).
pub async fn call(socket_path: &Path, method: &str, params: Value) -> anyhow::Result<Value> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {} (is the daemon running?)", socket_path.display()))?;

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    stream.write_all(request.to_string().as_bytes()).await?;
    stream.write_all(b"\n").await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        return Err(anyhow!("daemon closed the connection without answering"));
    }

    let response: Value = serde_json::from_str(&line).context("malformed response from daemon")?;
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let detail = error
            .get("data")
            .and_then(|d| d.get("code"))
            .and_then(Value::as_str)
            .map(|c| format!(" [{c}]"))
            .unwrap_or_default();
        return Err(anyhow!("rpc error {code}{detail}: {message}"));
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow!("response carries neither result nor error"))
}
