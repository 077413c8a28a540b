//! Minimal stdio MCP server used for local testing of the bridge.
//!
//! Tools:
//! - `echo`: returns its arguments; `delay_ms` delays the reply
//! - `sleep`: waits `ms` milliseconds before replying
//! - `stderr`: writes `message` to stderr
//! - `exit`: terminates the process with `code` without replying
//!
//! Flags: `--name <name>` sets the reported server name,
//! `--hang-on-initialize` never answers `initialize`.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const PROTOCOL_VERSION: &str = "2024-11-05";

struct Options {
    name: String,
    hang_on_initialize: bool,
}

fn parse_args() -> Options {
    let mut options = Options {
        name: "echo-tool".to_string(),
        hang_on_initialize: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--name" => {
                if let Some(name) = args.next() {
                    options.name = name;
                }
            }
            "--hang-on-initialize" => options.hang_on_initialize = true,
            other => eprintln!("[WARN] ignoring unknown argument {other}"),
        }
    }
    options
}

#[tokio::main]
async fn main() {
    let options = parse_args();
    eprintln!("[INFO] {} ready on stdio", options.name);

    let (tx, mut rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                let reply = error_reply(Value::Null, -32700, &format!("Parse error: {e}"));
                let _ = tx.send(reply.to_string()).await;
                continue;
            }
        };

        let tx = tx.clone();
        let name = options.name.clone();
        let hang = options.hang_on_initialize;
        tokio::spawn(async move {
            if let Some(reply) = handle(&name, hang, message).await {
                let _ = tx.send(reply.to_string()).await;
            }
        });
    }

    eprintln!("[INFO] stdin closed, exiting");
    drop(tx);
    let _ = writer.await;
}

async fn handle(name: &str, hang_on_initialize: bool, message: Value) -> Option<Value> {
    let method = message.get("method").and_then(Value::as_str)?.to_string();
    // Notifications get no reply.
    let id = message.get("id").cloned()?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let result = match method.as_str() {
        "initialize" => {
            if hang_on_initialize {
                eprintln!("[WARN] not answering initialize");
                return None;
            }
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": name, "version": env!("CARGO_PKG_VERSION") },
            })
        }
        "ping" => json!({}),
        "tools/list" => json!({ "tools": tool_list() }),
        "tools/call" => return call_tool(id, &params).await,
        other => return Some(error_reply(id, -32601, &format!("Method not found: {other}"))),
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn call_tool(id: Value, params: &Value) -> Option<Value> {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match tool {
        "echo" => {
            if let Some(ms) = arguments.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Some(text_reply(id, arguments.to_string(), Some(arguments)))
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(1_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Some(text_reply(id, format!("slept {ms}ms"), None))
        }
        "stderr" => {
            let message = arguments.get("message").and_then(Value::as_str).unwrap_or("diagnostic");
            eprintln!("{message}");
            Some(text_reply(id, "written".to_string(), None))
        }
        "exit" => {
            let code = arguments.get("code").and_then(Value::as_i64).unwrap_or(1);
            eprintln!("[ERROR] exiting with code {code} on request");
            std::process::exit(code as i32);
        }
        other => Some(error_reply(id, -32602, &format!("Unknown tool: {other}"))),
    }
}

fn tool_list() -> Value {
    json!([
        { "name": "echo", "description": "Return the arguments", "inputSchema": { "type": "object" } },
        { "name": "sleep", "description": "Wait before replying", "inputSchema": { "type": "object" } },
        { "name": "stderr", "description": "Write a line to stderr", "inputSchema": { "type": "object" } },
        { "name": "exit", "description": "Terminate the process", "inputSchema": { "type": "object" } },
    ])
}

fn text_reply(id: Value, text: String, echo: Option<Value>) -> Value {
    let mut result = json!({ "content": [{ "type": "text", "text": text }] });
    if let Some(echo) = echo {
        result["echo"] = echo;
    }
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
