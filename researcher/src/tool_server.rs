//! Stdio tool server exposing a single `research_topic` tool.
//!
//! Speaks newline-delimited JSON-RPC 2.0 in the Model Context Protocol shape
//! that editor and desktop hosts expect when they spawn a tool process.
//! Stdout carries protocol messages only; logs go to stderr.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::assistant::graph::ResearchService;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "Deep Researcher";
pub const TOOL_NAME: &str = "research_topic";

#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-RPC failures reported back to the client.
#[derive(Debug, Clone, PartialEq)]
enum RpcFailure {
    Parse(String),
    InvalidRequest(String),
    MethodNotFound(String),
    InvalidParams(String),
}

impl RpcFailure {
    fn code(&self) -> i64 {
        match self {
            RpcFailure::Parse(_) => -32700,
            RpcFailure::InvalidRequest(_) => -32600,
            RpcFailure::MethodNotFound(_) => -32601,
            RpcFailure::InvalidParams(_) => -32602,
        }
    }

    fn message(&self) -> String {
        match self {
            RpcFailure::Parse(m) => format!("Parse error: {m}"),
            RpcFailure::InvalidRequest(m) => format!("Invalid request: {m}"),
            RpcFailure::MethodNotFound(m) => format!("Method not found: {m}"),
            RpcFailure::InvalidParams(m) => format!("Invalid params: {m}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, failure: RpcFailure) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: failure.code(),
                message: failure.message(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub struct ToolServer {
    service: Arc<dyn ResearchService>,
}

impl ToolServer {
    pub fn new(service: Arc<dyn ResearchService>) -> Self {
        Self { service }
    }

    /// Serve requests until the reader reaches EOF. Requests are handled one
    /// at a time, in arrival order.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), ToolServerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(server = SERVER_NAME, "Tool server listening on stdio");
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("Client closed the connection");
                break;
            }
            let message = line.trim();
            if message.is_empty() {
                continue;
            }
            if let Some(response) = self.handle_message(message).await {
                let encoded = serde_json::to_string(&response)?;
                writer.write_all(encoded.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Returns `None` for notifications, which get no reply.
    async fn handle_message(&self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparseable message");
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    RpcFailure::Parse(e.to_string()),
                ));
            }
        };

        let id = match request.id {
            Some(id) => id,
            None => {
                debug!(method = %request.method, "Ignoring notification");
                return None;
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(
                id,
                RpcFailure::InvalidRequest("jsonrpc must be \"2.0\"".into()),
            ));
        }

        debug!(method = %request.method, "Handling request");
        let outcome = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [tool_definition()] })),
            "tools/call" => self.call_tool(request.params).await,
            other => Err(RpcFailure::MethodNotFound(other.to_string())),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(failure) => JsonRpcResponse::failure(id, failure),
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcFailure> {
        let params: CallParams = params
            .ok_or_else(|| RpcFailure::InvalidParams("missing params".into()))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| RpcFailure::InvalidParams(e.to_string()))
            })?;

        if params.name != TOOL_NAME {
            return Err(RpcFailure::InvalidParams(format!("unknown tool: {}", params.name)));
        }
        let topic = params
            .arguments
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcFailure::InvalidParams("arguments.topic must be a string".into()))?;

        if let Err(e) = self.service.check_credentials() {
            return Ok(tool_text(format!("Error: {}", e.user_message()), true));
        }

        info!(topic, "research_topic called");
        Ok(match self.service.research(topic, None).await {
            Ok(report) => tool_text(report.render(), false),
            Err(e) => tool_text(format!("Research failed: {}", e.user_message()), true),
        })
    }
}

fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Performs deep internet research on a specific topic using AI agents and returns a cited report.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "The subject to research (e.g., \"Latest trends in AI 2025\")"
                }
            },
            "required": ["topic"]
        }
    })
}

fn tool_text(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::error::PipelineError;
    use crate::assistant::state::{ResearchReport, StatusUpdate, Topic};
    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt, BufReader};
    use tokio::sync::broadcast::Sender;

    struct FakeService {
        configured: bool,
        fail: bool,
    }

    #[async_trait]
    impl ResearchService for FakeService {
        fn check_credentials(&self) -> Result<(), PipelineError> {
            if self.configured {
                Ok(())
            } else {
                Err(PipelineError::missing_credential("LINKUP_API_KEY"))
            }
        }

        async fn research(
            &self,
            topic: &str,
            _status_tx: Option<&Sender<StatusUpdate>>,
        ) -> Result<ResearchReport, PipelineError> {
            if self.fail {
                return Err(PipelineError::writing(
                    crate::assistant::error::AgentError::Unreachable("down".into()),
                ));
            }
            Ok(ResearchReport {
                topic: Topic::parse(topic)?,
                body: "Findings.".into(),
                sources: Vec::new(),
                queries: vec![topic.to_string()],
                low_confidence: false,
            })
        }
    }

    fn server(configured: bool, fail: bool) -> ToolServer {
        ToolServer::new(Arc::new(FakeService { configured, fail }))
    }

    async fn call(server: &ToolServer, message: Value) -> Value {
        let response = server.handle_message(&message.to_string()).await.unwrap();
        serde_json::to_value(response).unwrap()
    }

    fn call_request(topic: &str) -> Value {
        json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": { "name": "research_topic", "arguments": { "topic": topic } }
        })
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let s = server(true, false);
        let init = call(
            &s,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["result"]["serverInfo"]["name"], SERVER_NAME);

        let list = call(&s, json!({"jsonrpc": "2.0", "id": "two", "method": "tools/list"})).await;
        assert_eq!(list["id"], "two");
        assert_eq!(list["result"]["tools"][0]["name"], TOOL_NAME);
        assert_eq!(list["result"]["tools"][0]["inputSchema"]["required"][0], "topic");
    }

    #[tokio::test]
    async fn test_call_returns_report_text() {
        let resp = call(&server(true, false), call_request("Latest trends in AI 2025")).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"]["isError"], false);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("## Latest trends in AI 2025"));
    }

    #[tokio::test]
    async fn test_call_without_credential() {
        let resp = call(&server(false, false), call_request("anything")).await;
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "Error: LINKUP_API_KEY not found in environment variables."
        );
    }

    #[tokio::test]
    async fn test_call_failure_is_reported_as_text() {
        let resp = call(&server(true, true), call_request("anything")).await;
        assert_eq!(resp["result"]["isError"], true);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Research failed: "));
        assert!(!text.contains("down"));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let s = server(true, false);
        let parse = serde_json::to_value(s.handle_message("{not json").await.unwrap()).unwrap();
        assert_eq!(parse["error"]["code"], -32700);
        assert_eq!(parse["id"], Value::Null);

        let unknown =
            call(&s, json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"})).await;
        assert_eq!(unknown["error"]["code"], -32601);

        let bad_args = call(
            &s,
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                   "params": {"name": "research_topic", "arguments": {"topic": 42}}}),
        )
        .await;
        assert_eq!(bad_args["error"]["code"], -32602);

        let bad_tool = call(
            &s,
            json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": {"name": "other"}}),
        )
        .await;
        assert_eq!(bad_tool["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let s = server(true, false);
        let reply = s
            .handle_message(r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#)
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_stream() {
        let s = server(true, false);
        let (client, server_io) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"research_topic","arguments":{"topic":"rust"}}}"#,
            "\n"
        );
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        s.serve(BufReader::new(server_read), server_write).await.unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["result"]["isError"], false);
    }
}
