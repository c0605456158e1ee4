//! cloudkit MCP runtime: stdio JSON-RPC server, tool surface and the
//! interactive human-in-the-loop coordinator behind it.

pub mod capabilities;
pub mod config;
pub mod context;
pub mod interactive;
pub mod platform;
pub mod resolver;
pub mod tools;
mod util;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Args, Subcommand};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use capabilities::CapabilityRegistry;
use config::{
    DEFAULT_ENV_FETCH_TIMEOUT_SECS, DEFAULT_FALLBACK_PORTS, DEFAULT_INTERACTIVE_PORT,
    DEFAULT_NOTIFY_HOSTS, DEFAULT_NOTIFY_TIMEOUT_SECS, DEFAULT_SELECTION_TIMEOUT_SECS,
    DEFAULT_SESSION_TTL_SECS, InteractionTimeouts, InteractiveConfig, RuntimeConfig,
    candidate_ports, non_empty, parse_name_list,
};
use context::Context;
use interactive::delivery::Notifier;
use tools::{ToolError, ToolRouter, build_tool_call_response, to_pretty_json};
use util::{StoredCredentials, delete_credentials, resolve_token, save_credentials};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "cloudkit-mcp";

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the cloudkit MCP server over stdio
    Serve(McpServeArgs),
    /// Store an API key for later `serve` runs
    Login(LoginArgs),
    /// Remove stored credentials
    Logout,
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Disable auth header injection (useful behind auth proxies)
    #[arg(long)]
    pub no_auth: bool,
    /// Explicit bearer token override (otherwise CLOUDKIT_API_KEY or stored credentials)
    #[arg(long)]
    pub token: Option<String>,
    /// Environment id to use; skips interactive selection
    #[arg(long, env = "CLOUDKIT_ENV_ID")]
    pub env_id: Option<String>,
    /// Host integration tag of the client driving this server
    #[arg(long, env = "CLOUDKIT_HOST")]
    pub host: Option<String>,
    /// Host tags that receive push notifications instead of a browser window
    #[arg(long, env = "CLOUDKIT_NOTIFY_HOSTS", default_value = DEFAULT_NOTIFY_HOSTS)]
    pub notify_hosts: String,
    /// Capability allow-list (`all` for the whole catalog)
    #[arg(long, env = "CLOUDKIT_PLUGINS_ENABLED")]
    pub plugins_enabled: Option<String>,
    /// Capability deny-list; wins over the allow-list
    #[arg(long, env = "CLOUDKIT_PLUGINS_DISABLED")]
    pub plugins_disabled: Option<String>,
    /// Preferred port of the local interaction server (0 = ephemeral)
    #[arg(long, env = "CLOUDKIT_INTERACTIVE_PORT", default_value_t = DEFAULT_INTERACTIVE_PORT)]
    pub interactive_port: u16,
    #[arg(long, env = "CLOUDKIT_SELECTION_TIMEOUT_SECS", default_value_t = DEFAULT_SELECTION_TIMEOUT_SECS)]
    pub selection_timeout_secs: u64,
    #[arg(long, env = "CLOUDKIT_NOTIFY_TIMEOUT_SECS", default_value_t = DEFAULT_NOTIFY_TIMEOUT_SECS)]
    pub notify_timeout_secs: u64,
    #[arg(long, env = "CLOUDKIT_SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,
    #[arg(long, env = "CLOUDKIT_ENV_FETCH_TIMEOUT_SECS", default_value_t = DEFAULT_ENV_FETCH_TIMEOUT_SECS)]
    pub env_fetch_timeout_secs: u64,
    /// Pick the only available environment without asking
    #[arg(long, env = "CLOUDKIT_AUTO_SELECT_SINGLE_ENV", default_value_t = true, action = ArgAction::Set)]
    pub auto_select_single_env: bool,
}

impl McpServeArgs {
    pub fn to_config(&self, api_url: &str, inherited_no_auth: bool) -> RuntimeConfig {
        let defaults = InteractiveConfig::default();
        RuntimeConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            no_auth: inherited_no_auth || self.no_auth,
            explicit_token: non_empty(self.token.clone()),
            env_id: non_empty(self.env_id.clone()),
            host_integration: non_empty(self.host.clone()),
            notify_hosts: parse_name_list(&self.notify_hosts),
            plugins_enabled: non_empty(self.plugins_enabled.clone()),
            plugins_disabled: non_empty(self.plugins_disabled.clone()),
            env_fetch_timeout: Duration::from_secs(self.env_fetch_timeout_secs),
            auto_select_single_env: self.auto_select_single_env,
            interactive: InteractiveConfig {
                ports: candidate_ports(self.interactive_port, &DEFAULT_FALLBACK_PORTS),
                timeouts: InteractionTimeouts {
                    selection: Duration::from_secs(self.selection_timeout_secs),
                    notify: Duration::from_secs(self.notify_timeout_secs),
                },
                session_ttl: Duration::from_secs(self.session_ttl_secs),
                ..defaults
            },
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct LoginArgs {
    /// API key issued by the platform console
    #[arg(long, env = "CLOUDKIT_API_KEY")]
    pub api_key: String,
    /// Expire the stored key after this many days
    #[arg(long)]
    pub expires_in_days: Option<i64>,
}

pub async fn run(api_url: &str, inherited_no_auth: bool, command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let config = args.to_config(api_url, inherited_no_auth);
            match serve_stdio(config).await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, "mcp server stopped with an error");
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Login(args) => {
            let now = Utc::now();
            let creds = StoredCredentials {
                api_url: api_url.trim_end_matches('/').to_string(),
                api_key: args.api_key.trim().to_string(),
                saved_at: now,
                expires_at: args
                    .expires_in_days
                    .map(|days| now + chrono::Duration::days(days)),
            };
            if creds.api_key.is_empty() {
                eprintln!("{}", to_pretty_json(&json!({
                    "error": "validation_failed",
                    "message": "api key must not be empty",
                    "field": "api_key"
                })));
                return 1;
            }
            match save_credentials(&creds) {
                Ok(()) => {
                    println!("{}", to_pretty_json(&json!({ "status": "logged_in", "api_url": creds.api_url })));
                    0
                }
                Err(err) => {
                    eprintln!("{}", to_pretty_json(&json!({ "error": "credentials_write_failed", "message": err.to_string() })));
                    1
                }
            }
        }
        McpCommands::Logout => match delete_credentials() {
            Ok(removed) => {
                println!("{}", to_pretty_json(&json!({ "status": "logged_out", "removed": removed })));
                0
            }
            Err(err) => {
                eprintln!("{}", to_pretty_json(&json!({ "error": "credentials_delete_failed", "message": err.to_string() })));
                1
            }
        },
    }
}

fn startup_token(config: &RuntimeConfig) -> Option<String> {
    if config.no_auth {
        return None;
    }
    if let Some(token) = &config.explicit_token {
        return Some(token.clone());
    }
    match resolve_token(&config.api_url) {
        Ok(token) => Some(token),
        Err(err) => {
            // Interactive tools still work; platform calls will report unauthenticated.
            tracing::warn!(error = %err, "no platform credentials available");
            None
        }
    }
}

/// Serve MCP over stdin/stdout until the client closes stdin.
pub async fn serve_stdio(config: RuntimeConfig) -> Result<(), String> {
    let token = startup_token(&config);
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(Context::new(config, token, Notifier::new(tx.clone())));
    let server = McpServer::new(ctx);
    tracing::info!(
        server = MCP_SERVER_NAME,
        version = env!("CARGO_PKG_VERSION"),
        capabilities = ?server.capabilities(),
        tools = server.tools.len(),
        "mcp server ready"
    );
    server
        .serve(BufReader::new(io::stdin()), io::stdout(), tx, rx)
        .await
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

/// Cheap to clone; each request task gets its own handle.
#[derive(Clone)]
pub struct McpServer {
    ctx: Arc<Context>,
    tools: Arc<ToolRouter>,
    capabilities: Arc<Vec<&'static str>>,
}

impl McpServer {
    pub fn new(ctx: Arc<Context>) -> Self {
        let registry = CapabilityRegistry::from_lists(
            ctx.config.plugins_enabled.as_deref(),
            ctx.config.plugins_disabled.as_deref(),
        );
        let capabilities = registry.registered().to_vec();
        Self {
            ctx,
            tools: Arc::new(registry.into_router()),
            capabilities: Arc::new(capabilities),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn capabilities(&self) -> &[&'static str] {
        &self.capabilities
    }

    /// Read framed requests until EOF. Each request runs in its own task so a
    /// call waiting on the human never blocks the transport; all output goes
    /// through `outbound` to a single writer.
    pub async fn serve<R, W>(
        self,
        mut reader: R,
        writer: W,
        outbound: mpsc::UnboundedSender<Value>,
        outbound_rx: mpsc::UnboundedReceiver<Value>,
    ) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (stop_writer, writer_stopped) = oneshot::channel();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, writer_stopped));
        let mut requests = JoinSet::new();

        let read_result = loop {
            let frame = match read_framed_json(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(format!("Failed to read MCP message: {e}")),
            };
            let incoming = match frame {
                Frame::Message(value) => value,
                Frame::Malformed(reason) => {
                    let _ = outbound.send(error_response(Value::Null, RpcError::parse_error(reason)));
                    continue;
                }
            };

            let server = self.clone();
            let outbound = outbound.clone();
            requests.spawn(async move {
                for response in server.handle_incoming_message(incoming).await {
                    if outbound.send(response).is_err() {
                        break;
                    }
                }
            });
            while requests.try_join_next().is_some() {}
        };

        // Client is gone: release anyone waiting on the human, then the listener.
        if self.ctx.coordinator.cancel(None) {
            tracing::info!("client disconnected; pending interaction cancelled");
        }
        requests.abort_all();
        while requests.join_next().await.is_some() {}
        self.ctx.shutdown().await;

        let _ = stop_writer.send(());
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("Failed to write MCP response: {e}")),
            Err(e) => return Err(format!("MCP writer task failed: {e}")),
        }
        read_result
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Client response; this server issues no outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method);
            None
        }
    }

    fn handle_notification(&self, method: &str) {
        if !matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            tracing::debug!(method, "ignoring unknown notification");
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let instructions = "Domain tools act on the active environment. If none is configured, the first call opens an environment selection page for the user; call env_switch to pick another one later. Use interactive_clarify when a decision needs the user, and interactive_confirm before destructive operations.";
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                },
                "logging": {}
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions,
            "capabilityStatus": {
                "enabled": self.capabilities.as_slice(),
                "delivery": self.ctx.coordinator.delivery().mode(),
                "envConfigured": self.ctx.config.env_id.is_some()
            }
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .definitions()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let Some(handler) = self.tools.handler(name) else {
            let err = ToolError::new("unknown_tool", format!("Unknown tool '{name}'"))
                .with_field("name")
                .with_details(json!({ "available_tools": self.tools.names() }));
            return Ok(build_tool_call_response(name, Err(err)));
        };

        let result = handler(self.ctx.clone(), args).await;
        Ok(build_tool_call_response(name, result))
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

#[derive(Debug)]
enum Frame {
    Message(Value),
    /// Framing was intact but the body was not JSON; the stream stays usable.
    Malformed(String),
}

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<Frame>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" || line == "\n" {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(match serde_json::from_slice(&payload) {
        Ok(value) => Frame::Message(value),
        Err(e) => Frame::Malformed(format!("Invalid JSON payload: {e}")),
    }))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Sole owner of the output stream. Drains what is queued once told to stop.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Value>,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { return Ok(()) };
                write_framed_json(&mut writer, &message).await?;
            }
            _ = &mut stop => {
                while let Ok(message) = rx.try_recv() {
                    write_framed_json(&mut writer, &message).await?;
                }
                return Ok(());
            }
        }
    }
}
