//! Tool surface: definitions, the router, argument helpers and the observing
//! wrapper every registered handler passes through.

pub mod env;
pub mod interactive;
pub mod platform;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use cloudkit_core::error::codes;
use cloudkit_core::{BindError, ResolveError};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};

use crate::context::Context;
use crate::platform::PlatformError;

pub type ToolArgs = Map<String, Value>;
pub type ToolFuture = BoxFuture<'static, Result<Value, ToolError>>;
pub type ToolHandler = Arc<dyn Fn(Arc<Context>, ToolArgs) -> ToolFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub docs_hint: Option<String>,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<BindError> for ToolError {
    fn from(err: BindError) -> Self {
        ToolError::new(codes::BIND_FAILED, err.to_string())
            .with_docs_hint(
                "Free one of the interactive ports or set CLOUDKIT_INTERACTIVE_PORT to an unused port.",
            )
            .with_details(json!({ "attempted_ports": err.attempted_ports() }))
    }
}

impl From<ResolveError> for ToolError {
    fn from(err: ResolveError) -> Self {
        ToolError::new(err.code(), err.to_string()).with_docs_hint(
            "Pass envId explicitly, set CLOUDKIT_ENV_ID, or call env_switch to pick an environment.",
        )
    }
}

impl From<PlatformError> for ToolError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Unauthenticated(message) => ToolError::new("unauthenticated", message)
                .with_docs_hint("Set CLOUDKIT_API_KEY or pass --token."),
            PlatformError::Status { status, body } => ToolError::new(
                "platform_error",
                format!("Platform returned HTTP {status}"),
            )
            .with_details(body),
            other => ToolError::new("platform_unreachable", other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

struct RegisteredTool {
    definition: ToolDefinition,
    capability: &'static str,
    handler: ToolHandler,
}

/// Name → handler table filled by capability registration.
#[derive(Default)]
pub struct ToolRouter {
    tools: BTreeMap<&'static str, RegisteredTool>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; its handler is wrapped with [`observe`].
    pub fn add(&mut self, capability: &'static str, definition: ToolDefinition, handler: ToolHandler) {
        let name = definition.name;
        if self.tools.contains_key(name) {
            tracing::debug!(tool = name, capability, "tool already registered; skipping");
            return;
        }
        let handler = observe(name, capability, handler);
        self.tools.insert(
            name,
            RegisteredTool {
                definition,
                capability,
                handler,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn capability_of(&self, name: &str) -> Option<&'static str> {
        self.tools.get(name).map(|tool| tool.capability)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values().map(|tool| &tool.definition)
    }

    pub fn handler(&self, name: &str) -> Option<ToolHandler> {
        self.tools.get(name).map(|tool| tool.handler.clone())
    }
}

/// Box an async fn into a [`ToolHandler`].
pub fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Arc<Context>, ToolArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(move |ctx: Arc<Context>, args: ToolArgs| -> ToolFuture { f(ctx, args).boxed() })
}

/// Cross-cutting wrapper: logs each call and its outcome, never alters it.
pub fn observe(tool: &'static str, capability: &'static str, inner: ToolHandler) -> ToolHandler {
    Arc::new(move |ctx: Arc<Context>, args: ToolArgs| -> ToolFuture {
        let inner = inner.clone();
        async move {
            let started = Instant::now();
            tracing::debug!(tool, capability, "tool call started");
            let result = inner(ctx, args).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => tracing::info!(tool, capability, elapsed_ms, "tool call succeeded"),
                Err(err) => tracing::warn!(
                    tool,
                    capability,
                    elapsed_ms,
                    error = %err.code,
                    message = %err.message,
                    "tool call failed"
                ),
            }
            result
        }
        .boxed()
    })
}

pub fn build_tool_call_response(tool_name: &str, result: Result<Value, ToolError>) -> Value {
    let (envelope, is_error) = match result {
        Ok(data) => (
            json!({
                "status": "complete",
                "tool": tool_name,
                "data": data
            }),
            false,
        ),
        Err(err) => (
            json!({
                "status": "error",
                "tool": tool_name,
                "error": err.to_value()
            }),
            true,
        ),
    };
    let text = to_pretty_json(&envelope);

    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

pub(crate) fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn required_string(args: &ToolArgs, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

pub fn arg_optional_string(args: &ToolArgs, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

pub fn arg_bool(args: &ToolArgs, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a boolean"))
                .with_field(key),
        ),
    }
}

pub fn arg_optional_string_array(args: &ToolArgs, key: &str) -> Result<Option<Vec<String>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value.as_array().ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{key}' must be an array of strings"),
        )
        .with_field(key)
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let text = item.as_str().ok_or_else(|| {
            ToolError::new(
                codes::VALIDATION_FAILED,
                format!("'{key}' items must be strings"),
            )
            .with_field(key)
        })?;
        let normalized = text.trim();
        if !normalized.is_empty() {
            out.push(normalized.to_string());
        }
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn echo_router() -> ToolRouter {
        let mut router = ToolRouter::new();
        router.add(
            "test",
            ToolDefinition {
                name: "echo",
                description: "Echo arguments back.",
                input_schema: json!({ "type": "object" }),
            },
            handler(|_ctx, args| async move { Ok(Value::Object(args)) }),
        );
        router.add(
            "test",
            ToolDefinition {
                name: "fail",
                description: "Always fails.",
                input_schema: json!({ "type": "object" }),
            },
            handler(|_ctx, _args| async move {
                Err(ToolError::new("boom", "exploded").with_field("x"))
            }),
        );
        router
    }

    #[tokio::test]
    async fn observe_passes_results_through_unchanged() {
        let router = echo_router();
        let ctx = Arc::new(Context::for_tests());

        let mut args = Map::new();
        args.insert("a".to_string(), json!(1));
        let ok = router.handler("echo").unwrap()(ctx.clone(), args.clone()).await;
        assert_eq!(ok.unwrap(), Value::Object(args));

        let err = router.handler("fail").unwrap()(ctx, Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "boom");
        assert_eq!(err.message, "exploded");
        assert_eq!(err.field.as_deref(), Some("x"));
    }

    #[test]
    fn duplicate_registration_keeps_the_first_tool() {
        let mut router = echo_router();
        router.add(
            "other",
            ToolDefinition {
                name: "echo",
                description: "Shadow.",
                input_schema: json!({}),
            },
            handler(|_ctx, _args| async move { Ok(Value::Null) }),
        );
        assert_eq!(router.len(), 2);
        assert_eq!(router.capability_of("echo"), Some("test"));
    }

    #[test]
    fn error_response_is_flagged() {
        let response = build_tool_call_response("fail", Err(ToolError::new("boom", "exploded")));
        assert_eq!(response["isError"], true);
        assert_eq!(response["structuredContent"]["error"]["error"], "boom");

        let response = build_tool_call_response("echo", Ok(json!({ "x": 1 })));
        assert!(response.get("isError").is_none());
        assert_eq!(response["structuredContent"]["data"]["x"], 1);
    }

    #[test]
    fn bind_error_becomes_tool_error_with_ports() {
        let err: ToolError = BindError {
            attempts: vec![cloudkit_core::BindAttempt {
                port: 3721,
                reason: "in use".to_string(),
            }],
        }
        .into();
        assert_eq!(err.code, codes::BIND_FAILED);
        assert_eq!(err.details.unwrap()["attempted_ports"], json!([3721]));
    }

    #[test]
    fn required_string_rejects_blank_values() {
        let mut args = Map::new();
        args.insert("message".to_string(), json!("  "));
        assert_eq!(required_string(&args, "message").unwrap_err().field.as_deref(), Some("message"));
        assert!(required_string(&Map::new(), "message").is_err());
        args.insert("options".to_string(), json!(["a", " ", "b"]));
        assert_eq!(
            arg_optional_string_array(&args, "options").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
