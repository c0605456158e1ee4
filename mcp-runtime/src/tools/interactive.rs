//! Tools that put a question in front of the human and wait for the answer.

use cloudkit_core::InteractiveResult;
use serde_json::{Value, json};

use super::{
    ToolDefinition, ToolError, ToolRouter, arg_optional_string, arg_optional_string_array,
    handler, required_string,
};
use cloudkit_core::error::codes;

const CAPABILITY: &str = "interactive";

pub fn register(router: &mut ToolRouter) {
    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "interactive_clarify",
            description: "Ask the user a question on a local page and wait for the answer. Optional options render as choices.",
            input_schema: json!({
                "type": "object",
                "required": ["message"],
                "properties": {
                    "message": { "type": "string" },
                    "options": { "type": "array", "items": { "type": "string" } }
                }
            }),
        },
        handler(|ctx, args| async move {
            let message = required_string(&args, "message")?;
            let options = arg_optional_string_array(&args, "options")?.unwrap_or_default();
            let result = ctx
                .coordinator
                .request_clarification(message, options)
                .await?;
            Ok(answer_envelope(&result))
        }),
    );

    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "interactive_confirm",
            description: "Ask the user to approve a risky operation before it runs.",
            input_schema: json!({
                "type": "object",
                "required": ["message"],
                "properties": {
                    "message": { "type": "string" },
                    "risk": { "type": "string" },
                    "details": {}
                }
            }),
        },
        handler(|ctx, args| async move {
            let message = required_string(&args, "message")?;
            let risk = arg_optional_string(&args, "risk")?;
            let details = args.get("details").filter(|value| !value.is_null()).cloned();
            let result = ctx
                .coordinator
                .request_confirmation(message, risk, details)
                .await?;
            let mut envelope = answer_envelope(&result);
            envelope["confirmed"] = Value::Bool(is_confirmed(&result));
            Ok(envelope)
        }),
    );

    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "interactive_open_url",
            description: "Open an http(s) URL for the user through the configured delivery (browser or host notification).",
            input_schema: json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": { "type": "string" }
                }
            }),
        },
        handler(|ctx, args| async move {
            let raw = required_string(&args, "url")?;
            let parsed = url::Url::parse(raw.trim()).map_err(|e| {
                ToolError::new(codes::VALIDATION_FAILED, format!("Invalid url: {e}")).with_field("url")
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ToolError::new(
                    codes::VALIDATION_FAILED,
                    "Only http(s) URLs can be opened",
                )
                .with_field("url"));
            }
            let outcome = ctx.coordinator.open_url(parsed.as_str());
            Ok(json!({ "url": parsed.as_str(), "delivery": outcome.as_str() }))
        }),
    );
}

fn answer_envelope(result: &InteractiveResult) -> Value {
    json!({
        "type": result.kind.as_str(),
        "cancelled": result.cancelled,
        "answer": result.data,
    })
}

/// Pages post `true`, `"confirm"` or `{ "confirmed": true }`.
fn is_confirmed(result: &InteractiveResult) -> bool {
    if result.cancelled || result.switch_requested {
        return false;
    }
    match &result.data {
        Value::Bool(v) => *v,
        Value::String(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "confirm" | "confirmed" | "yes"),
        Value::Object(map) => map
            .get("confirmed")
            .and_then(Value::as_bool)
            .or_else(|| {
                map.get("choice")
                    .and_then(Value::as_str)
                    .map(|choice| choice.eq_ignore_ascii_case("confirm"))
            })
            .unwrap_or(false),
        _ => false,
    }
}
