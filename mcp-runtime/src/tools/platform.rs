//! Domain pass-through tools. Each enabled domain gets one `{domain}_request`
//! tool that forwards to `/v1/envs/{envId}/{domain}{path}` on the platform API.

use reqwest::Method;
use serde_json::{Value, json};

use super::{ToolArgs, ToolDefinition, ToolError, ToolRouter, arg_optional_string, handler, required_string};
use crate::platform::PlatformError;
use cloudkit_core::error::codes;

/// A platform domain exposed as a single request tool.
pub struct DomainTool {
    pub capability: &'static str,
    pub tool_name: &'static str,
    pub description: &'static str,
}

pub const DATABASE: DomainTool = DomainTool {
    capability: "database",
    tool_name: "database_request",
    description: "Call the database API of the active environment (collections, documents, queries).",
};

pub const STORAGE: DomainTool = DomainTool {
    capability: "storage",
    tool_name: "storage_request",
    description: "Call the object storage API of the active environment (upload URLs, listings, deletes).",
};

pub const FUNCTIONS: DomainTool = DomainTool {
    capability: "functions",
    tool_name: "functions_request",
    description: "Call the cloud functions API of the active environment (deploy, invoke, inspect).",
};

pub const HOSTING: DomainTool = DomainTool {
    capability: "hosting",
    tool_name: "hosting_request",
    description: "Call the static hosting API of the active environment.",
};

pub const LOGS: DomainTool = DomainTool {
    capability: "logs",
    tool_name: "logs_request",
    description: "Query runtime logs of the active environment.",
};

pub fn register(router: &mut ToolRouter, domain: &'static DomainTool) {
    let capability = domain.capability;
    router.add(
        capability,
        ToolDefinition {
            name: domain.tool_name,
            description: domain.description,
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "envId": { "type": "string", "description": "Overrides the active environment for this call." },
                    "method": { "type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"], "default": "GET" },
                    "path": { "type": "string", "description": format!("Path below /{capability}, e.g. /items") },
                    "query": {
                        "description": "Object map or [{key,value}] array",
                        "oneOf": [{ "type": "object" }, { "type": "array" }]
                    },
                    "body": {}
                }
            }),
        },
        handler(move |ctx, args| async move {
            let method = match arg_optional_string(&args, "method")? {
                Some(raw) => parse_http_method(&raw)?,
                None => Method::GET,
            };
            let sub_path = normalize_domain_path(&required_string(&args, "path")?)?;
            let query = parse_query_pairs(args.get("query"))?;
            let body = request_body(&args, &method);

            let explicit = arg_optional_string(&args, "envId")?;
            let env_id = ctx.resolver.get_id(explicit.as_deref()).await?;
            let path = format!("/v1/envs/{env_id}/{capability}{sub_path}");

            let result = ctx.platform.request(method.clone(), &path, &query, body).await?;
            if result.status == 401 {
                return Err(PlatformError::Unauthenticated(
                    "the platform rejected the configured credentials".to_string(),
                )
                .into());
            }
            let mut out = result.to_value();
            out["envId"] = Value::String(env_id);
            out["request"] = json!({ "method": method.as_str(), "path": path });
            Ok(out)
        }),
    );
}

fn request_body(args: &ToolArgs, method: &Method) -> Option<Value> {
    if matches!(*method, Method::GET | Method::HEAD) {
        return None;
    }
    args.get("body").filter(|value| !value.is_null()).cloned()
}

fn parse_http_method(raw: &str) -> Result<Method, ToolError> {
    match raw.trim().to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        _ => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Unsupported HTTP method '{raw}'"),
        )
        .with_field("method")),
    }
}

/// Relative path below the domain root. Full URLs and `..` segments are refused.
fn normalize_domain_path(raw: &str) -> Result<String, ToolError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ToolError::new(
            codes::VALIDATION_FAILED,
            "Pass the path below the domain (e.g. /items), not a full URL",
        )
        .with_field("path"));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(
            ToolError::new(codes::VALIDATION_FAILED, "'..' is not allowed in path")
                .with_field("path"),
        );
    }
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

fn parse_query_pairs(query_value: Option<&Value>) -> Result<Vec<(String, String)>, ToolError> {
    let Some(query_value) = query_value else {
        return Ok(Vec::new());
    };

    match query_value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => {
            let mut out = Vec::with_capacity(map.len());
            for (k, v) in map {
                if v.is_null() {
                    continue;
                }
                out.push((k.clone(), scalar_to_string(v, "query")?));
            }
            Ok(out)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let obj = item.as_object().ok_or_else(|| {
                    ToolError::new(
                        codes::VALIDATION_FAILED,
                        format!("query[{index}] must be an object with key/value"),
                    )
                    .with_field("query")
                })?;
                let key = obj
                    .get("key")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| {
                        ToolError::new(
                            codes::VALIDATION_FAILED,
                            format!("query[{index}].key must be a non-empty string"),
                        )
                        .with_field("query")
                    })?;
                let value = obj.get("value").ok_or_else(|| {
                    ToolError::new(
                        codes::VALIDATION_FAILED,
                        format!("query[{index}].value is required"),
                    )
                    .with_field("query")
                })?;
                out.push((key.to_string(), scalar_to_string(value, "query")?));
            }
            Ok(out)
        }
        _ => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            "'query' must be an object map or [{key,value}] array",
        )
        .with_field("query")),
    }
}

fn scalar_to_string(value: &Value, field: &str) -> Result<String, ToolError> {
    match value {
        Value::String(v) => Ok(v.clone()),
        Value::Number(v) => Ok(v.to_string()),
        Value::Bool(v) => Ok(v.to_string()),
        _ => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{field}' values must be scalar (string/number/bool)"),
        )
        .with_field(field)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, json};

    use super::*;
    use crate::context::Context;

    #[test]
    fn domain_paths_are_normalized_and_confined() {
        assert_eq!(normalize_domain_path("items/").unwrap(), "/items");
        assert_eq!(normalize_domain_path(" /items/42 ").unwrap(), "/items/42");
        assert_eq!(normalize_domain_path("/").unwrap(), "");
        assert!(normalize_domain_path("/../../admin").is_err());
        assert!(normalize_domain_path("https://api.example.com/x").is_err());
    }

    #[test]
    fn query_accepts_map_and_pair_list() {
        let pairs = parse_query_pairs(Some(&json!({ "limit": 10, "skip": null, "desc": true }))).unwrap();
        assert!(pairs.contains(&("limit".to_string(), "10".to_string())));
        assert!(pairs.contains(&("desc".to_string(), "true".to_string())));
        assert_eq!(pairs.len(), 2);

        let pairs = parse_query_pairs(Some(&json!([{ "key": "tag", "value": "a" }, { "key": "tag", "value": "b" }]))).unwrap();
        assert_eq!(pairs.len(), 2);

        let err = parse_query_pairs(Some(&json!({ "nested": { "x": 1 } }))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("query"));
    }

    #[test]
    fn get_requests_drop_the_body() {
        let mut args = Map::new();
        args.insert("body".to_string(), json!({ "x": 1 }));
        assert!(request_body(&args, &Method::GET).is_none());
        assert_eq!(request_body(&args, &Method::POST), Some(json!({ "x": 1 })));
    }

    #[tokio::test]
    async fn validation_happens_before_env_resolution() {
        let mut router = ToolRouter::new();
        register(&mut router, &DATABASE);
        let ctx = Arc::new(Context::for_tests());

        let mut args = Map::new();
        args.insert("path".to_string(), json!("/items"));
        args.insert("method".to_string(), json!("TRACE"));
        let err = router.handler("database_request").unwrap()(ctx.clone(), args)
            .await
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("method"));
        assert!(ctx.coordinator.pending_session_id().is_none());
        assert!(!ctx.resolver.is_resolving());
    }

    #[tokio::test]
    async fn explicit_env_id_routes_to_the_domain_path() {
        let mut router = ToolRouter::new();
        register(&mut router, &STORAGE);
        let ctx = Arc::new(Context::for_tests());

        let mut args = Map::new();
        args.insert("envId".to_string(), json!("prod-2"));
        args.insert("path".to_string(), json!("objects"));
        // The test platform is unreachable, so the call fails at transport level.
        let err = router.handler("storage_request").unwrap()(ctx.clone(), args)
            .await
            .unwrap_err();
        assert_eq!(err.code, "platform_unreachable");
        assert!(ctx.coordinator.pending_session_id().is_none());
    }
}
