//! Environment tools: inspect, list, pin and re-pick the active environment.

use serde_json::{Value, json};

use super::{
    ToolDefinition, ToolError, ToolRouter, arg_bool, arg_optional_string, handler, required_string,
};

const CAPABILITY: &str = "env";

pub fn register(router: &mut ToolRouter) {
    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "env_current",
            description: "Report the active environment id. Set resolve=true to trigger selection when none is cached.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resolve": { "type": "boolean", "default": false }
                }
            }),
        },
        handler(|ctx, args| async move {
            let resolve = arg_bool(&args, "resolve", false)?;
            let env_id = if resolve {
                Some(ctx.resolver.get_id(None).await?)
            } else {
                ctx.resolver.get_cached_id().or_else(|| ctx.resolver.mirror().get())
            };
            Ok(json!({
                "envId": env_id,
                "resolving": ctx.resolver.is_resolving(),
                "configured": ctx.config.env_id,
            }))
        }),
    );

    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "env_list",
            description: "List environments the configured account can access.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        handler(|ctx, _args| async move {
            let envs = ctx.environment_source().list_environments().await?;
            Ok(json!({
                "envs": envs,
                "current": ctx.resolver.get_cached_id(),
            }))
        }),
    );

    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "env_set",
            description: "Pin the active environment id without asking the user.",
            input_schema: json!({
                "type": "object",
                "required": ["envId"],
                "properties": {
                    "envId": { "type": "string" }
                }
            }),
        },
        handler(|ctx, args| async move {
            let env_id = required_string(&args, "envId")?.trim().to_string();
            let previous = ctx.resolver.get_cached_id();
            ctx.resolver.set_id(env_id.clone());
            Ok(json!({ "envId": env_id, "previous": previous }))
        }),
    );

    router.add(
        CAPABILITY,
        ToolDefinition {
            name: "env_switch",
            description: "Forget the cached environment and ask the user to pick again. Pass envId to switch directly.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "envId": { "type": "string" }
                }
            }),
        },
        handler(|ctx, args| async move {
            let previous = ctx.resolver.get_cached_id();
            if let Some(env_id) = arg_optional_string(&args, "envId")? {
                ctx.resolver.set_id(env_id.trim());
                return Ok(switched(ctx.resolver.get_cached_id(), previous));
            }
            ctx.resolver.reset();
            let env_id = ctx.resolver.get_id(None).await.map_err(ToolError::from)?;
            Ok(switched(Some(env_id), previous))
        }),
    );
}

fn switched(env_id: Option<String>, previous: Option<String>) -> Value {
    json!({
        "envId": env_id,
        "previous": previous,
        "changed": env_id != previous,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, json};

    use super::*;
    use crate::context::Context;

    fn env_router() -> ToolRouter {
        let mut router = ToolRouter::new();
        register(&mut router);
        router
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn set_then_current_reports_pinned_env() {
        let router = env_router();
        let ctx = Arc::new(Context::for_tests());

        let set = router.handler("env_set").unwrap()(ctx.clone(), args(json!({ "envId": " prod-1 " })))
            .await
            .unwrap();
        assert_eq!(set["envId"], "prod-1");
        assert_eq!(set["previous"], Value::Null);

        let current = router.handler("env_current").unwrap()(ctx, Map::new())
            .await
            .unwrap();
        assert_eq!(current["envId"], "prod-1");
        assert_eq!(current["resolving"], false);
    }

    #[tokio::test]
    async fn switch_with_explicit_env_skips_selection() {
        let router = env_router();
        let ctx = Arc::new(Context::for_tests());
        ctx.resolver.set_id("dev-1");

        let out = router.handler("env_switch").unwrap()(ctx.clone(), args(json!({ "envId": "prod-2" })))
            .await
            .unwrap();
        assert_eq!(out["envId"], "prod-2");
        assert_eq!(out["previous"], "dev-1");
        assert_eq!(out["changed"], true);
        assert!(ctx.coordinator.pending_session_id().is_none());
    }

    #[tokio::test]
    async fn env_set_requires_env_id() {
        let router = env_router();
        let ctx = Arc::new(Context::for_tests());
        let err = router.handler("env_set").unwrap()(ctx, Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("envId"));
    }

    #[tokio::test]
    async fn env_list_surfaces_platform_failures() {
        let router = env_router();
        let ctx = Arc::new(Context::for_tests());
        let err = router.handler("env_list").unwrap()(ctx, Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "platform_unreachable");
    }
}
