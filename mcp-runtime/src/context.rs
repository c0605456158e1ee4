use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::interactive::SessionCoordinator;
use crate::interactive::delivery::{Delivery, Notifier};
use crate::platform::{EnvironmentSource, PlatformClient};
use crate::resolver::{EnvironmentResolver, IdentifierMirror, InteractiveEnvFetcher};

/// Shared collaborators, built once per server and handed to every tool call.
pub struct Context {
    pub config: RuntimeConfig,
    pub coordinator: SessionCoordinator,
    pub resolver: EnvironmentResolver,
    pub platform: Arc<PlatformClient>,
}

impl Context {
    /// Wire the production graph. Push delivery is chosen when the configured
    /// host integration is one of the notify hosts.
    pub fn new(config: RuntimeConfig, token: Option<String>, notifier: Notifier) -> Self {
        let delivery = if config.uses_push_notifications() {
            Delivery::push(notifier)
        } else {
            Delivery::browser()
        };
        tracing::debug!(
            delivery = delivery.mode(),
            host = config.host_integration.as_deref().unwrap_or("-"),
            "interactive delivery selected"
        );
        let coordinator = SessionCoordinator::new(config.interactive.clone(), delivery);
        let platform = Arc::new(PlatformClient::new(config.api_url.clone(), token));
        let source: Arc<dyn EnvironmentSource> = platform.clone();
        let fetcher = Arc::new(InteractiveEnvFetcher::new(
            coordinator.clone(),
            source,
            config.auto_select_single_env,
        ));
        let resolver = EnvironmentResolver::new(
            fetcher,
            IdentifierMirror::new(config.env_id.clone()),
            config.env_fetch_timeout,
        );
        Self::from_parts(config, coordinator, resolver, platform)
    }

    pub fn from_parts(
        config: RuntimeConfig,
        coordinator: SessionCoordinator,
        resolver: EnvironmentResolver,
        platform: Arc<PlatformClient>,
    ) -> Self {
        Self {
            config,
            coordinator,
            resolver,
            platform,
        }
    }

    pub fn environment_source(&self) -> Arc<dyn EnvironmentSource> {
        self.platform.clone()
    }

    /// Stop the interactive listener if it is still up.
    pub async fn shutdown(&self) {
        self.coordinator.stop().await;
    }

    /// Offline context: unreachable platform, no-op browser, ephemeral ports.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        use crate::config::InteractiveConfig;

        let config = RuntimeConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            interactive: InteractiveConfig::ephemeral(),
            ..RuntimeConfig::default()
        };
        let coordinator = SessionCoordinator::new(
            config.interactive.clone(),
            Delivery::with_launcher(|_| Ok(())),
        );
        let platform = Arc::new(PlatformClient::new(config.api_url.clone(), None));
        let fetcher = Arc::new(InteractiveEnvFetcher::new(
            coordinator.clone(),
            platform.clone(),
            config.auto_select_single_env,
        ));
        let resolver = EnvironmentResolver::new(
            fetcher,
            IdentifierMirror::default(),
            config.env_fetch_timeout,
        );
        Self::from_parts(config, coordinator, resolver, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_hosts_get_push_delivery() {
        let (notifier, _rx) = Notifier::channel();
        let config = RuntimeConfig {
            host_integration: Some("CodeBuddy".to_string()),
            ..RuntimeConfig::default()
        };
        let ctx = Context::new(config, None, notifier.clone());
        assert_eq!(ctx.coordinator.delivery().mode(), "push_notification");

        let ctx = Context::new(RuntimeConfig::default(), None, notifier);
        assert_eq!(ctx.coordinator.delivery().mode(), "browser");
    }

    #[test]
    fn configured_env_id_seeds_the_mirror() {
        let (notifier, _rx) = Notifier::channel();
        let config = RuntimeConfig {
            env_id: Some("env-from-config".to_string()),
            ..RuntimeConfig::default()
        };
        let ctx = Context::new(config, None, notifier);
        assert_eq!(ctx.resolver.mirror().get().as_deref(), Some("env-from-config"));
        assert_eq!(ctx.resolver.get_cached_id(), None);
    }
}
