//! Environment id resolution with a shared cache and single-flight fetches.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cloudkit_core::{ErrorContext, ResolveError};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::interactive::SessionCoordinator;
use crate::platform::EnvironmentSource;

type InFlight = Shared<BoxFuture<'static, Result<String, ResolveError>>>;

/// Process-wide copy of the resolved id, readable without awaiting.
///
/// The resolver is its only writer; other components read it for fast checks.
#[derive(Clone, Debug, Default)]
pub struct IdentifierMirror {
    value: Arc<RwLock<Option<String>>>,
}

impl IdentifierMirror {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            value: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, value: Option<String>) {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

/// Produces an environment id when nothing is cached.
#[async_trait]
pub trait IdentifierFetcher: Send + Sync {
    async fn fetch(&self) -> Result<String, ResolveError>;
}

#[derive(Default)]
struct CachedIdentifier {
    value: Option<String>,
    in_flight: Option<InFlight>,
    generation: u64,
}

struct ResolverInner {
    state: Mutex<CachedIdentifier>,
    mirror: IdentifierMirror,
    fetcher: Arc<dyn IdentifierFetcher>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct EnvironmentResolver {
    inner: Arc<ResolverInner>,
}

impl EnvironmentResolver {
    pub fn new(
        fetcher: Arc<dyn IdentifierFetcher>,
        mirror: IdentifierMirror,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                state: Mutex::new(CachedIdentifier::default()),
                mirror,
                fetcher,
                timeout,
            }),
        }
    }

    pub fn mirror(&self) -> &IdentifierMirror {
        &self.inner.mirror
    }

    /// Resolve the id: explicit override, then cache, then an in-flight
    /// fetch, then a new fetch. Concurrent callers share one fetch.
    pub async fn get_id(&self, explicit: Option<&str>) -> Result<String, ResolveError> {
        if let Some(explicit) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
            return Ok(explicit.to_string());
        }

        let fetch = {
            let mut state = self.lock();
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            match &state.in_flight {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let fetch = self.spawn_fetch(state.generation);
                    state.in_flight = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    pub fn set_id(&self, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.lock();
        state.generation += 1;
        state.in_flight = None;
        state.value = Some(value.clone());
        self.inner.mirror.set(Some(value));
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.in_flight = None;
        state.value = None;
        self.inner.mirror.set(None);
    }

    /// Cached value only; never starts a fetch.
    pub fn get_cached_id(&self) -> Option<String> {
        self.lock().value.clone()
    }

    pub fn is_resolving(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// The fetch runs as its own task, so the timeout, the cache write and
    /// the end of the interaction happen even when every waiter has gone away.
    fn spawn_fetch(&self, generation: u64) -> InFlight {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let outcome = match inner.mirror.get() {
                Some(value) => Ok(value),
                None => match tokio::time::timeout(inner.timeout, inner.fetcher.fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(ResolveError::Timeout(inner.timeout)),
                },
            };

            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation == generation {
                state.in_flight = None;
                match &outcome {
                    Ok(value) => {
                        state.value = Some(value.clone());
                        inner.mirror.set(Some(value.clone()));
                        tracing::info!(env_id = %value, "environment id resolved");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "environment id resolution failed");
                    }
                }
            } else {
                tracing::debug!("discarding stale environment fetch result");
            }
            outcome
        });

        task.map(|joined| {
            joined.unwrap_or_else(|err| {
                Err(ResolveError::Fetch(format!("environment fetch task failed: {err}")))
            })
        })
        .boxed()
        .shared()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CachedIdentifier> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Production fetcher: list environments and let the human pick one.
pub struct InteractiveEnvFetcher {
    coordinator: SessionCoordinator,
    source: Arc<dyn EnvironmentSource>,
    auto_select_single: bool,
}

impl InteractiveEnvFetcher {
    pub fn new(
        coordinator: SessionCoordinator,
        source: Arc<dyn EnvironmentSource>,
        auto_select_single: bool,
    ) -> Self {
        Self {
            coordinator,
            source,
            auto_select_single,
        }
    }
}

#[async_trait]
impl IdentifierFetcher for InteractiveEnvFetcher {
    async fn fetch(&self) -> Result<String, ResolveError> {
        let (candidates, error_context) = match self.source.list_environments().await {
            Ok(candidates) => (candidates, None),
            Err(err) => {
                tracing::warn!(error = %err, "listing environments failed; showing setup page");
                (
                    Vec::new(),
                    Some(ErrorContext {
                        code: "env_list_failed".to_string(),
                        message: err.to_string(),
                        help_url: None,
                    }),
                )
            }
        };

        if self.auto_select_single && error_context.is_none() && candidates.len() == 1 {
            let only = candidates[0].env_id.clone();
            tracing::info!(env_id = %only, "single environment available; selecting it");
            return Ok(only);
        }

        let account = self.source.account_info().await.unwrap_or_default();
        let result = self
            .coordinator
            .collect_environment_selection(
                candidates,
                account,
                error_context,
                Some(self.source.clone()),
            )
            .await
            .map_err(|err| ResolveError::Fetch(err.to_string()))?;

        if result.switch_requested {
            return Err(ResolveError::Fetch(
                "account switch requested; re-authenticate and retry".to_string(),
            ));
        }
        if result.cancelled {
            return Err(ResolveError::Fetch(
                "environment selection was cancelled or timed out".to_string(),
            ));
        }
        result
            .env_id()
            .map(str::to_string)
            .ok_or_else(|| ResolveError::Fetch("selection did not include an envId".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cloudkit_core::EnvCandidate;
    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::config::InteractiveConfig;
    use crate::interactive::delivery::Delivery;
    use crate::platform::PlatformError;

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        outcome: Result<String, ResolveError>,
    }

    impl CountingFetcher {
        fn new(outcome: Result<String, ResolveError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                outcome,
            })
        }
    }

    #[async_trait]
    impl IdentifierFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<String, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    struct NeverFetcher;

    #[async_trait]
    impl IdentifierFetcher for NeverFetcher {
        async fn fetch(&self) -> Result<String, ResolveError> {
            futures::future::pending().await
        }
    }

    fn resolver_with(fetcher: Arc<dyn IdentifierFetcher>) -> EnvironmentResolver {
        EnvironmentResolver::new(fetcher, IdentifierMirror::default(), Duration::from_secs(600))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let fetcher = CountingFetcher::new(Ok("env-42".to_string()));
        let resolver = resolver_with(fetcher.clone());

        let results = join_all((0..16).map(|_| {
            let resolver = resolver.clone();
            async move { resolver.get_id(None).await }
        }))
        .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Ok("env-42")));
        assert_eq!(resolver.get_cached_id().as_deref(), Some("env-42"));
        assert_eq!(resolver.mirror().get().as_deref(), Some("env-42"));
        assert!(!resolver.is_resolving());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_error() {
        let fetcher = CountingFetcher::new(Err(ResolveError::Fetch("no envs".to_string())));
        let resolver = resolver_with(fetcher.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.get_id(None).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(
                task.await.unwrap(),
                Err(ResolveError::Fetch("no envs".to_string()))
            );
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.get_cached_id(), None);

        // A later call starts a fresh fetch.
        let _ = resolver.get_id(None).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_reaches_every_waiter_and_clears_marker() {
        let resolver = resolver_with(Arc::new(NeverFetcher));
        let results = join_all((0..3).map(|_| {
            let resolver = resolver.clone();
            async move { resolver.get_id(None).await }
        }))
        .await;

        for result in results {
            assert_eq!(result, Err(ResolveError::Timeout(Duration::from_secs(600))));
        }
        assert!(!resolver.is_resolving());
        assert_eq!(resolver.get_cached_id(), None);
    }

    #[tokio::test]
    async fn explicit_override_and_cache_skip_fetch() {
        let fetcher = CountingFetcher::new(Ok("fetched".to_string()));
        let resolver = resolver_with(fetcher.clone());

        assert_eq!(resolver.get_id(Some("explicit")).await.as_deref(), Ok("explicit"));
        resolver.set_id("cached");
        assert_eq!(resolver.get_id(None).await.as_deref(), Ok("cached"));
        assert_eq!(resolver.get_id(Some("explicit")).await.as_deref(), Ok("explicit"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mirror_value_short_circuits_the_fetcher() {
        let fetcher = CountingFetcher::new(Ok("fetched".to_string()));
        let resolver = EnvironmentResolver::new(
            fetcher.clone(),
            IdentifierMirror::new(Some("from-env".to_string())),
            Duration::from_secs(600),
        );
        assert_eq!(resolver.get_id(None).await.as_deref(), Ok("from-env"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.get_cached_id().as_deref(), Some("from-env"));
    }

    #[test]
    fn set_then_reset_clears_cache_and_mirror_together() {
        let resolver = resolver_with(Arc::new(NeverFetcher));
        resolver.set_id("env-1");
        assert_eq!(resolver.get_cached_id().as_deref(), Some("env-1"));
        assert_eq!(resolver.mirror().get().as_deref(), Some("env-1"));

        resolver.reset();
        assert_eq!(resolver.get_cached_id(), None);
        assert_eq!(resolver.mirror().get(), None);
    }

    #[tokio::test]
    async fn reset_during_fetch_discards_stale_result() {
        let fetcher = CountingFetcher::new(Ok("stale".to_string()));
        let resolver = resolver_with(fetcher.clone());

        let pending = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.get_id(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(resolver.is_resolving());
        resolver.reset();

        assert_eq!(pending.await.unwrap().as_deref(), Ok("stale"));
        assert_eq!(resolver.get_cached_id(), None);
        assert_eq!(resolver.mirror().get(), None);
    }

    struct StaticSource(Vec<EnvCandidate>);

    #[async_trait]
    impl EnvironmentSource for StaticSource {
        async fn list_environments(&self) -> Result<Vec<EnvCandidate>, PlatformError> {
            Ok(self.0.clone())
        }
    }

    fn env(env_id: &str) -> EnvCandidate {
        EnvCandidate {
            env_id: env_id.to_string(),
            alias: None,
            region: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn interactive_fetcher_auto_selects_single_environment() {
        let coordinator = SessionCoordinator::new(
            InteractiveConfig::ephemeral(),
            Delivery::with_launcher(|_| panic!("no page should open")),
        );
        let fetcher = InteractiveEnvFetcher::new(
            coordinator,
            Arc::new(StaticSource(vec![env("only-1")])),
            true,
        );
        assert_eq!(fetcher.fetch().await.as_deref(), Ok("only-1"));
    }

    #[tokio::test]
    async fn interactive_fetcher_returns_selected_environment() {
        let coordinator =
            SessionCoordinator::new(InteractiveConfig::ephemeral(), Delivery::with_launcher(|_| Ok(())));
        let fetcher = Arc::new(InteractiveEnvFetcher::new(
            coordinator.clone(),
            Arc::new(StaticSource(vec![env("dev-1"), env("prod-2")])),
            true,
        ));
        let resolver = resolver_with(fetcher);

        let waiting = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.get_id(None).await })
        };
        let mut session_id = None;
        for _ in 0..200 {
            session_id = coordinator
                .pending_session_id()
                .filter(|id| coordinator.sessions().contains(id));
            if session_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let session_id = session_id.expect("selection should be pending");
        assert!(coordinator.submit(None, json!({ "envId": "prod-2" }), Some(&session_id)));

        assert_eq!(waiting.await.unwrap().as_deref(), Ok("prod-2"));
        assert_eq!(resolver.mirror().get().as_deref(), Some("prod-2"));
    }

    #[tokio::test]
    async fn selection_completes_after_the_only_caller_is_gone() {
        let coordinator =
            SessionCoordinator::new(InteractiveConfig::ephemeral(), Delivery::with_launcher(|_| Ok(())));
        let fetcher = Arc::new(InteractiveEnvFetcher::new(
            coordinator.clone(),
            Arc::new(StaticSource(vec![env("a"), env("b")])),
            true,
        ));
        let resolver = resolver_with(fetcher);

        let caller = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.get_id(None).await })
        };
        let mut session_id = None;
        for _ in 0..200 {
            session_id = coordinator
                .pending_session_id()
                .filter(|id| coordinator.sessions().contains(id));
            if session_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let session_id = session_id.expect("selection should be pending");

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert!(resolver.is_resolving());

        assert!(coordinator.submit(None, json!({ "envId": "b" }), Some(&session_id)));
        for _ in 0..200 {
            if !resolver.is_resolving() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(resolver.get_cached_id().as_deref(), Some("b"));
        assert_eq!(resolver.mirror().get().as_deref(), Some("b"));
        for _ in 0..200 {
            if coordinator.port().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.port().await, None);
        assert_eq!(resolver.get_id(None).await.as_deref(), Ok("b"));
    }

    #[tokio::test]
    async fn cancelled_selection_is_a_fetch_error() {
        let coordinator =
            SessionCoordinator::new(InteractiveConfig::ephemeral(), Delivery::with_launcher(|_| Ok(())));
        let fetcher = InteractiveEnvFetcher::new(
            coordinator.clone(),
            Arc::new(StaticSource(Vec::new())),
            true,
        );
        let waiting = tokio::spawn(async move { fetcher.fetch().await });
        for _ in 0..200 {
            if coordinator
                .pending_session_id()
                .is_some_and(|id| coordinator.sessions().contains(&id))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(coordinator.cancel(None));
        assert!(matches!(waiting.await.unwrap(), Err(ResolveError::Fetch(_))));
    }
}
