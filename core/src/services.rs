//! Service composition: one breaker plus retry policy per external dependency
//!
//! Every call runs as `breaker(retry(operation))`: each retried attempt sits
//! inside a single breaker call, and a fallback attached to the call is
//! handed to the breaker so an open circuit can still return a degraded
//! result.

use crate::{
    callbacks::StateChange,
    circuit::{
        BreakerConfig, CallCounters, CallOptions, CircuitState, FallbackContext, FallbackFn,
    },
    classifier::{IgnoreCancelled, RetryClassifier},
    config::ResilienceConfig,
    errors::{CircuitError, ConfigError, ServiceError},
    registry::{BreakerRegistry, RegistryConfig},
    retry::{RetryConfig, RetryPolicy},
    window::WindowCounts,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Key of the profile used for unregistered services
pub const DEFAULT_SERVICE_KEY: &str = "default";

/// Breaker and retry settings for one external dependency
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceProfile {
    pub key: String,
    pub name: String,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
}

impl ServiceProfile {
    /// Profile with default breaker and retry settings
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Profile used for service keys nobody registered
    pub fn fallback_default() -> Self {
        Self::new(DEFAULT_SERVICE_KEY, "Default")
    }

    /// Slow government registries: long timeouts, patient recovery
    pub fn government_registry(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name)
            .with_breaker(BreakerConfig {
                call_timeout: Duration::from_secs(45),
                error_threshold_percentage: 50.0,
                reset_timeout: Duration::from_secs(60),
                volume_threshold: 5,
                ..BreakerConfig::default()
            })
            .with_retry(RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                ..RetryConfig::default()
            })
    }

    /// Payment processors: trip early, retry sparingly
    pub fn payment(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name)
            .with_breaker(BreakerConfig {
                call_timeout: Duration::from_secs(15),
                error_threshold_percentage: 30.0,
                reset_timeout: Duration::from_secs(60),
                volume_threshold: 5,
                ..BreakerConfig::default()
            })
            .with_retry(RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                ..RetryConfig::default()
            })
    }

    /// AI providers: slow responses, frequent rate limiting
    pub fn ai_provider(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name)
            .with_breaker(BreakerConfig {
                call_timeout: Duration::from_secs(120),
                error_threshold_percentage: 60.0,
                reset_timeout: Duration::from_secs(30),
                volume_threshold: 3,
                ..BreakerConfig::default()
            })
            .with_retry(RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                ..RetryConfig::default()
            })
    }

    /// Messaging gateways (SMS, email, chat)
    pub fn messaging(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name)
            .with_breaker(BreakerConfig {
                call_timeout: Duration::from_secs(10),
                error_threshold_percentage: 50.0,
                reset_timeout: Duration::from_secs(30),
                volume_threshold: 10,
                ..BreakerConfig::default()
            })
            .with_retry(RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(15),
                ..RetryConfig::default()
            })
    }

    /// Outbound webhooks: tolerant threshold, many quick retries
    pub fn webhook(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name)
            .with_breaker(BreakerConfig {
                call_timeout: Duration::from_secs(10),
                error_threshold_percentage: 70.0,
                reset_timeout: Duration::from_secs(120),
                volume_threshold: 10,
                ..BreakerConfig::default()
            })
            .with_retry(RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(60),
                ..RetryConfig::default()
            })
    }
}

/// Per-call-site adjustments; set fields win over the profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceOverrides {
    pub call_timeout: Option<Duration>,
    pub error_threshold_percentage: Option<f64>,
    pub reset_timeout: Option<Duration>,
    pub volume_threshold: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub jitter: Option<bool>,
    pub attempt_timeout: Option<Duration>,
}

impl ServiceOverrides {
    fn apply(&self, profile: &ServiceProfile) -> (BreakerConfig, RetryConfig) {
        let mut breaker = profile.breaker.clone();
        let mut retry = profile.retry.clone();

        if let Some(timeout) = self.call_timeout {
            breaker.call_timeout = timeout;
        }
        if let Some(threshold) = self.error_threshold_percentage {
            breaker.error_threshold_percentage = threshold;
        }
        if let Some(timeout) = self.reset_timeout {
            breaker.reset_timeout = timeout;
        }
        if let Some(volume) = self.volume_threshold {
            breaker.volume_threshold = volume;
        }
        if let Some(retries) = self.max_retries {
            retry.max_retries = retries;
        }
        if let Some(delay) = self.base_delay {
            retry.base_delay = delay;
        }
        if let Some(delay) = self.max_delay {
            retry.max_delay = delay;
        }
        if let Some(jitter) = self.jitter {
            retry.jitter = jitter;
        }
        if self.attempt_timeout.is_some() {
            retry.attempt_timeout = self.attempt_timeout;
        }

        (breaker, retry)
    }
}

/// Extras for a single service call
pub struct ServiceCallOptions<T> {
    fallback: Option<FallbackFn<T, ServiceError>>,
    overrides: Option<ServiceOverrides>,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
    cancel: Option<CancellationToken>,
}

impl<T> Default for ServiceCallOptions<T> {
    fn default() -> Self {
        Self {
            fallback: None,
            overrides: None,
            retry_classifier: None,
            cancel: None,
        }
    }
}

impl<T> ServiceCallOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result to return when the circuit rejects the call
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, ServiceError> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }

    /// Overrides for this call site; fixed by the first call that uses it
    pub fn with_overrides(mut self, overrides: ServiceOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Replace the default retry classification for this call
    pub fn with_retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(classifier);
        self
    }

    /// Abandon the call when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Resolved policy pair for one (service, call site)
#[derive(Debug)]
struct ComposedCall {
    breaker: BreakerConfig,
    retry: RetryPolicy,
}

/// Coarse health derived from breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Health report for one registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub name: String,
    pub status: HealthStatus,
    pub state: CircuitState,
    pub counters: CallCounters,
    pub window: WindowCounts,
}

/// Builder for [`ServiceRegistry`]
pub struct ServiceRegistryBuilder {
    profiles: HashMap<String, ServiceProfile>,
    default_profile: ServiceProfile,
    registry: RegistryConfig,
}

impl ServiceRegistryBuilder {
    fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            default_profile: ServiceProfile::fallback_default(),
            registry: RegistryConfig::default(),
        }
    }

    /// Register a service; a later profile with the same key replaces it
    pub fn service(mut self, profile: ServiceProfile) -> Self {
        self.profiles.insert(profile.key.clone(), profile);
        self
    }

    pub fn services(mut self, profiles: impl IntoIterator<Item = ServiceProfile>) -> Self {
        for profile in profiles {
            self.profiles.insert(profile.key.clone(), profile);
        }
        self
    }

    /// Profile applied to unregistered service keys
    pub fn default_profile(mut self, profile: ServiceProfile) -> Self {
        self.default_profile = profile;
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    /// Build the registry; inside a tokio runtime the idle sweeper starts too
    pub fn build(self) -> ServiceRegistry {
        let breakers = Arc::new(
            BreakerRegistry::new(self.registry).with_failure_classifier(Arc::new(IgnoreCancelled)),
        );

        if tokio::runtime::Handle::try_current().is_ok() {
            breakers.start_sweeper();
        } else {
            tracing::warn!(
                idle_ttl = ?breakers.config().idle_ttl,
                "no tokio runtime, idle circuit sweeper not started"
            );
        }

        tracing::debug!(services = self.profiles.len(), "service registry built");

        ServiceRegistry {
            profiles: self.profiles,
            default_profile: self.default_profile,
            breakers,
            composed: Mutex::new(HashMap::new()),
        }
    }
}

/// Entry point for guarded calls to external services
pub struct ServiceRegistry {
    profiles: HashMap<String, ServiceProfile>,
    default_profile: ServiceProfile,
    breakers: Arc<BreakerRegistry>,
    composed: Mutex<HashMap<(String, String), Arc<ComposedCall>>>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new()
    }

    /// Build a registry from validated deployment configuration
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;

        Ok(Self::builder()
            .registry_config(config.registry_config())
            .default_profile(config.default_profile())
            .services(config.profiles())
            .build())
    }

    /// Run `op` for `service` under its breaker and retry policy
    ///
    /// `call_site` names the place in code making the call; the composed
    /// policy is cached per `(service, call_site)`.
    pub async fn call<T, F, Fut>(
        &self,
        service: &str,
        call_site: &str,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.call_with(service, call_site, ServiceCallOptions::default(), op)
            .await
    }

    /// [`call`](Self::call) with a fallback, overrides, or cancellation
    pub async fn call_with<T, F, Fut>(
        &self,
        service: &str,
        call_site: &str,
        options: ServiceCallOptions<T>,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let ServiceCallOptions {
            fallback,
            overrides,
            retry_classifier,
            cancel,
        } = options;

        let (composed, cached) = self.composed(service, call_site, overrides.as_ref());
        let breaker = self.breakers.get_or_create(service, &composed.breaker);
        if !cached {
            // Creating a breaker may have evicted another service's
            self.prune_composed();
        }

        let retry = match retry_classifier {
            Some(classifier) => composed.retry.clone().with_classifier(classifier),
            None => composed.retry.clone(),
        };
        let call_options = CallOptions { fallback };

        let guarded = breaker.call_with(move || async move { retry.run(op).await }, call_options);

        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::debug!(service = %service, call_site = %call_site, "service call cancelled");
                        return Err(ServiceError::Cancelled);
                    }
                    result = guarded => result,
                }
            }
            None => guarded.await,
        };

        result.map_err(|error| match error {
            CircuitError::Open { state, .. } => ServiceError::CircuitOpen {
                service: service.to_string(),
                state,
            },
            CircuitError::Timeout { timeout, .. } => ServiceError::Timeout(timeout),
            CircuitError::Execution(error) => error,
        })
    }

    fn composed(
        &self,
        service: &str,
        call_site: &str,
        overrides: Option<&ServiceOverrides>,
    ) -> (Arc<ComposedCall>, bool) {
        let mut composed = self.composed.lock();
        let key = (service.to_string(), call_site.to_string());

        if let Some(call) = composed.get(&key) {
            return (call.clone(), true);
        }

        let profile = match self.profiles.get(service) {
            Some(profile) => profile,
            None => {
                tracing::warn!(
                    service = %service,
                    default = %self.default_profile.key,
                    "unknown service, using default profile"
                );
                &self.default_profile
            }
        };

        let (breaker, retry) = match overrides {
            Some(overrides) => overrides.apply(profile),
            None => (profile.breaker.clone(), profile.retry.clone()),
        };
        let call = Arc::new(ComposedCall {
            breaker,
            retry: RetryPolicy::new(retry).with_label(service),
        });

        composed.insert(key, call.clone());
        (call, false)
    }

    /// Drop cached policies for services whose breaker is gone
    fn prune_composed(&self) {
        let mut composed = self.composed.lock();
        let before = composed.len();
        composed.retain(|(service, _), _| self.breakers.contains(service));

        let pruned = before - composed.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = composed.len(), "pruned cached call policies");
        }
    }

    /// Sweep idle breakers and the call policies cached for them
    ///
    /// Returns the number of breakers removed.
    pub fn sweep_idle(&self) -> usize {
        let removed = self.breakers.sweep_idle();
        self.prune_composed();
        removed
    }

    /// Registered profile for `service`
    pub fn profile(&self, service: &str) -> Option<&ServiceProfile> {
        self.profiles.get(service)
    }

    /// Health of one service; services without a live breaker are healthy
    pub fn service_health(&self, service: &str) -> ServiceHealth {
        let name = self
            .profiles
            .get(service)
            .map_or_else(|| service.to_string(), |profile| profile.name.clone());

        let (state, counters, window) = match self.breakers.stats(service) {
            Some(stats) => (stats.state, stats.lifetime, stats.window),
            None => (
                CircuitState::Closed,
                CallCounters::default(),
                WindowCounts::default(),
            ),
        };

        let status = if state == CircuitState::Open {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ServiceHealth {
            service: service.to_string(),
            name,
            status,
            state,
            counters,
            window,
        }
    }

    /// Health of every registered service, sorted by key
    pub fn all_services_health(&self) -> Vec<ServiceHealth> {
        let mut keys: Vec<&String> = self.profiles.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| self.service_health(key))
            .collect()
    }

    /// Force the service's breaker back to Closed; false if it has none
    pub fn reset_service(&self, service: &str) -> bool {
        let reset = self.breakers.reset(service);
        if reset {
            tracing::info!(service = %service, "service circuit reset");
        }
        reset
    }

    /// Stream of breaker state transitions for all services
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.breakers.subscribe()
    }

    /// Underlying breaker registry
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Stop the sweeper, shut down every breaker and drop cached policies
    pub fn shutdown(&self) {
        self.breakers.shutdown();
        self.composed.lock().clear();
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<&String> = self.profiles.keys().collect();
        services.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &services)
            .field("default_profile", &self.default_profile.key)
            .field("breakers", &self.breakers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn fragile_breaker() -> BreakerConfig {
        BreakerConfig {
            volume_threshold: 2,
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            ..BreakerConfig::default()
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::builder()
            .service(
                ServiceProfile::new("moj", "Ministry of Justice")
                    .with_breaker(fragile_breaker())
                    .with_retry(quick_retry(2)),
            )
            .service(ServiceProfile::payment("stripe", "Stripe"))
            .default_profile(
                ServiceProfile::fallback_default()
                    .with_breaker(fragile_breaker())
                    .with_retry(quick_retry(0)),
            )
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_through_registered_service() {
        let registry = registry();

        let result = registry
            .call("moj", "lookup", || async { Ok::<_, ServiceError>(42) })
            .await;

        assert_eq!(result, Ok(42));
        assert!(registry.breakers().contains("moj"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_inside_one_breaker_call() {
        let registry = registry();
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result = registry
            .call("moj", "lookup", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::status(503, "unavailable"))
                } else {
                    Ok("found")
                }
            })
            .await;

        assert_eq!(result, Ok("found"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let stats = registry.breakers().stats("moj").unwrap();
        assert_eq!(stats.lifetime.calls, 1);
        assert_eq!(stats.window.successes, 1);
        assert_eq!(stats.window.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service_uses_default_profile() {
        let registry = registry();
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        for _ in 0..2 {
            let result: Result<(), _> = registry
                .call("unregistered", "ping", move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::status(503, "unavailable"))
                })
                .await;
            assert!(matches!(result, Err(ServiceError::Status { status: 503, .. })));
        }

        // Default profile: no retries, breaker trips after 2 samples
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let rejected: Result<(), _> = registry
            .call("unregistered", "ping", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(
            rejected,
            Err(ServiceError::CircuitOpen {
                service: "unregistered".to_string(),
                state: CircuitState::Open,
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_when_open() {
        let registry = registry();
        for _ in 0..2 {
            let _: Result<(), _> = registry
                .call("moj", "lookup", || async { Err(ServiceError::status(400, "bad")) })
                .await;
        }

        let result = registry
            .call_with(
                "moj",
                "lookup",
                ServiceCallOptions::new().with_fallback(|ctx| {
                    assert_eq!(ctx.circuit_name, "moj");
                    Ok("cached record")
                }),
                || async { Ok("live record") },
            )
            .await;

        assert_eq!(result, Ok("cached record"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_counted() {
        let registry = registry();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = registry
            .call_with(
                "moj",
                "slow",
                ServiceCallOptions::new().with_cancellation(token),
                || async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, ServiceError>(())
                },
            )
            .await;

        assert_eq!(result, Err(ServiceError::Cancelled));
        let stats = registry.breakers().stats("moj").unwrap();
        assert_eq!(stats.window.total(), 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_cancelled_error_neither_retried_nor_counted() {
        let registry = registry();
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        for _ in 0..3 {
            let result: Result<(), _> = registry
                .call("moj", "lookup", move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::Cancelled)
                })
                .await;
            assert_eq!(result, Err(ServiceError::Cancelled));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(registry.breakers().stats("moj").unwrap().window.total(), 0);
        assert_eq!(registry.service_health("moj").status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_timeout_maps_to_timeout_error() {
        let registry = registry();

        let result = registry
            .call("moj", "slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ServiceError>(())
            })
            .await;

        assert_eq!(result, Err(ServiceError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_fixed_per_call_site() {
        let registry = registry();
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let run = |call_site: &'static str, overrides: Option<ServiceOverrides>| {
            let registry = &registry;
            async move {
                let mut options = ServiceCallOptions::new();
                if let Some(overrides) = overrides {
                    options = options.with_overrides(overrides);
                }
                let _: Result<(), _> = registry
                    .call_with("moj", call_site, options, move || async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(ServiceError::status(400, "not retryable"))
                    })
                    .await;
            }
        };

        let no_retries = ServiceOverrides {
            max_retries: Some(0),
            ..ServiceOverrides::default()
        };
        run("import", Some(no_retries)).await;
        registry.reset_service("moj");

        let retryable_predicate: Arc<dyn RetryClassifier> = Arc::new(
            crate::classifier::PredicateRetryClassifier::new(|_: &dyn crate::Retryable| true),
        );
        counter.store(0, Ordering::SeqCst);
        let _: Result<(), _> = registry
            .call_with(
                "moj",
                "import",
                ServiceCallOptions::new()
                    .with_overrides(ServiceOverrides {
                        max_retries: Some(2),
                        ..ServiceOverrides::default()
                    })
                    .with_retry_classifier(retryable_predicate.clone()),
                move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::status(400, "not retryable"))
                },
            )
            .await;
        // First overrides for "import" stick: still a single attempt
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        registry.reset_service("moj");

        counter.store(0, Ordering::SeqCst);
        let _: Result<(), _> = registry
            .call_with(
                "moj",
                "export",
                ServiceCallOptions::new().with_retry_classifier(retryable_predicate),
                move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::status(400, "not retryable"))
                },
            )
            .await;
        // Profile allows 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reporting() {
        let registry = registry();

        let health = registry.all_services_health();
        let keys: Vec<_> = health.iter().map(|h| h.service.as_str()).collect();
        assert_eq!(keys, vec!["moj", "stripe"]);
        assert!(health.iter().all(|h| h.status == HealthStatus::Healthy));

        for _ in 0..2 {
            let _: Result<(), _> = registry
                .call("moj", "lookup", || async { Err(ServiceError::status(404, "missing")) })
                .await;
        }

        let moj = registry.service_health("moj");
        assert_eq!(moj.name, "Ministry of Justice");
        assert_eq!(moj.status, HealthStatus::Degraded);
        assert_eq!(moj.state, CircuitState::Open);
        assert_eq!(moj.counters.failures, 2);

        assert!(registry.reset_service("moj"));
        assert_eq!(registry.service_health("moj").status, HealthStatus::Healthy);
        assert!(!registry.reset_service("stripe"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_sees_service_transitions() {
        let registry = registry();
        let mut events = registry.subscribe();

        for _ in 0..2 {
            let _: Result<(), _> = registry
                .call("moj", "lookup", || async { Err(ServiceError::status(400, "bad")) })
                .await;
        }

        let change = events.try_recv().unwrap();
        assert_eq!(change.circuit, "moj");
        assert_eq!(change.to, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_breakers() {
        let registry = registry();
        let _ = registry
            .call("stripe", "charge", || async { Ok::<_, ServiceError>(()) })
            .await;

        registry.shutdown();

        assert!(registry.breakers().is_empty());
        assert_eq!(registry.service_health("stripe").state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_config() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [default.retry]
            max_retries = 0

            [services.zatca]
            name = "ZATCA"
            preset = "government_registry"
        "#,
        )
        .unwrap();

        let registry = ServiceRegistry::from_config(&config).unwrap();

        assert_eq!(registry.profile("zatca").unwrap().name, "ZATCA");
        assert_eq!(registry.all_services_health().len(), 1);
        assert_eq!(registry.breakers().config().max_breakers, 100);

        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let _: Result<(), _> = registry
            .call("elsewhere", "ping", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::status(503, "unavailable"))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_policies_bounded_by_live_breakers() {
        let registry = ServiceRegistry::builder()
            .registry_config(RegistryConfig {
                max_breakers: 10,
                ..RegistryConfig::default()
            })
            .default_profile(ServiceProfile::fallback_default().with_retry(quick_retry(0)))
            .build();

        for i in 0..1000 {
            let service = format!("svc-{}", i);
            let result = registry
                .call(&service, "ping", || async { Ok::<_, ServiceError>(()) })
                .await;
            assert_eq!(result, Ok(()));
        }

        assert_eq!(registry.breakers().len(), 10);
        let composed = registry.composed.lock();
        assert_eq!(composed.len(), 10);
        assert!(
            composed
                .keys()
                .all(|(service, _)| registry.breakers().contains(service))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_drops_cached_policies() {
        let registry = ServiceRegistry::builder()
            .registry_config(RegistryConfig {
                idle_ttl: Duration::from_secs(60),
                ..RegistryConfig::default()
            })
            .service(ServiceProfile::new("moj", "Ministry of Justice").with_retry(quick_retry(0)))
            .build();

        for call_site in ["lookup", "verify"] {
            let _ = registry
                .call("moj", call_site, || async { Ok::<_, ServiceError>(()) })
                .await;
        }
        assert_eq!(registry.composed.lock().len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(registry.sweep_idle(), 1);
        assert!(!registry.breakers().contains("moj"));
        assert!(registry.composed.lock().is_empty());

        // Recomposed on the next call
        let result = registry
            .call("moj", "lookup", || async { Ok::<_, ServiceError>(1) })
            .await;
        assert_eq!(result, Ok(1));
        assert_eq!(registry.composed.lock().len(), 1);
    }

    #[test]
    fn test_build_outside_runtime_skips_sweeper() {
        let registry = registry();

        assert!(!registry.breakers().sweeper_running());
    }

    #[test]
    fn test_overrides_win_over_profile() {
        let profile = ServiceProfile::payment("stripe", "Stripe");
        let overrides = ServiceOverrides {
            call_timeout: Some(Duration::from_secs(3)),
            max_retries: Some(7),
            ..ServiceOverrides::default()
        };

        let (breaker, retry) = overrides.apply(&profile);

        assert_eq!(breaker.call_timeout, Duration::from_secs(3));
        assert_eq!(breaker.reset_timeout, profile.breaker.reset_timeout);
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.base_delay, profile.retry.base_delay);
    }
}
