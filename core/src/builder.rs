//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::{Callbacks, StateListener},
    circuit::{BreakerConfig, CircuitBreaker, CircuitContext},
    classifier::FailureClassifier,
    window::Clock,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: BreakerConfig,
    clock: Option<Clock>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the failure percentage (0-100) at which the circuit opens
    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = percentage.clamp(0.0, 100.0);
        self
    }

    /// Set how long the circuit stays open before a trial call
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Set minimum number of samples before the error rate is evaluated
    pub fn volume_threshold(mut self, samples: u64) -> Self {
        self.config.volume_threshold = samples;
        self
    }

    /// Set the rolling window span and its bucket count
    pub fn rolling_window(mut self, duration: Duration, buckets: usize) -> Self {
        self.config.rolling_window = duration;
        self.config.rolling_window_buckets = buckets;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn reset_jitter_factor(mut self, factor: f64) -> Self {
        self.config.reset_jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Share a clock with other components (the registry passes its own)
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// Errors the classifier rejects are not recorded at all, so they neither
    /// count as failures nor as successes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use service_guard::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Add a listener receiving every transition
    pub fn on_state_change(mut self, listener: StateListener) -> Self {
        self.callbacks.subscribe(listener);
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        let clock = self.clock.unwrap_or_default();
        let context = CircuitContext::new(self.name, self.config, clock, self.failure_classifier);

        CircuitBreaker::with_context_and_callbacks(context, self.callbacks)
    }
}
