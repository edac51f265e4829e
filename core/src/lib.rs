//! ServiceGuard - Resilience layer for calls to unreliable external services
//!
//! This crate provides:
//! - Async circuit breaker driven by a state machine (Closed → Open → HalfOpen)
//! - Bucketed rolling window so the failure rate follows recent traffic
//! - Retry with exponential backoff, jitter and transient-error classification
//! - Bounded breaker registry with idle eviction
//! - Per-service composition of breaker and retry policies, loadable from TOML
//!
//! # Example
//!
//! ```rust
//! use service_guard::{ServiceError, ServiceProfile, ServiceRegistry};
//!
//! # async fn run() -> Result<(), ServiceError> {
//! let registry = ServiceRegistry::builder()
//!     .service(ServiceProfile::payment("stripe", "Stripe"))
//!     .build();
//!
//! // Execute with breaker + retry protection
//! let charge = registry
//!     .call("stripe", "charges.create", || async {
//!         // Your service call here
//!         Ok::<_, ServiceError>("ch_123")
//!     })
//!     .await?;
//!
//! // Check service health
//! let health = registry.service_health("stripe");
//! println!("{} is {:?}", health.name, health.status);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod registry;
pub mod retry;
pub mod services;
pub mod window;

pub use builder::CircuitBuilder;
pub use callbacks::{StateChange, StateListener};
pub use circuit::{
    BreakerConfig, CallCounters, CallOptions, CircuitBreaker, CircuitState, CircuitStats,
    FallbackContext,
};
pub use classifier::{
    DefaultClassifier, DefaultRetryClassifier, FailureClassifier, FailureContext,
    IgnoreCancelled, PredicateClassifier, PredicateRetryClassifier, RetryClassifier, Retryable,
};
pub use config::{ResilienceConfig, load_config};
pub use errors::{AttemptTimeout, CircuitError, ConfigError, ServiceError};
pub use registry::{BreakerRegistry, RegistryConfig};
pub use retry::{Retry, RetryConfig, RetryPolicy, with_retry};
pub use services::{
    HealthStatus, ServiceCallOptions, ServiceHealth, ServiceOverrides, ServiceProfile,
    ServiceRegistry, ServiceRegistryBuilder,
};
pub use window::{Clock, RollingWindow, WindowCounts};

/// Outcome sample recorded by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
    Timeout,
}
