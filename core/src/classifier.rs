//! Failure classification
//!
//! Two questions are asked about every failed call:
//! - should it count against the circuit? (`FailureClassifier`)
//! - is it worth another attempt? (`RetryClassifier`)

use crate::ServiceError;
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// Trait for classifying failures - determines if an error should trip the circuit
///
/// Returning `false` means the failure is not recorded at all.
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Determine if this error should count as a failure for circuit breaker logic
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that trips on all errors
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    /// Create a new predicate-based classifier
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Classifier that keeps caller cancellations out of the failure window
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreCancelled;

impl FailureClassifier for IgnoreCancelled {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        !ctx
            .error
            .downcast_ref::<ServiceError>()
            .is_some_and(|error| error.is_cancelled())
    }
}

/// Network error codes treated as transient
pub const TRANSIENT_NETWORK_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "ETIMEDOUT",
    "EPIPE",
    "EHOSTUNREACH",
    "ENETUNREACH",
];

/// Response statuses treated as transient
pub const RETRYABLE_STATUS_CODES: &[u16] = &[
    408, // Request Timeout
    429, // Too Many Requests
    500, // Internal Server Error
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
    520, // CDN: unknown origin error
    521, // CDN: origin down
    522, // CDN: connection timed out
    523, // CDN: origin unreachable
    524, // CDN: a timeout occurred
];

/// What the retry layer can learn about an error
///
/// Every method has a neutral default so plain error types only need
/// `Display`; the message is still checked for a timeout mention.
pub trait Retryable: fmt::Display {
    /// Errno-style network code (`ECONNRESET`, `ENOTFOUND`, ...)
    fn network_code(&self) -> Option<&str> {
        None
    }

    /// Response status from the remote side
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// The caller abandoned the operation
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl Retryable for ServiceError {
    fn network_code(&self) -> Option<&str> {
        match self {
            ServiceError::Network { code, .. } => Some(code.as_str()),
            ServiceError::Timeout(_) => Some("ETIMEDOUT"),
            _ => None,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            ServiceError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, ServiceError::Cancelled)
    }
}

impl Retryable for String {}

impl Retryable for &str {}

/// Decides whether a failed attempt should be retried
pub trait RetryClassifier: Send + Sync + fmt::Debug {
    fn should_retry(&self, error: &dyn Retryable) -> bool;
}

/// Transient network codes, retryable statuses, then a "timeout" mention
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryClassifier;

impl RetryClassifier for DefaultRetryClassifier {
    fn should_retry(&self, error: &dyn Retryable) -> bool {
        if error.is_cancelled() {
            return false;
        }

        if error
            .network_code()
            .is_some_and(|code| TRANSIENT_NETWORK_CODES.contains(&code))
        {
            return true;
        }

        if error
            .status_code()
            .is_some_and(|status| RETRYABLE_STATUS_CODES.contains(&status))
        {
            return true;
        }

        error.to_string().to_lowercase().contains("timeout")
    }
}

/// Caller-supplied retry predicate; replaces the default classification
///
/// Cancelled operations are never retried, whatever the predicate says.
pub struct PredicateRetryClassifier<F>
where
    F: Fn(&dyn Retryable) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateRetryClassifier<F>
where
    F: Fn(&dyn Retryable) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> RetryClassifier for PredicateRetryClassifier<F>
where
    F: Fn(&dyn Retryable) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &dyn Retryable) -> bool {
        !error.is_cancelled() && (self.predicate)(error)
    }
}

impl<F> fmt::Debug for PredicateRetryClassifier<F>
where
    F: Fn(&dyn Retryable) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRetryClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
