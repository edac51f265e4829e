//! Error types for guarded service calls

use crate::CircuitState;
use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

/// Errors produced by the circuit breaker layer
#[derive(Debug)]
pub enum CircuitError<E> {
    /// Circuit declined to run the operation (open, or half-open with a
    /// trial already in flight)
    Open {
        circuit: String,
        state: CircuitState,
    },
    /// The operation did not finish within the breaker's call timeout
    Timeout { circuit: String, timeout: Duration },
    /// The wrapped operation (or the fallback) failed
    Execution(E),
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { circuit, state } => {
                write!(f, "Circuit '{}' is {}, call rejected", circuit, state)
            }
            CircuitError::Timeout { circuit, timeout } => {
                write!(f, "Circuit '{}' call timed out after {:?}", circuit, timeout)
            }
            CircuitError::Execution(e) => write!(f, "Circuit execution failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// A single retry attempt exceeded its own deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("attempt timed out after {0:?}")]
pub struct AttemptTimeout(pub Duration);

/// Failures returned to callers of the service composition layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Transport-level failure identified by a network error code
    #[error("network error {code}: {message}")]
    Network { code: String, message: String },

    /// The dependency answered with an error status
    #[error("service responded with status {status}: {message}")]
    Status { status: u16, message: String },

    /// The call or one of its attempts ran out of time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The breaker for this service rejected the call without running it
    #[error("circuit for service '{service}' is {state}, call rejected")]
    CircuitOpen { service: String, state: CircuitState },

    /// The caller abandoned the call
    #[error("operation cancelled")]
    Cancelled,

    /// Anything else; not retried unless the message reports a timeout
    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    /// Network failure with an errno-style code such as `ECONNRESET`
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error status returned by the remote side
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Generic failure
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<AttemptTimeout> for ServiceError {
    fn from(err: AttemptTimeout) -> Self {
        Self::Timeout(err.0)
    }
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
            io::ErrorKind::ConnectionReset => "ECONNRESET",
            io::ErrorKind::ConnectionAborted => "ECONNABORTED",
            io::ErrorKind::TimedOut => "ETIMEDOUT",
            io::ErrorKind::BrokenPipe => "EPIPE",
            io::ErrorKind::HostUnreachable => "EHOSTUNREACH",
            io::ErrorKind::NetworkUnreachable => "ENETUNREACH",
            _ => return Self::Other(err.to_string()),
        };
        Self::network(code, err.to_string())
    }
}

/// Errors raised while loading deployment configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join(", "))]
    Invalid(Vec<String>),
}
