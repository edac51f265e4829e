//! Circuit breaker implementation using state machines
//!
//! This module provides an async circuit breaker with state management:
//!
//! ```text
//! Closed   → Open     samples >= volume_threshold and error % >= threshold
//! Open     → HalfOpen first call after reset_timeout (that call is the trial)
//! HalfOpen → Closed   trial succeeds within call_timeout (window cleared)
//! HalfOpen → Open     trial fails or times out (opened_at restarts)
//! ```
//!
//! State and window are mutated under one lock per breaker; the lock is never
//! held while the wrapped operation runs.

use crate::{
    EventKind,
    callbacks::{Callbacks, StateChange, StateListener},
    classifier::{FailureClassifier, FailureContext},
    errors::CircuitError,
    window::{Clock, RollingWindow, WindowCounts},
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use state_machines::state_machine;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerConfig {
    /// Maximum duration of a single call before it counts as a timeout
    pub call_timeout: Duration,

    /// Failure percentage (0-100) at which the circuit opens
    pub error_threshold_percentage: f64,

    /// Cool-down before an open circuit lets a trial call through
    pub reset_timeout: Duration,

    /// Minimum samples in the window before the error rate is evaluated
    pub volume_threshold: u64,

    /// Span of the rolling statistics window
    pub rolling_window: Duration,

    /// Number of buckets the rolling window is split into
    pub rolling_window_buckets: usize,

    /// Jitter factor for reset_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub reset_jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 5,
            rolling_window: Duration::from_secs(10),
            rolling_window_buckets: 10,
            reset_jitter_factor: 0.0,
        }
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => Self::Open,
            "HalfOpen" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Context provided to fallback closures when a call is rejected
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Circuit name
    pub circuit_name: String,
    /// Monotonic offset at which the circuit last opened
    pub opened_at: Duration,
    /// State that caused the rejection
    pub state: CircuitState,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Optional fallback function called when the circuit rejects the call
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: BreakerConfig,
    pub window: Arc<RollingWindow>,
    pub clock: Clock,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl CircuitContext {
    pub(crate) fn new(
        name: String,
        config: BreakerConfig,
        clock: Clock,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
    ) -> Self {
        let window = Arc::new(RollingWindow::new(
            config.rolling_window,
            config.rolling_window_buckets,
        ));
        Self {
            name,
            config,
            window,
            clock,
            failure_classifier,
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(String::new(), BreakerConfig::default(), Clock::new(), None)
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .field(
                "failure_classifier",
                &self
                    .failure_classifier
                    .as_ref()
                    .map(|_| "<dyn FailureClassifier>"),
            )
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Duration,
    /// Cool-down for this open period, jitter applied once on entry
    pub reset_after: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub trial_in_flight: bool,
    pub trial_succeeded: bool,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Check the volume threshold, then the error percentage, over the live window
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let counts = ctx.window.counts(ctx.clock.now());

        counts.total() >= ctx.config.volume_threshold
            && counts.total() > 0
            && counts.error_percentage() >= ctx.config.error_threshold_percentage
    }
}

impl Circuit<HalfOpen> {
    /// A failed trial always reopens, without re-checking thresholds
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    /// Close only once the trial call has succeeded
    fn should_close(&self, _ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.trial_succeeded)
    }
}

impl Circuit<Open> {
    /// Check if the cool-down drawn when the circuit opened has elapsed
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_open() else {
            return false;
        };
        ctx.clock.now().saturating_sub(data.opened_at) >= data.reset_after
    }
}

/// Reset timeout with chrono-machines jitter applied when jitter_factor > 0
fn jittered_reset_timeout(config: &BreakerConfig) -> Duration {
    if config.reset_jitter_factor <= 0.0 {
        return config.reset_timeout;
    }

    let timeout_ms = config.reset_timeout.as_millis() as u64;
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: timeout_ms,
        multiplier: 1.0,
        max_delay_ms: timeout_ms,
    };
    Duration::from_millis(policy.calculate_delay(1, config.reset_jitter_factor))
}

/// Lifetime call counters, never reset by the rolling window
#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejections: AtomicU64,
    fallbacks: AtomicU64,
}

impl Counters {
    fn record(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Success => &self.successes,
            EventKind::Failure => &self.failures,
            EventKind::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CallCounters {
        CallCounters {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime counters of a breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub fallbacks: u64,
}

/// Read-only snapshot of a breaker for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    /// Samples in the live rolling window
    pub window: WindowCounts,
    pub error_percentage: f64,
    pub lifetime: CallCounters,
    /// Monotonic offset of the last transition to open, while open
    pub opened_at: Option<Duration>,
    pub config: BreakerConfig,
}

struct Rejection {
    state: CircuitState,
    opened_at: Duration,
}

/// Admission ticket for one call; releases the half-open trial slot if the
/// call is dropped before it settles
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Option<EventKind>) {
        self.settled = true;
        self.breaker.complete(self.trial, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    machine: Mutex<DynamicCircuit>,
    context: CircuitContext,
    callbacks: RwLock<Callbacks>,
    counters: Counters,
    shut_down: AtomicBool,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let context = CircuitContext::new(name.into(), config, Clock::new(), None);
        Self::with_context_and_callbacks(context, Callbacks::new())
    }

    /// Create a circuit breaker with custom context and callbacks (used by builder)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            machine: Mutex::new(machine),
            context,
            callbacks: RwLock::new(callbacks),
            counters: Counters::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Circuit name
    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Configuration the breaker was built with
    pub fn config(&self) -> &BreakerConfig {
        &self.context.config
    }

    /// Execute an async operation with circuit breaker protection
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        self.call_with(f, CallOptions::default()).await
    }

    /// Execute an async operation, running the fallback if the circuit rejects it
    pub async fn call_with<T, E, F, Fut>(
        &self,
        f: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(rejection) => return self.reject(rejection, options),
        };

        let start = self.context.clock.now();
        match tokio::time::timeout(self.context.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                permit.settle(Some(EventKind::Success));
                Ok(value)
            }
            Ok(Err(e)) => {
                let duration = self.context.clock.now().saturating_sub(start);
                let should_trip = match &self.context.failure_classifier {
                    Some(classifier) => classifier.should_trip(&FailureContext {
                        circuit_name: &self.context.name,
                        error: &e as &dyn std::any::Any,
                        duration,
                    }),
                    None => true,
                };
                permit.settle(should_trip.then_some(EventKind::Failure));
                Err(CircuitError::Execution(e))
            }
            Err(_elapsed) => {
                permit.settle(Some(EventKind::Timeout));
                Err(CircuitError::Timeout {
                    circuit: self.context.name.clone(),
                    timeout: self.context.config.call_timeout,
                })
            }
        }
    }

    fn admit(&self) -> Result<Permit<'_>, Rejection> {
        let mut changes = Vec::new();

        let admitted = {
            let mut machine = self.machine.lock();

            // Check for timeout-based Open -> HalfOpen transition
            if machine.current_state() == "Open"
                && machine.handle(CircuitEvent::AttemptReset).is_ok()
            {
                changes.push(self.change(CircuitState::Open, CircuitState::HalfOpen));
            }

            match machine.current_state() {
                "Open" => Err(Rejection {
                    state: CircuitState::Open,
                    opened_at: machine.open_data().map(|d| d.opened_at).unwrap_or_default(),
                }),
                "HalfOpen" => match machine.half_open_data_mut() {
                    Some(data) if !data.trial_in_flight => {
                        data.trial_in_flight = true;
                        Ok(true)
                    }
                    _ => Err(Rejection {
                        state: CircuitState::HalfOpen,
                        opened_at: Duration::ZERO,
                    }),
                },
                _ => Ok(false),
            }
        };

        self.notify(changes);

        admitted.map(|trial| Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn reject<T, E>(
        &self,
        rejection: Rejection,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>> {
        self.counters.rejections.fetch_add(1, Ordering::Relaxed);

        // If fallback is provided, use it instead of returning error
        if let Some(fallback) = options.fallback {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            let ctx = FallbackContext {
                circuit_name: self.context.name.clone(),
                opened_at: rejection.opened_at,
                state: rejection.state,
            };
            return fallback(&ctx).map_err(CircuitError::Execution);
        }

        Err(CircuitError::Open {
            circuit: self.context.name.clone(),
            state: rejection.state,
        })
    }

    /// Record the outcome of an admitted call and drive transitions
    ///
    /// `None` means the failure was classified as not counting.
    fn complete(&self, trial: bool, outcome: Option<EventKind>) {
        let now = self.context.clock.now();
        let mut changes = Vec::new();

        {
            let mut machine = self.machine.lock();

            if let Some(kind) = outcome {
                self.context.window.record(kind, now);
                self.counters.record(kind);
            }

            match (machine.current_state(), outcome) {
                ("HalfOpen", Some(EventKind::Success)) if trial => {
                    if let Some(data) = machine.half_open_data_mut() {
                        data.trial_succeeded = true;
                    }
                    if machine.handle(CircuitEvent::Close).is_ok() {
                        self.context.window.clear();
                        changes.push(self.change(CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                ("HalfOpen", Some(_)) if trial => {
                    if machine.handle(CircuitEvent::Trip).is_ok() {
                        mark_open(&mut machine, &self.context.config, now);
                        changes.push(self.change(CircuitState::HalfOpen, CircuitState::Open));
                    }
                }
                ("HalfOpen", None) if trial => {
                    if let Some(data) = machine.half_open_data_mut() {
                        data.trial_in_flight = false;
                    }
                }
                ("Closed", Some(EventKind::Failure | EventKind::Timeout)) => {
                    if machine.handle(CircuitEvent::Trip).is_ok() {
                        mark_open(&mut machine, &self.context.config, now);
                        changes.push(self.change(CircuitState::Closed, CircuitState::Open));
                    }
                }
                _ => {}
            }
        }

        self.notify(changes);
    }

    fn release_trial(&self) {
        let mut machine = self.machine.lock();
        if machine.current_state() == "HalfOpen"
            && let Some(data) = machine.half_open_data_mut()
        {
            data.trial_in_flight = false;
        }
    }

    fn change(&self, from: CircuitState, to: CircuitState) -> StateChange {
        StateChange {
            circuit: self.context.name.clone(),
            from,
            to,
        }
    }

    fn notify(&self, changes: Vec<StateChange>) {
        if changes.is_empty() {
            return;
        }

        let callbacks = self.callbacks.read().clone();
        for change in changes {
            if change.to == CircuitState::Open {
                tracing::warn!(
                    circuit = %change.circuit,
                    from = %change.from,
                    to = %change.to,
                    "circuit opened"
                );
            } else {
                tracing::info!(
                    circuit = %change.circuit,
                    from = %change.from,
                    to = %change.to,
                    "circuit state changed"
                );
            }
            callbacks.notify(&change);
        }
    }

    /// Add a listener receiving every state transition of this breaker
    pub fn subscribe(&self, listener: StateListener) {
        self.callbacks.write().subscribe(listener);
    }

    /// Current state; an open circuit past its cool-down still reports open
    /// until the next call probes it
    pub fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.lock().current_state())
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.lock().current_state()
    }

    /// Snapshot of state, window and counters; never changes the breaker
    pub fn stats(&self) -> CircuitStats {
        let (state, opened_at) = {
            let machine = self.machine.lock();
            (
                CircuitState::from_machine(machine.current_state()),
                machine.open_data().map(|d| d.opened_at),
            )
        };
        let window = self.context.window.counts(self.context.clock.now());

        CircuitStats {
            name: self.context.name.clone(),
            state,
            window,
            error_percentage: window.error_percentage(),
            lifetime: self.counters.snapshot(),
            opened_at,
            config: self.context.config.clone(),
        }
    }

    /// Clear all samples and force the circuit back to Closed
    pub fn reset(&self) {
        let previous = {
            let mut machine = self.machine.lock();
            let previous = CircuitState::from_machine(machine.current_state());
            // Recreate machine in Closed state
            *machine = DynamicCircuit::new(self.context.clone());
            self.context.window.clear();
            previous
        };

        if previous != CircuitState::Closed {
            self.notify(vec![self.change(previous, CircuitState::Closed)]);
        }
    }

    /// Release listeners and samples; called when the registry drops the breaker
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.callbacks.write().clear();
        self.context.window.clear();
        tracing::debug!(circuit = %self.context.name, "circuit breaker shut down");
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("config", &self.context.config)
            .finish()
    }
}

/// Apply Open-state bookkeeping
fn mark_open(machine: &mut DynamicCircuit, config: &BreakerConfig, now: Duration) {
    if let Some(data) = machine.open_data_mut() {
        data.opened_at = now;
        data.reset_after = jittered_reset_timeout(config);
    }
}
