//! Bounded registry of named circuit breakers
//!
//! Owns every live breaker. Capacity is enforced by evicting the least
//! recently used entry; a background sweeper drops entries idle longer than
//! `idle_ttl`.

use crate::{
    callbacks::StateChange,
    circuit::{BreakerConfig, CircuitBreaker, CircuitStats},
    classifier::FailureClassifier,
    window::Clock,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Registry bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryConfig {
    pub max_breakers: usize,
    pub idle_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_breakers: 100,
            idle_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

struct Entry {
    breaker: Arc<CircuitBreaker>,
    last_accessed: Duration,
    /// Access order, used to break ties between equal timestamps
    touched: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    tick: u64,
}

impl Entries {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Name-keyed breaker store with capacity and idle bounds
pub struct BreakerRegistry {
    config: RegistryConfig,
    clock: Clock,
    entries: Mutex<Entries>,
    events: broadcast::Sender<StateChange>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl BreakerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            clock: Clock::new(),
            entries: Mutex::new(Entries::default()),
            events,
            failure_classifier: None,
            sweeper: Mutex::new(None),
        }
    }

    /// Classifier installed on every breaker this registry creates
    pub fn with_failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the breaker for `name`, creating it with `config` if absent
    ///
    /// An existing breaker keeps the configuration it was created with.
    pub fn get_or_create(&self, name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let tick = entries.next_tick();

        if let Some(entry) = entries.map.get_mut(name) {
            entry.last_accessed = now;
            entry.touched = tick;
            return entry.breaker.clone();
        }

        if entries.map.len() >= self.config.max_breakers.max(1) {
            let oldest = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone());

            if let Some(entry) = oldest.and_then(|key| entries.map.remove(&key)) {
                entry.breaker.shutdown();
                tracing::info!(
                    circuit = %entry.breaker.name(),
                    max_breakers = self.config.max_breakers,
                    "evicted least recently used circuit breaker"
                );
            }
        }

        let breaker = Arc::new(self.build(name, config));
        entries.map.insert(
            name.to_string(),
            Entry {
                breaker: breaker.clone(),
                last_accessed: now,
                touched: tick,
            },
        );
        tracing::debug!(circuit = %name, "created circuit breaker");

        breaker
    }

    fn build(&self, name: &str, config: &BreakerConfig) -> CircuitBreaker {
        let events = self.events.clone();
        let mut builder = CircuitBreaker::builder(name)
            .config(config.clone())
            .clock(self.clock)
            .on_state_change(Arc::new(move |change: &StateChange| {
                // No receivers is fine
                let _ = events.send(change.clone());
            }));

        if let Some(classifier) = &self.failure_classifier {
            builder = builder.failure_classifier(classifier.clone());
        }

        builder.build()
    }

    /// Remove every breaker idle for longer than `idle_ttl`
    ///
    /// Returns the number of breakers removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_ttl = self.config.idle_ttl;

        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let expired: Vec<String> = entries
                .map
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.last_accessed) > idle_ttl)
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .iter()
                .filter_map(|key| entries.map.remove(key))
                .collect()
        };

        for entry in &removed {
            entry.breaker.shutdown();
            tracing::debug!(circuit = %entry.breaker.name(), "removed idle circuit breaker");
        }

        if !removed.is_empty() {
            tracing::info!(
                removed = removed.len(),
                remaining = self.len(),
                "swept idle circuit breakers"
            );
        }

        removed.len()
    }

    /// Spawn the periodic idle sweep (no-op if already running)
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!("breaker sweeper cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.sweep_idle();
                    }
                }
            }
        });

        *sweeper = Some(Sweeper { cancel, handle });
    }

    /// Whether the background sweep task is alive
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|sweeper| !sweeper.handle.is_finished())
    }

    /// Stop the sweeper and shut down every breaker
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.cancel.cancel();
        }

        let drained: Vec<Entry> = self.entries.lock().map.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.breaker.shutdown();
        }

        tracing::info!(breakers = drained.len(), "breaker registry shut down");
    }

    /// Force the named breaker back to Closed; false if unknown
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.lookup(name);
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Stats for one breaker without touching its access time
    pub fn stats(&self, name: &str) -> Option<CircuitStats> {
        self.lookup(name).map(|breaker| breaker.stats())
    }

    /// Stats of every breaker, sorted by name
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .entries
            .lock()
            .map
            .values()
            .map(|entry| entry.breaker.clone())
            .collect();

        let mut stats: Vec<CircuitStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn lookup(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries
            .lock()
            .map
            .get(name)
            .map(|entry| entry.breaker.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().map.contains_key(name)
    }

    /// Stream of state transitions from every breaker in this registry
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for BreakerRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.len())
            .finish()
    }
}
