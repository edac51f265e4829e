//! Deployment configuration loaded from TOML
//!
//! Durations are written in milliseconds. Every field is optional:
//! `[default]` fills gaps from the built-in defaults, and each
//! `[services.<key>]` table fills gaps from its preset (if any) or `[default]`.
//!
//! ```toml
//! [registry]
//! max_breakers = 100
//!
//! [default.breaker]
//! timeout_ms = 30000
//!
//! [services.stripe]
//! name = "Stripe"
//! preset = "payment"
//! [services.stripe.retry]
//! max_retries = 1
//! ```

use crate::{
    circuit::BreakerConfig,
    errors::ConfigError,
    registry::RegistryConfig,
    retry::RetryConfig,
    services::ServiceProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Root of the TOML document
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub registry: RegistrySection,
    pub default: ProfileSection,
    pub services: BTreeMap<String, ServiceSection>,
}

/// `[registry]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    pub max_breakers: usize,
    pub idle_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            max_breakers: defaults.max_breakers,
            idle_ttl_ms: defaults.idle_ttl.as_millis() as u64,
            cleanup_interval_ms: defaults.cleanup_interval.as_millis() as u64,
        }
    }
}

/// `breaker` table; unset fields are inherited
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub timeout_ms: Option<u64>,
    pub error_threshold_percentage: Option<f64>,
    pub reset_timeout_ms: Option<u64>,
    pub volume_threshold: Option<u64>,
    pub rolling_window_ms: Option<u64>,
    pub rolling_window_buckets: Option<usize>,
    pub reset_jitter_factor: Option<f64>,
}

impl BreakerSection {
    fn resolve(&self, base: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            call_timeout: self.timeout_ms.map_or(base.call_timeout, Duration::from_millis),
            error_threshold_percentage: self
                .error_threshold_percentage
                .unwrap_or(base.error_threshold_percentage),
            reset_timeout: self
                .reset_timeout_ms
                .map_or(base.reset_timeout, Duration::from_millis),
            volume_threshold: self.volume_threshold.unwrap_or(base.volume_threshold),
            rolling_window: self
                .rolling_window_ms
                .map_or(base.rolling_window, Duration::from_millis),
            rolling_window_buckets: self
                .rolling_window_buckets
                .unwrap_or(base.rolling_window_buckets),
            reset_jitter_factor: self.reset_jitter_factor.unwrap_or(base.reset_jitter_factor),
        }
    }
}

/// `retry` table; unset fields are inherited
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub exponential_base: Option<f64>,
    pub jitter: Option<bool>,
    pub attempt_timeout_ms: Option<u64>,
}

impl RetrySection {
    fn resolve(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay: self.base_delay_ms.map_or(base.base_delay, Duration::from_millis),
            max_delay: self.max_delay_ms.map_or(base.max_delay, Duration::from_millis),
            exponential_base: self.exponential_base.unwrap_or(base.exponential_base),
            jitter: self.jitter.unwrap_or(base.jitter),
            attempt_timeout: self
                .attempt_timeout_ms
                .map(Duration::from_millis)
                .or(base.attempt_timeout),
        }
    }
}

/// `[default]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileSection {
    pub breaker: BreakerSection,
    pub retry: RetrySection,
}

/// Built-in starting points for `[services.<key>]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    GovernmentRegistry,
    Payment,
    AiProvider,
    Messaging,
    Webhook,
}

impl Preset {
    fn profile(self, key: &str, name: &str) -> ServiceProfile {
        match self {
            Preset::GovernmentRegistry => ServiceProfile::government_registry(key, name),
            Preset::Payment => ServiceProfile::payment(key, name),
            Preset::AiProvider => ServiceProfile::ai_provider(key, name),
            Preset::Messaging => ServiceProfile::messaging(key, name),
            Preset::Webhook => ServiceProfile::webhook(key, name),
        }
    }
}

/// `[services.<key>]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    /// Display name; the key is used when absent
    pub name: Option<String>,
    pub preset: Option<Preset>,
    pub breaker: BreakerSection,
    pub retry: RetrySection,
}

impl ResilienceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_breakers: self.registry.max_breakers,
            idle_ttl: Duration::from_millis(self.registry.idle_ttl_ms),
            cleanup_interval: Duration::from_millis(self.registry.cleanup_interval_ms),
        }
    }

    /// Profile for unregistered service keys
    pub fn default_profile(&self) -> ServiceProfile {
        let base = ServiceProfile::fallback_default();
        let breaker = self.default.breaker.resolve(&base.breaker);
        let retry = self.default.retry.resolve(&base.retry);
        base.with_breaker(breaker).with_retry(retry)
    }

    /// Every `[services.<key>]` entry, resolved
    pub fn profiles(&self) -> Vec<ServiceProfile> {
        let default = self.default_profile();

        self.services
            .iter()
            .map(|(key, section)| {
                let name = section.name.as_deref().unwrap_or(key);
                let base = match section.preset {
                    Some(preset) => preset.profile(key, name),
                    None => ServiceProfile::new(key.as_str(), name)
                        .with_breaker(default.breaker.clone())
                        .with_retry(default.retry.clone()),
                };
                let breaker = section.breaker.resolve(&base.breaker);
                let retry = section.retry.resolve(&base.retry);
                base.with_breaker(breaker).with_retry(retry)
            })
            .collect()
    }

    /// Check every value; all problems are reported together
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.registry.max_breakers == 0 {
            errors.push("registry.max_breakers must be at least 1".to_string());
        }
        if self.registry.idle_ttl_ms == 0 {
            errors.push("registry.idle_ttl_ms must be greater than 0".to_string());
        }
        if self.registry.cleanup_interval_ms == 0 {
            errors.push("registry.cleanup_interval_ms must be greater than 0".to_string());
        }

        let default = self.default_profile();
        validate_breaker("default", &default.breaker, &mut errors);
        validate_retry("default", &default.retry, &mut errors);

        for profile in self.profiles() {
            let label = format!("services.{}", profile.key);
            validate_breaker(&label, &profile.breaker, &mut errors);
            validate_retry(&label, &profile.retry, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_breaker(label: &str, config: &BreakerConfig, errors: &mut Vec<String>) {
    if !(0.0..=100.0).contains(&config.error_threshold_percentage) {
        errors.push(format!(
            "{}.breaker.error_threshold_percentage must be within 0-100 (got {})",
            label, config.error_threshold_percentage
        ));
    }
    if config.call_timeout.is_zero() {
        errors.push(format!("{}.breaker.timeout_ms must be greater than 0", label));
    }
    if config.reset_timeout.is_zero() {
        errors.push(format!("{}.breaker.reset_timeout_ms must be greater than 0", label));
    }
    if config.rolling_window_buckets == 0 {
        errors.push(format!("{}.breaker.rolling_window_buckets must be at least 1", label));
    } else if config.rolling_window.as_millis() < config.rolling_window_buckets as u128 {
        errors.push(format!(
            "{}.breaker.rolling_window_ms must give each of the {} buckets at least 1ms",
            label, config.rolling_window_buckets
        ));
    }
    if !(0.0..=1.0).contains(&config.reset_jitter_factor) {
        errors.push(format!(
            "{}.breaker.reset_jitter_factor must be within 0-1 (got {})",
            label, config.reset_jitter_factor
        ));
    }
}

fn validate_retry(label: &str, config: &RetryConfig, errors: &mut Vec<String>) {
    if !(config.exponential_base >= 1.0 && config.exponential_base.is_finite()) {
        errors.push(format!(
            "{}.retry.exponential_base must be at least 1 (got {})",
            label, config.exponential_base
        ));
    }
    if config.max_delay < config.base_delay {
        errors.push(format!(
            "{}.retry.max_delay_ms must not be below base_delay_ms",
            label
        ));
    }
    if config.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
        errors.push(format!("{}.retry.attempt_timeout_ms must be greater than 0", label));
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<ResilienceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = ResilienceConfig::from_toml_str(&content)?;

    tracing::info!(
        path = %path.display(),
        services = config.services.len(),
        "loaded resilience config"
    );

    Ok(config)
}
