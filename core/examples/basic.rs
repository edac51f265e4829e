//! Guarded calls to a flaky payment provider
//!
//! Run with `RUST_LOG=service_guard=debug cargo run --example basic` to see
//! retry and state-change logs.

use service_guard::{
    BreakerConfig, RetryConfig, ServiceCallOptions, ServiceError, ServiceProfile, ServiceRegistry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Service Guard Basic Example ===\n");

    let registry = ServiceRegistry::builder()
        .service(
            ServiceProfile::payment("payment_api", "Payment API")
                .with_breaker(BreakerConfig {
                    volume_threshold: 3,
                    reset_timeout: Duration::from_secs(2),
                    call_timeout: Duration::from_secs(1),
                    ..BreakerConfig::default()
                })
                .with_retry(RetryConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(100),
                    ..RetryConfig::default()
                }),
        )
        .build();

    let mut changes = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            println!("  circuit '{}': {} -> {}", change.circuit, change.from, change.to);
        }
    });

    // Transient failure healed by retry
    println!("--- Transient failure ---");
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = registry
        .call("payment_api", "charge", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ServiceError::network("ECONNRESET", "connection reset"))
                } else {
                    Ok("payment accepted")
                }
            }
        })
        .await;
    println!(
        "result: {:?} after {} attempts\n",
        result,
        attempts.load(Ordering::SeqCst)
    );

    // Hard failures open the circuit
    println!("--- Triggering failures ---");
    for i in 1..=3 {
        let result: Result<(), _> = registry
            .call("payment_api", "charge", move || async move {
                Err(ServiceError::status(400, format!("card declined {}", i)))
            })
            .await;
        println!("call {}: {:?}", i, result);
    }
    println!("health: {:?}\n", registry.service_health("payment_api").status);

    // Fail fast with a fallback while open
    println!("--- Calling while open ---");
    let result = registry
        .call_with(
            "payment_api",
            "charge",
            ServiceCallOptions::new().with_fallback(|ctx| {
                Ok(format!("queued for later ({} is {})", ctx.circuit_name, ctx.state))
            }),
            || async { Ok("should not run".to_string()) },
        )
        .await;
    println!("result: {:?}\n", result);

    // Recovery through a half-open trial
    println!("--- Waiting for reset timeout ---");
    tokio::time::sleep(Duration::from_secs(2)).await;
    let result = registry
        .call("payment_api", "charge", || async { Ok("payment accepted") })
        .await;
    println!("result: {:?}", result);

    let health = registry.service_health("payment_api");
    println!("health: {:?} ({})", health.status, health.state);

    registry.shutdown();
}
