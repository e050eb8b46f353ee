// Common test utilities

#![allow(dead_code)]

pub mod messages;

pub use messages::*;

use std::time::Duration;

use servicebus::{Bus, BusConfig, InMemoryBroker};

/// Retry delay short enough for the dead-letter round trip to finish quickly.
pub const FAST_RETRY: Duration = Duration::from_millis(50);

/// Config for a bus on `queue` with fast retries.
pub fn fast_config(queue: &str) -> BusConfig {
    BusConfig::new(queue)
        .with_retry_delay(FAST_RETRY)
        .with_max_retries(2)
}

/// Poll `condition` until it holds. Panics after about five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Give in-flight deliveries a moment to land before asserting absence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

/// Start consuming on every bus, failing the test on error.
pub async fn start_all(buses: &[&Bus]) {
    for bus in buses {
        bus.start_consuming().await.expect("bus should start consuming");
    }
}

pub async fn shutdown_all(buses: &[&Bus]) {
    for bus in buses {
        bus.shutdown().await;
    }
}

pub fn broker() -> InMemoryBroker {
    InMemoryBroker::new()
}
