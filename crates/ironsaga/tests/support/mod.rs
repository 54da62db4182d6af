//! Sagas and helpers shared by the integration tests.
#![allow(dead_code)]

pub mod orders;
pub mod shipments;

use std::time::Duration;

use ironsaga::{Envelope, Message};
use serde::Serialize;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ironsaga=debug")
        .with_test_writer()
        .try_init();
}

/// Wrap a `type`-tagged value as an inbound event envelope.
pub fn event<T: Serialize>(value: &T) -> Envelope {
    Envelope::new(Message::event(value).expect("tagged test message"))
}

/// Wrap a `type`-tagged value as an inbound command envelope.
pub fn command<T: Serialize>(value: &T) -> Envelope {
    Envelope::new(Message::command(value).expect("tagged test message"))
}

/// Message types of `envelopes`, in order.
pub fn message_types(envelopes: &[Envelope]) -> Vec<String> {
    envelopes
        .iter()
        .map(|e| e.message().message_type().to_owned())
        .collect()
}

/// Poll `check` until it returns `true` or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
