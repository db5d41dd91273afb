//! Async test helpers
//!
//! Polling and timeout utilities for code whose effects land on spawned
//! peer tasks.

use std::future::Future;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Default timeout duration for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for tests that should fail fast (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Helper to assert a future does NOT complete within duration
pub async fn assert_times_out<F, T>(duration: Duration, future: F)
where
    F: Future<Output = T>,
{
    if timeout(duration, future).await.is_ok() {
        panic!("Expected future to timeout, but it completed within {:?}", duration);
    }
}

/// Poll `condition` until it holds, panicking after `duration`
pub async fn eventually<F>(duration: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        if condition() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Condition not met within {:?}: {}", duration, what);
        }
        sleep(POLL_INTERVAL).await;
    }
}
