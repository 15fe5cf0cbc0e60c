use super::*;

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
enum TestError {
    Busy,
    Fatal,
}

impl Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Busy => f.write_str("busy"),
            TestError::Fatal => f.write_str("fatal"),
        }
    }
}

impl Transient for TestError {
    fn is_transient(&self) -> bool {
        matches!(self, TestError::Busy)
    }
}

fn fast(max_times: usize) -> ExponentialBuilder {
    RetryConfig {
        min_delay_ms: 1,
        max_delay_ms: 2,
        max_times,
    }
    .backoff()
}

#[test]
fn test_default_config() {
    let config = RetryConfig::default();
    assert_eq!(config.min_delay_ms, 10);
    assert_eq!(config.max_delay_ms, 2000);
    assert_eq!(config.max_times, 10);
}

#[test]
fn test_backoff_yields_max_times_delays() {
    let delays: Vec<Duration> = fast(3).build().collect();
    assert_eq!(delays.len(), 3);
}

#[tokio::test]
async fn test_transient_error_retried_until_success() {
    let calls = AtomicU32::new(0);

    let result: Result<u32, TestError> = retry_transient("test", fast(5), || async {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Err(TestError::Busy)
        } else {
            Ok(n)
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_error_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = retry_transient("test", fast(5), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Fatal)
    })
    .await;

    assert!(matches!(result, Err(TestError::Fatal)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = retry_transient("test", fast(2), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Busy)
    })
    .await;

    assert!(matches!(result, Err(TestError::Busy)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stop_interrupts_backoff_sleep() {
    let calls = AtomicU32::new(0);
    let slow = RetryConfig {
        min_delay_ms: 5_000,
        max_delay_ms: 5_000,
        max_times: 10,
    }
    .backoff();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        TestError::Fatal
    };

    let started = std::time::Instant::now();
    let result: Result<(), TestError> = retry_transient_until("test", slow, stop, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Busy)
    })
    .await;

    assert!(matches!(result, Err(TestError::Fatal)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_stop_does_not_cut_short_a_succeeding_attempt() {
    let stop = async { TestError::Fatal };

    let result: Result<u32, TestError> =
        retry_transient_until("test", fast(3), stop, || async { Ok(7) }).await;

    assert_eq!(result.unwrap(), 7);
}
