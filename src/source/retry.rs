//! Bounded exponential backoff for the transient storage-error class.
//!
//! The legacy store stays live while we extract, so lock/interrupt errors
//! are expected occasionally. Those retry; everything else is immediately
//! fatal. Exhausting the budget is fatal too, preserving the original error
//! text.

use std::thread;

use log::warn;

use crate::config::RetryPolicy;
use crate::error::{BridgeError, Result};

/// Run `op`, retrying the transient lock/interrupt class with exponential
/// backoff per `policy`. This is the only place in the engine that
/// intentionally re-attempts a failed operation.
pub fn run_with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_message = String::new();

    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!("{}", BridgeError::retry_hint(delay, attempt));
                last_message = err.to_string();
                thread::sleep(delay);
            }
            Err(err) if err.is_transient() => {
                last_message = err.to_string();
                break;
            }
            Err(err) => return Err(err),
        }
    }

    Err(BridgeError::RetryExhausted {
        attempts,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    fn busy_error() -> BridgeError {
        BridgeError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database table is locked: treatments".to_string()),
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result = run_with_retry(&fast_policy(5), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(busy_error()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_preserves_original_error_text() {
        let result: Result<()> = run_with_retry(&fast_policy(3), || Err(busy_error()));
        let err = result.unwrap_err();
        match err {
            BridgeError::RetryExhausted { attempts, ref message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("database table is locked: treatments"));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[test]
    fn non_transient_errors_fail_immediately() {
        let calls = Cell::new(0u32);
        let result: Result<()> = run_with_retry(&fast_policy(5), || {
            calls.set(calls.get() + 1);
            Err(BridgeError::Data("bad row".to_string()))
        });
        assert!(matches!(result.unwrap_err(), BridgeError::Data(_)));
        assert_eq!(calls.get(), 1);
    }
}
