use std::time::Duration;

use tracing::warn;

use cassbak_types::{Error, Result};

use crate::cancel::CancelToken;

pub const MANIFEST_RETRIES: u32 = 3;
pub const BLOB_RETRIES: u32 = 3;
pub const LIST_RETRIES: u32 = 3;

const RETRY_SLEEP_PER_ATTEMPT: Duration = Duration::from_secs(1);

/// Retry transient bucket errors with linear backoff (attempt x 1s).
///
/// Not-found and cancellation are never retried; cancellation is also
/// re-checked between attempts so a SIGINT cuts a retry loop short.
pub fn retry<T>(
    cancel: &CancelToken,
    op: &str,
    limit: u32,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempts = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                attempts += 1;
                if attempts > limit {
                    return Err(e);
                }
                warn!(op, attempts, error = %e, "retrying bucket operation");
                std::thread::sleep(RETRY_SLEEP_PER_ATTEMPT * attempts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_needs_one_call() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let result: Result<u32> = retry(&cancel, "op", 3, || {
            calls += 1;
            Ok(7)
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn not_found_is_never_retried() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let result: Result<()> = retry(&cancel, "op", 3, || {
            calls += 1;
            Err(Error::NotFound("blob".into()))
        });
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls, 1);
    }

    #[test]
    fn transient_errors_retry_up_to_limit() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let result: Result<()> = retry(&cancel, "op", 2, || {
            calls += 1;
            Err(Error::Storage("503".into()))
        });
        assert!(matches!(result.unwrap_err(), Error::Storage(_)));
        assert_eq!(calls, 3); // initial try + 2 retries
    }

    #[test]
    fn cancellation_short_circuits() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0;
        let result: Result<()> = retry(&cancel, "op", 3, || {
            calls += 1;
            Err(Error::Storage("flaky".into()))
        });
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls, 1);
    }
}
