//! Process-wide shutdown signal and cancellation-aware waits.
//!
//! Every blocking wait in the system (KV polls, listener waits, retry sleeps)
//! races against the stopping signal so a SIGTERM propagates within about a
//! second, without relying on task aborts.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::StoppedError;

static STOPPING: LazyLock<watch::Sender<bool>> = LazyLock::new(|| watch::channel(false).0);

/// Signal the whole process to stop. Idempotent.
pub fn send_sigterm() {
    STOPPING.send_replace(true);
}

pub fn is_stopping() -> bool {
    *STOPPING.subscribe().borrow()
}

/// Reset the signal. Only meaningful between test cases.
pub fn reset_sigterm() {
    STOPPING.send_replace(false);
}

/// Wait until the process-wide stopping signal fires.
pub async fn wait_stopping() {
    let mut rx = STOPPING.subscribe();
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Fail fast when the process is shutting down.
pub fn assert_is_alive() -> Result<(), StoppedError> {
    if is_stopping() {
        Err(StoppedError::timeout())
    } else {
        Ok(())
    }
}

/// Await a future, racing it against the stopping signal and an optional
/// timeout. Returns `Err(StoppedError::timeout())` when either fires first.
pub async fn with_timeout<F>(future: F, timeout: Option<Duration>) -> Result<F::Output, StoppedError>
where
    F: Future,
{
    if is_stopping() {
        return Err(StoppedError::timeout());
    }

    match timeout {
        Some(timeout) => {
            tokio::select! {
                value = future => Ok(value),
                _ = wait_stopping() => Err(StoppedError::timeout()),
                _ = tokio::time::sleep(timeout) => Err(StoppedError::timeout()),
            }
        }
        None => {
            tokio::select! {
                value = future => Ok(value),
                _ = wait_stopping() => Err(StoppedError::timeout()),
            }
        }
    }
}

/// Wait for a flag with an optional timeout; reports whether it is set
/// afterwards instead of erroring on timeout.
pub async fn with_timeout_flag(flag: &crate::signal::Flag, timeout: Option<Duration>) -> bool {
    let _ = with_timeout(flag.wait(), timeout).await;
    flag.is_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_returns_value_when_future_wins() {
        let result = with_timeout(async { 42 }, Some(Duration::from_secs(1))).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn with_timeout_errors_on_timeout() {
        let result = with_timeout(
            std::future::pending::<()>(),
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn with_timeout_flag_reports_set_state() {
        let flag = crate::signal::Flag::new();
        assert!(!with_timeout_flag(&flag, Some(Duration::from_millis(10))).await);
        flag.set();
        assert!(with_timeout_flag(&flag, Some(Duration::from_millis(10))).await);
    }
}
