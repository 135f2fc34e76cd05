//! Cooperative cancellation for running steps.
//!
//! This module provides:
//! - CancellationToken, the single top-down signal forwarded through a plan
//! - `interruptible`, which races a suspend point against that signal

mod token;

pub use token::{CancelCallback, CancellationToken};

use crate::errors::{ExecError, Result};
use std::future::Future;

/// Runs `fut` unless `cancel` fires first, in which case the future is
/// dropped and [`ExecError::Interrupted`] is returned.
pub async fn interruptible<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ExecError::Interrupted),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interruptible_passes_through() {
        let token = CancellationToken::new();
        let value = interruptible(&token, async { Ok::<_, ExecError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_interruptible_observes_cancel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel("stop");
        });

        let res = interruptible(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ExecError>(())
        })
        .await;

        assert!(matches!(res, Err(ExecError::Interrupted)));
    }
}
