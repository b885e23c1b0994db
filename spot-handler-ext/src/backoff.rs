use std::fmt::Display;
use std::future::Future;
use std::iter::Take;
use std::time::Duration;

use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;

/// Constant backoff with a bounded number of attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub const fn constant(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Delays between consecutive attempts, one fewer than there are attempts.
    pub fn strategy(self) -> Take<FixedInterval> {
        let retries = self.attempts().saturating_sub(1);
        FixedInterval::new(self.delay).take(retries as usize)
    }

    /// Longest time all attempts can take when each one is cut off after `attempt_timeout`.
    pub fn budget(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.attempts();
        attempt_timeout * attempts + self.delay * (attempts - 1)
    }

    /// Runs `operation` until it succeeds or the attempts are used up.
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn retry<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.retry_if(name, |_: &E| true, operation).await
    }

    /// Like [`Backoff::retry`], but stops early on errors `retryable` rejects.
    pub async fn retry_if<T, E, F, Fut, R>(
        &self,
        name: &str,
        retryable: R,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        let condition = |err: &E| {
            attempt += 1;
            let retry = retryable(err);
            if retry && attempt < attempts {
                tracing::warn!(name, attempt, attempts, %err, "Attempt failed, retrying");
            }
            retry
        };

        RetryIf::start(self.strategy(), operation, condition).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    const FAST: Backoff = Backoff::constant(5, Duration::from_millis(1));

    #[test]
    fn strategy_waits_between_attempts_only() {
        let delays: Vec<_> = FAST.strategy().collect();
        assert_eq!(delays, vec![Duration::from_millis(1); 4]);

        let once = Backoff::constant(0, Duration::from_secs(1));
        assert_eq!(once.attempts(), 1);
        assert_eq!(once.strategy().count(), 0);
    }

    #[test]
    fn budget_covers_every_attempt_and_delay() {
        let backoff = Backoff::constant(3, Duration::from_secs(1));
        assert_eq!(backoff.budget(Duration::from_secs(5)), Duration::from_secs(17));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = FAST
            .retry("flaky", || async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 { Err(format!("call {call} failed")) } else { Ok(call) }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_all_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = FAST
            .retry("broken", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn does_not_retry_rejected_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = FAST
            .retry_if(
                "fatal",
                |err: &String| err != "fatal",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
