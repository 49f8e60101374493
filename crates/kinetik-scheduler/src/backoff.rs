//! Bounded exponential backoff for waiting on remote daemons.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry schedule: `attempts` tries, doubling the delay from `initial` up
/// to `max` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            attempts: 10,
        }
    }
}

impl Backoff {
    /// Delays slept between consecutive attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max;
        std::iter::successors(Some(self.initial.min(max)), move |d| Some((*d * 2).min(max)))
            .take(self.attempts.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// The last error is returned with the attempt count attached.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match delays.next() {
                    Some(delay) if attempt < attempts => {
                        warn!(%what, attempt, ?delay, error = %e, "attempt failed, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => {
                        return Err(e.context(format!("{what}: gave up after {attempt} attempts")));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(attempts: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            attempts,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let delays: Vec<u64> = backoff(5).delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let out = backoff(5)
            .retry("ping", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet")
                }
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = backoff(3)
            .retry("ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("refused")
            })
            .await
            .map(|_: ()| ())
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(format!("{err:#}").contains("gave up after 3 attempts"));
    }
}
