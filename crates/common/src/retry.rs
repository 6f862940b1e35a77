use std::future::Future;
use std::time::Duration;

/// Bounded attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Verified copies: 5 attempts, 1 second apart.
    pub const fn copy_default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// Service stop/start during recovery: 3 attempts, 1 second apart.
    pub const fn service_default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Never less than one attempt.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Last error of an exhausted retry loop.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Runs `op` until it succeeds or the policy is exhausted.
///
/// `on_failure` sees every failed attempt (1-based) before the delay.
/// No delay follows the final attempt.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
    mut on_failure: impl FnMut(u32, &E),
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                on_failure(attempt, &err);
                if attempt >= max {
                    return Err(Exhausted { attempts: attempt, last: err });
                }
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
