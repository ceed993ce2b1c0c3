// Central retry helper
//
// Every bounded-retry loop in the codebase goes through this module:
// store disk faults, tile fetches, sync uploads, collector probes.
// Callers pick a policy and a retriability predicate; the helper owns
// the backoff arithmetic.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff parameters for a retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Jitter mode applied to each computed delay.
    pub jitter: Jitter,
}

#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    /// Use the computed delay as-is.
    None,
    /// Multiply the delay by U(1 - f, 1 + f).
    Fraction(f64),
    /// Replace the delay with U(0, delay).
    Full,
}

impl RetryPolicy {
    /// The store's disk-fault policy: 3 attempts at 50/200/800 ms.
    pub fn storage() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            cap: Duration::from_millis(800),
            jitter: Jitter::None,
        }
    }

    /// Tile fetch policy: 3 retries at 250 ms x 2^n, jittered.
    pub fn tile_fetch() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            jitter: Jitter::Fraction(0.2),
        }
    }

    /// Delay before attempt `n` (the first retry is n = 1).
    ///
    /// Geometric: base x 4^(n-1) for the storage ladder (50/200/800),
    /// so the multiplier is part of the policy rather than hard-coded
    /// by callers.
    pub fn delay_for(&self, retry: u32, multiplier: u32) -> Duration {
        let scaled = self
            .base_delay
            .saturating_mul(multiplier.saturating_pow(retry.saturating_sub(1)));
        let capped = scaled.min(self.cap);
        apply_jitter(capped, self.jitter)
    }
}

fn apply_jitter(delay: Duration, jitter: Jitter) -> Duration {
    match jitter {
        Jitter::None => delay,
        Jitter::Fraction(f) => {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range((1.0 - f)..(1.0 + f));
            delay.mul_f64(factor.max(0.0))
        }
        Jitter::Full => {
            let mut rng = rand::thread_rng();
            delay.mul_f64(rng.gen_range(0.0..=1.0))
        }
    }
}

/// Exponential backoff for failure counters:
/// min(base x 2^failures, cap) plus full jitter drawn from U(0, delay).
pub fn backoff_with_full_jitter(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(failures.min(20)))
        .min(cap);
    exp + apply_jitter(exp, Jitter::Full)
}

/// Run `op` until it succeeds, retries are exhausted, or it fails with a
/// non-retriable error. `retriable` decides which errors are worth another
/// attempt; the last error is returned verbatim.
pub async fn retry<T, E, F, Fut, P>(policy: RetryPolicy, retriable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && retriable(&err) => {
                let delay = policy.delay_for(attempt, 2);
                tracing::debug!(
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Blocking twin of [`retry`] for the store's dedicated writer thread,
/// which must not touch the async runtime. Uses the 50/200/800 ladder
/// (multiplier 4).
pub fn retry_blocking<T, E, F, P>(policy: RetryPolicy, retriable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && retriable(&err) => {
                let delay = policy.delay_for(attempt, 4);
                tracing::debug!(
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    err,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
