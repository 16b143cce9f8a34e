//! Retry policy for optimistic-concurrency conflicts
//!
//! Exponential backoff with optional jitter. Only store conflicts are
//! retried; every other error surfaces on the first attempt.

use diwan_core::WorkflowConfig;
use rand::Rng;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 means no retries)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add random jitter
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }
}

impl From<&WorkflowConfig> for RetryConfig {
    fn from(config: &WorkflowConfig) -> Self {
        Self::new(config.max_conflict_retries)
            .with_initial_delay(config.retry_initial_delay())
            .with_max_delay(config.retry_max_delay())
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Fixed delay, no backoff
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(RetryConfig {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Capped in f64 first; Duration arithmetic panics on overflow
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()).max(0.0));

        if self.config.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.mul_f64(self.config.jitter_factor);
        if jitter_range.is_zero() {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..jitter_range);
        if rng.gen_bool(0.5) {
            delay.saturating_add(jitter)
        } else {
            delay.saturating_sub(jitter)
        }
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or
/// the retry budget is spent. Returns the last error on exhaustion.
pub async fn retry_with<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.config.max_retries || !should_retry(&e) {
                    return Err(e);
                }

                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after conflict");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
