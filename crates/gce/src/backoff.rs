use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Capped exponential backoff with bounded attempts and optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    start: Duration,
    factor: f64,
    cap: Duration,
    max_attempts: u32,
    /// Fraction of each delay that is randomized, `0.0` disables jitter.
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(60), 20).with_jitter(0.1)
    }
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration, max_attempts: u32) -> Self {
        Backoff {
            start,
            factor: 2.0,
            cap,
            max_attempts: max_attempts.max(1),
            jitter: 0.0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (zero based) failed attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(64) as i32);
        let delay = self.start.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.cap.as_secs_f64()))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread).min(self.cap)
    }

    /// Runs `operation` until it succeeds, fails with an error rejected by
    /// `should_retry`, or the attempts are exhausted.
    pub async fn retry<T, E, F, Fut, R>(&self, mut operation: F, should_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < self.max_attempts && should_retry(&error) => {
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
