use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FetchError, PipelineError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let ms = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64).max(0.0) as u64)
    }

    pub fn run<T, F>(&self, unit: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, FetchError>,
    {
        self.run_with_sleep(unit, &mut op, std::thread::sleep)
    }

    pub fn run_with_sleep<T, F, S>(
        &self,
        unit: &str,
        op: &mut F,
        mut sleep: S,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, FetchError>,
        S: FnMut(Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(unit, attempt, "fetch succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(FetchError::Permanent(message)) => {
                    return Err(PipelineError::Fetch {
                        unit: unit.to_string(),
                        message,
                    });
                }
                Err(FetchError::Transient(message)) => {
                    if attempt >= max_attempts {
                        warn!(unit, attempts = attempt, %message, "giving up after transient failures");
                        return Err(PipelineError::TransientFetch {
                            unit: unit.to_string(),
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.backoff(attempt);
                    debug!(unit, attempt, delay_ms = delay.as_millis() as u64, %message, "retrying");
                    sleep(delay);
                }
            }
        }
    }
}
