use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::store::{LeadStore, StoreError};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{label} failed with a non-retryable error: {source}")]
    Permanent {
        label: String,
        #[source]
        source: StoreError,
    },

    #[error("{label} still failing after {attempts} attempts: {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("store unreachable after {attempts} reconnect attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op`, reconnecting and retrying on transient store errors.
    pub fn run<T, F>(&self, store: &mut dyn LeadStore, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(&mut dyn LeadStore) -> Result<T, StoreError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1_u32;

        loop {
            let err = match op(&mut *store) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(RetryError::Permanent {
                    label: label.to_string(),
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store error, reconnecting"
            );
            thread::sleep(delay);
            self.reconnect(&mut *store)?;
            attempt += 1;
        }
    }

    pub fn reconnect(&self, store: &mut dyn LeadStore) -> Result<(), RetryError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1_u32;

        loop {
            match store.reconnect() {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= max_attempts => {
                    return Err(RetryError::Unreachable {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        backend = store.backend_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "reconnect failed"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
