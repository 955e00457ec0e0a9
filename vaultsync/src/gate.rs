use crate::errors::{MigrationError, Result};
use std::future::Future;
use std::time::Duration;

/// Blocks a run until a database answers a trivial round trip.
///
/// Only transient failures (see [`MigrationError::is_transient`]) are
/// retried; anything else is returned on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionGate {
    pub attempts: u32,
    pub interval: Duration,
}

impl ConnectionGate {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Probes until success, returning how many retries it took.
    pub async fn wait<F, Fut>(&self, label: &str, mut probe: F) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match probe().await {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("{label} reachable after {attempt} attempt(s)");
                    }
                    return Ok(attempt - 1);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(MigrationError::ConnectionUnavailable {
                        label: label.to_string(),
                        attempts,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    log::warn!(
                        "{label} not reachable (attempt {attempt}/{attempts}): {err}; retrying in {:?}",
                        self.interval
                    );
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
            }
        }
    }
}
