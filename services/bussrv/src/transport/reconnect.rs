//! Reconnect backoff
//!
//! One schedule shared by both broker-facing loops: the daemon
//! transport drives it through [`ReconnectHelper`], the MQTT event loop
//! tracks its own attempt counter and asks [`backoff_delay`] directly.
//! The supervisor's process restart backoff is a separate schedule.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ReconnectError {
    #[error("reconnect attempt limit reached")]
    MaxAttemptsExceeded,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// Backoff schedule
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempt limit, 0 = keep trying
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier,
            jitter: true,
        }
    }
}

/// Delay before the given attempt (1-based)
///
/// Exponential up to `max_delay`, then flat; jitter spreads each delay
/// over a ±25% band so parallel reconnecting services do not stampede
/// a recovering daemon.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    // Exponent capped so mul_f64 stays finite on long outages
    let exponent = attempt.saturating_sub(1).min(32);
    let scaled = policy
        .initial_delay
        .mul_f64(policy.backoff_multiplier.powi(exponent as i32));
    let capped = scaled.min(policy.max_delay);

    if !policy.jitter {
        return capped;
    }
    let band = capped.as_millis() as f64 * 0.25;
    if band <= 0.0 {
        return capped;
    }
    let offset = rand::thread_rng().gen_range(-band..band);
    Duration::from_millis((capped.as_millis() as f64 + offset).max(0.0) as u64)
}

/// Drives one connect attempt at a time for the transport manager
///
/// The attempt streak resets on success, so the first reconnect after a
/// dropped connection goes out immediately and only repeated failures
/// back off.
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Failed attempts since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sleep out the backoff, then run `connect_fn` once
    ///
    /// `MaxAttemptsExceeded` is terminal; the caller's loop stops
    /// instead of retrying.
    pub async fn execute_reconnect<F, Fut, E>(
        &mut self,
        mut connect_fn: F,
    ) -> Result<(), ReconnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if self.policy.max_attempts > 0 && self.attempt >= self.policy.max_attempts {
            warn!("Giving up after {} connect attempts", self.attempt);
            return Err(ReconnectError::MaxAttemptsExceeded);
        }

        self.attempt += 1;
        if self.attempt > 1 {
            let delay = backoff_delay(&self.policy, self.attempt);
            info!("Connect attempt {} in {:?}", self.attempt, delay);
            tokio::time::sleep(delay).await;
        }

        match connect_fn().await {
            Ok(()) => {
                self.attempt = 0;
                Ok(())
            },
            Err(e) => {
                warn!("Connect attempt {} failed: {}", self.attempt, e);
                Err(ReconnectError::ConnectionFailed(e.to_string()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(50));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(400));
        // Past the cap, and far past without overflowing
        assert_eq!(backoff_delay(&policy, 5), Duration::from_millis(400));
        assert_eq!(backoff_delay(&policy, 1_000), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_quarter_band() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(1_000),
            ..ReconnectPolicy::default()
        };

        for _ in 0..100 {
            let delay = backoff_delay(&policy, 1);
            assert!(delay >= Duration::from_millis(750), "{:?} too short", delay);
            assert!(delay <= Duration::from_millis(1_250), "{:?} too long", delay);
        }
    }

    #[tokio::test]
    async fn test_attempt_limit_is_terminal() {
        let mut helper = ReconnectHelper::new(fast_policy(2));
        let refused = || async { Err::<(), _>("connection refused") };

        for expected in 1..=2u32 {
            let result = helper.execute_reconnect(refused).await;
            assert!(matches!(result, Err(ReconnectError::ConnectionFailed(_))));
            assert_eq!(helper.attempt(), expected);
        }

        // The limit holds even if the daemon came back
        let result = helper.execute_reconnect(|| async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsExceeded)));
    }

    #[tokio::test]
    async fn test_success_resets_the_streak() {
        let mut helper = ReconnectHelper::new(fast_policy(2));

        let result = helper
            .execute_reconnect(|| async { Err::<(), _>("connection refused") })
            .await;
        assert!(result.is_err());
        assert_eq!(helper.attempt(), 1);

        let result = helper.execute_reconnect(|| async { Ok::<(), &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(helper.attempt(), 0);

        // A later outage gets the full attempt budget again
        for _ in 0..2 {
            let result = helper
                .execute_reconnect(|| async { Err::<(), _>("connection refused") })
                .await;
            assert!(matches!(result, Err(ReconnectError::ConnectionFailed(_))));
        }
    }
}
