//! ---
//! pvsim_section: "02-messaging"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Frame codec and broker transports."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::time::Duration;

use pvsim_common::RetryConfig;
use rand::Rng;
use tracing::{error, info, warn};

use crate::transport::Transport;
use crate::Result;

/// Capped exponential backoff for broker reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first one.
    pub max_attempts: usize,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound of the exponential part.
    pub max_delay: Duration,
    /// Maximum random delay added on top.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Build a policy; at least one attempt is always made.
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Policy that never waits, for tests and tight loops.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after failed attempt `attempt` (1-indexed), without jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = (attempt.saturating_sub(1) as u32).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// Delay after failed attempt `attempt`, with jitter applied.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1)) as u64;
        base + Duration::from_millis(jitter_ms)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.jitter,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            Duration::from_millis(250),
            Duration::from_secs(10),
            Duration::from_millis(50),
        )
    }
}

/// Connect `transport`, retrying with backoff until the policy is exhausted.
pub async fn connect_with_retry<T>(transport: &mut T, policy: &RetryPolicy) -> Result<()>
where
    T: Transport + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match transport.connect().await {
            Ok(()) => {
                info!(transport = transport.name(), attempt, "connected to broker");
                return Ok(());
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    transport = transport.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "broker connection failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(transport = transport.name(), attempt, error = %err, "broker connection failed; giving up");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Delivery;
    use crate::TransportError;
    use async_trait::async_trait;

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            Duration::ZERO,
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts, 1);
    }

    struct Flaky {
        failures_left: usize,
        attempts: usize,
        connected: bool,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn connect(&mut self) -> Result<()> {
            self.attempts += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Connection("refused".into()));
            }
            self.connected = true;
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        async fn publish(&mut self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
            Ok(None)
        }
        async fn ack(&mut self, _tag: u64) -> Result<()> {
            Ok(())
        }
        async fn reject(&mut self, _tag: u64, _requeue: bool) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn connect_retries_until_success() {
        let mut transport = Flaky {
            failures_left: 2,
            attempts: 0,
            connected: false,
        };
        connect_with_retry(&mut transport, &RetryPolicy::immediate(3))
            .await
            .unwrap();
        assert_eq!(transport.attempts, 3);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_attempts() {
        let mut transport = Flaky {
            failures_left: 10,
            attempts: 0,
            connected: false,
        };
        let err = connect_with_retry(&mut transport, &RetryPolicy::immediate(4))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert_eq!(transport.attempts, 4);
    }
}
