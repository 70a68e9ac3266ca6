//! Reconnect delay policy.

use std::time::Duration;

/// Upper bound on the exponential base delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound on random jitter added to exponential delays.
pub const MAX_JITTER: Duration = Duration::from_millis(5000);

/// How long to wait before reconnect attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// `min(30s, base * 2^(attempt-1))` plus up to 5s of jitter.
    ///
    /// Jitter prevents a thundering herd when many clients reconnect after
    /// a relay restart.
    Exponential {
        /// Delay before the first attempt.
        base: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(2000))
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16);
                let scaled = base.saturating_mul(1u32 << shift).min(MAX_BACKOFF);
                scaled + Duration::from_millis(random_jitter_ms())
            }
        }
    }
}

/// Random jitter between 0 and 5000 milliseconds.
///
/// Falls back to zero jitter if the OS source is unavailable.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % (MAX_JITTER.as_millis() as u64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_two_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(2000));
    }

    #[test]
    fn exponential_grows_with_attempt() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
        };
        // Attempt 1: base 1s; attempt 4: base 8s
        assert!(policy.delay_for(1) >= Duration::from_secs(1));
        assert!(policy.delay_for(4) >= Duration::from_secs(8));
    }

    #[test]
    fn exponential_capped_at_30_seconds_plus_jitter() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(2),
        };
        let delay = policy.delay_for(40);
        assert!(delay >= MAX_BACKOFF);
        assert!(delay <= MAX_BACKOFF + MAX_JITTER, "got {delay:?}");
    }

    #[test]
    fn jitter_creates_variance() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
        };
        let delays: Vec<Duration> = (0..20).map(|_| policy.delay_for(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // 20 samples over 5001 jitter values; collisions are very unlikely
        assert!(max.as_millis() - min.as_millis() >= 100);
    }
}
