//! Rate limiting for sync-relay.
//!
//! Two limiters guard the relay:
//! - a keyed limiter on inbound frames per connection
//! - a direct limiter on channel upgrades across the whole relay
//!
//! Both use the governor crate; the keyed one is backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use sync_types::ConnectionId;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits inbound frames per connection.
    message_limiter: Arc<KeyedLimiter<ConnectionId>>,
    /// Limits channel upgrades relay-wide.
    upgrade_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("message_limiter", &"KeyedLimiter<ConnectionId>")
            .field("upgrade_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are raised to one.
    pub fn new(config: &LimitsConfig) -> Self {
        let messages_per_minute =
            NonZeroU32::new(config.messages_per_minute).unwrap_or(NonZeroU32::MIN);
        let upgrades_per_second =
            NonZeroU32::new(config.upgrades_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            message_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(messages_per_minute))),
            upgrade_limiter: Arc::new(RateLimiter::direct(Quota::per_second(upgrades_per_second))),
        }
    }

    /// Check if a frame from this connection is allowed.
    pub fn check_message(&self, connection: &ConnectionId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(connection)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check if another channel upgrade is allowed.
    pub fn check_upgrade(&self) -> Result<(), RateLimitError> {
        self.upgrade_limiter
            .check()
            .map_err(|_| RateLimitError::UpgradeLimitExceeded)
    }

    /// Number of tracked connection keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict keys whose cells have fully recharged.
    pub fn shrink(&self) {
        self.message_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many frames from one connection.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,
    /// Too many upgrades relay-wide.
    #[error("upgrade rate limit exceeded")]
    UpgradeLimitExceeded,
}
