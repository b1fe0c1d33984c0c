use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration options for a [ChannelSynchronizer](super::ChannelSynchronizer)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How to re-establish a subscription after the store reports a transport failure
    pub resubscribe: ResubscribePolicy,
}

/// Backoff schedule used while a channel is degraded. The wait before each attempt doubles from
/// `initial_backoff_ms` up to `max_backoff_ms`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResubscribePolicy {
    /// Time to wait before the first resubscription attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on the time waited between two attempts
    pub max_backoff_ms: u64,
    /// Attempts made before giving up on the channel, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl ResubscribePolicy {
    /// Get the time to wait before the given zero-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Check if the given zero-based attempt may still be made
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ResubscribePolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: Some(3),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(1_000));

        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(ResubscribePolicy::default().allows(u32::MAX));
    }
}
