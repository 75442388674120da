//! Transient-error retry policy for storage operations.

use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::domain::models::RetryConfig;

/// Exponential backoff shaped by the node's retry config. The elapsed-time
/// cap bounds the total wait to roughly `max_retries` rounds at the
/// ceiling interval; persistent failures then escalate to the caller.
pub fn policy(config: &RetryConfig) -> ExponentialBackoff {
    let ceiling = Duration::from_millis(config.max_backoff_ms);
    ExponentialBackoff {
        initial_interval: Duration::from_millis(config.initial_backoff_ms),
        max_interval: ceiling,
        max_elapsed_time: Some(ceiling * config.max_retries),
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_reflects_config() {
        let config = RetryConfig { max_retries: 3, initial_backoff_ms: 100, max_backoff_ms: 2_000 };
        let policy = policy(&config);
        assert_eq!(policy.initial_interval, Duration::from_millis(100));
        assert_eq!(policy.max_interval, Duration::from_millis(2_000));
        assert_eq!(policy.max_elapsed_time, Some(Duration::from_millis(6_000)));
    }
}
