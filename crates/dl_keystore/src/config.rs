use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Attempts per commit before the transaction is aborted.
    pub max_commit_attempts: u32,
    pub commit_retry_delay_ms: u64,
    /// How long a group message may wait for its sender key.
    pub sender_key_queue_timeout_ms: u64,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 10,
            commit_retry_delay_ms: 3_000,
            sender_key_queue_timeout_ms: 30_000,
        }
    }
}

impl KeyStoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.max_commit_attempts,
            Duration::from_millis(self.commit_retry_delay_ms),
        )
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_key_queue_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: KeyStoreConfig = serde_json::from_str(r#"{"max_commit_attempts": 3}"#).unwrap();
        assert_eq!(cfg.max_commit_attempts, 3);
        assert_eq!(cfg.commit_retry_delay_ms, 3_000);
        assert_eq!(cfg.retry_policy().max_attempts, 3);
        assert_eq!(cfg.queue_timeout(), Duration::from_secs(30));
    }
}
