use std::time::Duration;

use serde::{Deserialize, Serialize};

use dl_keystore::KeyStoreConfig;

use crate::error::SignalError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingCacheConfig {
    pub ttl_secs: u64,
    /// Byte budget across keys and values; least recently used go first.
    pub max_bytes: usize,
}

impl Default for MappingCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            max_bytes: 2 * 1024 * 1024,
        }
    }
}

impl MappingCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundCacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for OutboundCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            capacity: 512,
        }
    }
}

impl OutboundCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub keystore: KeyStoreConfig,
    pub mapping_cache: MappingCacheConfig,
    pub outbound_cache: OutboundCacheConfig,
}

impl SignalConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SignalError> {
        let config: SignalConfig =
            serde_json::from_str(json).map_err(|e| SignalError::Config(e.to_string()))?;
        if config.keystore.max_commit_attempts == 0 {
            return Err(SignalError::Config("max_commit_attempts must be at least 1".into()));
        }
        if config.outbound_cache.capacity == 0 {
            return Err(SignalError::Config("outbound_cache.capacity must be at least 1".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SignalConfig::default();
        assert_eq!(cfg.keystore.max_commit_attempts, 10);
        assert_eq!(cfg.keystore.commit_retry_delay_ms, 3_000);
        assert_eq!(cfg.mapping_cache.ttl(), Duration::from_secs(604_800));
        assert_eq!(cfg.mapping_cache.max_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.outbound_cache.capacity, 512);
    }

    #[test]
    fn partial_json_overrides() {
        let cfg = SignalConfig::from_json_str(
            r#"{"keystore": {"sender_key_queue_timeout_ms": 500}, "outbound_cache": {"ttl_secs": 5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.keystore.sender_key_queue_timeout_ms, 500);
        assert_eq!(cfg.keystore.max_commit_attempts, 10);
        assert_eq!(cfg.outbound_cache.ttl(), Duration::from_secs(5));
        assert_eq!(cfg.outbound_cache.capacity, 512);
    }

    #[test]
    fn rejects_invalid() {
        assert!(SignalConfig::from_json_str("{").is_err());
        assert!(SignalConfig::from_json_str(r#"{"keystore": {"max_commit_attempts": 0}}"#).is_err());
    }
}
