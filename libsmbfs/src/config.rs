use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmbFsError};

/// How an inactive slot holding a deferred-close handle may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferredReusePolicy {
    /// Only a request for the exact same access mode reuses the handle.
    Exact,
    /// Any request whose access the deferred handle already covers reuses it,
    /// e.g. a write-only open on a read+write handle.
    #[default]
    Superset,
}

/// Per-share client tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "maxDeferredCloses")]
    pub max_deferred_closes: u32,

    #[serde(rename = "deferredCloseTimeoutMs")]
    pub deferred_close_timeout_ms: u64,

    #[serde(rename = "leaseBreakWaitRetries")]
    pub lease_break_wait_retries: u32,

    #[serde(rename = "leaseBreakWaitIntervalMs")]
    pub lease_break_wait_interval_ms: u64,

    #[serde(rename = "deferredReuse")]
    pub deferred_reuse: DeferredReusePolicy,

    #[serde(rename = "durableTimeoutMs")]
    pub durable_timeout_ms: u64,

    /// The share is continuously available: ask for persistent handles.
    #[serde(rename = "persistentHandles")]
    pub persistent_handles: bool,

    #[serde(rename = "enableDowngrade")]
    pub enable_downgrade: bool,

    /// Ask for WRITE_DAC on write opens; dropped first when the server refuses.
    #[serde(rename = "requestAclWrite")]
    pub request_acl_write: bool,

    #[serde(rename = "maxLockHandles")]
    pub max_lock_handles: usize,

    #[serde(rename = "lockWaitTimeoutMs")]
    pub lock_wait_timeout_ms: u64,

    #[serde(rename = "reconnectRetries")]
    pub reconnect_retries: u32,

    #[serde(rename = "deferredReaperIntervalMs")]
    pub deferred_reaper_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_deferred_closes: 64,
            deferred_close_timeout_ms: 30_000,
            lease_break_wait_retries: 10,
            lease_break_wait_interval_ms: 100,
            deferred_reuse: DeferredReusePolicy::Superset,
            durable_timeout_ms: 60_000,
            persistent_handles: false,
            enable_downgrade: true,
            request_acl_write: true,
            max_lock_handles: 3,
            lock_wait_timeout_ms: 5_000,
            reconnect_retries: 1,
            deferred_reaper_interval_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(raw)
            .map_err(|e| SmbFsError::Invalid(format!("failed to parse client config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SmbFsError::Invalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.lease_break_wait_interval_ms == 0 && self.lease_break_wait_retries > 0 {
            return Err(SmbFsError::Invalid(
                "leaseBreakWaitIntervalMs must be positive when retries are enabled".into(),
            ));
        }
        if self.deferred_reaper_interval_ms == 0 {
            return Err(SmbFsError::Invalid(
                "deferredReaperIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn deferred_close_timeout(&self) -> Duration {
        Duration::from_millis(self.deferred_close_timeout_ms)
    }

    pub fn lease_break_wait_interval(&self) -> Duration {
        Duration::from_millis(self.lease_break_wait_interval_ms)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_timeout_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn deferred_reaper_interval(&self) -> Duration {
        Duration::from_millis(self.deferred_reaper_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_partial_uses_defaults() {
        let raw = r#"{
  "maxDeferredCloses": 2,
  "deferredReuse": "exact",
  "persistentHandles": true
}"#;
        let config = ClientConfig::from_json(raw).unwrap();
        assert_eq!(config.max_deferred_closes, 2);
        assert_eq!(config.deferred_reuse, DeferredReusePolicy::Exact);
        assert!(config.persistent_handles);
        assert_eq!(config.lease_break_wait_retries, 10);
        assert_eq!(config.max_lock_handles, 3);
    }

    #[test]
    fn test_reject_unknown_policy() {
        let err = ClientConfig::from_json(r#"{"deferredReuse": "sometimes"}"#).unwrap_err();
        assert!(matches!(err, SmbFsError::Invalid(_)));
    }

    #[test]
    fn test_reject_zero_interval() {
        let err = ClientConfig::from_json(r#"{"leaseBreakWaitIntervalMs": 0}"#).unwrap_err();
        assert!(matches!(err, SmbFsError::Invalid(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"lockWaitTimeoutMs": 250}}"#).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lock_wait_timeout(), Duration::from_millis(250));
        assert!(ClientConfig::from_file("/nonexistent/smbfs.json").is_err());
    }
}
