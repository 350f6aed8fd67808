use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Configuration for the blocklist poller.
///
/// All fields are plain scalars and have working defaults, so a config file may
/// set any subset of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Max parallel block meta fetches within one tenant (default: 50)
    pub poll_concurrency: usize,
    /// Max parallel tenants per cycle (default: 1)
    pub tenant_poll_concurrency: usize,
    /// Fall back to listing the store when the tenant index pull fails; when
    /// disabled a failed pull fails the tenant (default: true)
    pub poll_fallback: bool,
    /// Number of advisory builder slots per tenant (default: 2)
    pub tenant_index_builders: usize,
    /// Max age in seconds of a pulled tenant index before it is considered stale;
    /// 0 disables the check (default: 0)
    pub stale_tenant_index: ConfigDuration<0>,
    /// Upper bound in milliseconds of the random sleep before each block meta
    /// fetch, to smear store load (default: 0)
    pub poll_jitter_ms: u64,
    /// Consecutive poll errors tolerated per tenant before the tenant falls back
    /// to its previous blocklist (default: 1)
    pub tolerate_consecutive_errors: u32,
    /// Failed tenants tolerated per cycle before the cycle is abandoned
    /// (default: 1)
    pub tolerate_tenant_failures: u32,
    /// Enable deletion of leftover objects of tenants with an empty blocklist
    /// (default: false)
    pub empty_tenant_deletion_enabled: bool,
    /// Min age in seconds of an object before empty tenant deletion may remove it
    /// (default: 0)
    pub empty_tenant_deletion_age: ConfigDuration<0>,
    /// Exclude blocks carrying the no-compact marker from the live blocklist
    /// (default: false)
    pub skip_no_compact_blocks: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_concurrency: 50,
            tenant_poll_concurrency: 1,
            poll_fallback: true,
            tenant_index_builders: 2,
            stale_tenant_index: ConfigDuration::default(),
            poll_jitter_ms: 0,
            tolerate_consecutive_errors: 1,
            tolerate_tenant_failures: 1,
            empty_tenant_deletion_enabled: false,
            empty_tenant_deletion_age: ConfigDuration::default(),
            skip_no_compact_blocks: false,
        }
    }
}

/// A duration configured in whole seconds, with a compile-time default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration<const DEFAULT_SECS: u64>(Duration);

impl<const DEFAULT_SECS: u64> ConfigDuration<DEFAULT_SECS> {
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }
}

impl<const DEFAULT_SECS: u64> Default for ConfigDuration<DEFAULT_SECS> {
    fn default() -> Self {
        Self(Duration::from_secs(DEFAULT_SECS))
    }
}

impl<const DEFAULT_SECS: u64> From<ConfigDuration<DEFAULT_SECS>> for Duration {
    fn from(val: ConfigDuration<DEFAULT_SECS>) -> Self {
        val.0
    }
}

impl<'de, const DEFAULT_SECS: u64> Deserialize<'de> for ConfigDuration<DEFAULT_SECS> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer)
            .map(|secs| secs.map_or_else(Self::default, |secs| Self(Duration::from_secs(secs))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_to_missing_fields() {
        let config: PollerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_concurrency, 50);
        assert_eq!(config.tenant_poll_concurrency, 1);
        assert!(config.poll_fallback);
        assert_eq!(config.tenant_index_builders, 2);
        assert_eq!(Duration::from(config.stale_tenant_index), Duration::ZERO);
        assert_eq!(config.tolerate_consecutive_errors, 1);
        assert_eq!(config.tolerate_tenant_failures, 1);
        assert!(!config.empty_tenant_deletion_enabled);
        assert!(!config.skip_no_compact_blocks);
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let config: PollerConfig = serde_json::from_str(
            r#"{"stale_tenant_index": 300, "empty_tenant_deletion_age": 43200}"#,
        )
        .unwrap();
        assert_eq!(
            Duration::from(config.stale_tenant_index),
            Duration::from_secs(300),
        );
        assert_eq!(
            Duration::from(config.empty_tenant_deletion_age),
            Duration::from_secs(43_200),
        );
    }
}
