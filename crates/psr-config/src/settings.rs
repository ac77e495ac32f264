use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::ENV_DB_URL;

/// One full frame must fit in a single read.
const MIN_READ_BUFFER_BYTES: usize = 14;

/// Typed view over the merged configuration. Every key has a default, so an
/// empty config boots a working daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listener: ListenerSettings,
    pub http: HttpSettings,
    pub store: StoreSettings,
    pub retry: RetrySettings,
    pub audit: AuditSettings,
    pub sweeper: SweeperSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub bind: String,
    pub read_buffer_bytes: usize,
    /// Read deadline on idle sensor connections. 0 disables it.
    pub idle_timeout_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:6000".to_string(),
            read_buffer_bytes: 1024,
            idle_timeout_secs: 300,
        }
    }
}

impl ListenerSettings {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://parking.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 250,
        }
    }
}

impl StoreSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts before giving up with StoreBusy.
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub path: String,
    pub max_bytes: u64,
    pub generations: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: "logs/sensor_audit.jsonl".to_string(),
            max_bytes: 10 * 1024 * 1024,
            generations: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval_secs: u64,
    /// How long past its end a reservation may run before it is expired.
    pub grace_secs: u64,
    /// Pre-expiry warning window `(warn_lower_secs, warn_upper_secs]` before end.
    pub warn_lower_secs: u64,
    pub warn_upper_secs: u64,
    /// Assumed duration for reservations recorded without an end time.
    pub legacy_duration_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 60,
            warn_lower_secs: 9 * 60,
            warn_upper_secs: 11 * 60,
            legacy_duration_secs: 60 * 60,
        }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Settings {
    /// Decode from merged config JSON, apply env overrides, validate.
    pub fn from_json(config_json: &Value) -> Result<Self> {
        let mut s: Settings =
            serde_json::from_value(config_json.clone()).context("config does not match settings schema")?;
        if let Ok(url) = std::env::var(ENV_DB_URL) {
            if !url.trim().is_empty() {
                s.store.url = url;
            }
        }
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.read_buffer_bytes < MIN_READ_BUFFER_BYTES {
            bail!(
                "CONFIG_INVALID listener.read_buffer_bytes={} must be >= {}",
                self.listener.read_buffer_bytes,
                MIN_READ_BUFFER_BYTES
            );
        }
        if self.retry.max_retries == 0 {
            bail!("CONFIG_INVALID retry.max_retries must be >= 1");
        }
        if self.store.max_connections == 0 {
            bail!("CONFIG_INVALID store.max_connections must be >= 1");
        }
        if self.sweeper.interval_secs == 0 {
            bail!("CONFIG_INVALID sweeper.interval_secs must be >= 1");
        }
        if self.sweeper.warn_lower_secs >= self.sweeper.warn_upper_secs {
            bail!(
                "CONFIG_INVALID sweeper warning window ({}, {}] is empty",
                self.sweeper.warn_lower_secs,
                self.sweeper.warn_upper_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_layered_yaml_from_strings;

    #[test]
    fn empty_config_yields_defaults() {
        let loaded = load_layered_yaml_from_strings(&[]).unwrap();
        let s: Settings = serde_json::from_value(loaded.config_json).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.listener.bind, "0.0.0.0:6000");
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.retry.base_delay(), Duration::from_millis(50));
        assert_eq!(s.audit.max_bytes, 10 * 1024 * 1024);
        assert_eq!(s.sweeper.warn_lower_secs, 540);
        s.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let loaded =
            load_layered_yaml_from_strings(&["listener:\n  idle_timeout_secs: 0\n"]).unwrap();
        let s: Settings = serde_json::from_value(loaded.config_json).unwrap();
        assert_eq!(s.listener.idle_timeout(), None);
        assert_eq!(s.listener.read_buffer_bytes, 1024);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut s = Settings::default();
        s.retry.max_retries = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sweeper.warn_lower_secs = 700;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.listener.read_buffer_bytes = 8;
        assert!(s.validate().is_err());
    }
}
