//! Session settings and configuration storage abstraction.
//!
//! Settings are plain serde types shared by every crate. Where they are
//! stored is abstracted behind [`ConfigStorage`] so the binary can use a
//! file while tests use memory.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::DEFAULT_RECENT_ALERTS;
use crate::reconciler::DEFAULT_HISTORY_CAP;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested configuration was not found.
    #[error("Configuration not found: {0}")]
    NotFound(String),
    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),
    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),
    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Abstract settings storage.
pub trait ConfigStorage: Send + Sync {
    /// Load settings.
    fn load_settings(&self) -> Result<Settings, ConfigError>;

    /// Save settings.
    fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError>;
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Complete settings for one client session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub reconnect: ReconnectSettings,
    pub reconciler: ReconcilerSettings,
    pub alerts: AlertSettings,
    pub staleness: StalenessSettings,
}

impl Settings {
    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidData(msg.to_string()));

        if self.transport.push_enabled && self.transport.push_url.trim().is_empty() {
            return invalid("transport.pushUrl must be set when push is enabled");
        }
        if self.transport.api_base_url.trim().is_empty() {
            return invalid("transport.apiBaseUrl must be set");
        }
        if self.transport.poll_interval_ms == 0 {
            return invalid("transport.pollIntervalMs must be greater than zero");
        }
        if self.transport.request_timeout_ms == 0 {
            return invalid("transport.requestTimeoutMs must be greater than zero");
        }
        if self.reconnect.multiplier < 1.0 || !self.reconnect.multiplier.is_finite() {
            return invalid("reconnect.multiplier must be at least 1.0");
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return invalid("reconnect.maxDelayMs must not be below initialDelayMs");
        }
        if self.reconnect.probe_interval_ms == 0 {
            return invalid("reconnect.probeIntervalMs must be greater than zero");
        }
        if self.reconciler.history_cap == 0 {
            return invalid("reconciler.historyCap must be greater than zero");
        }
        if self.alerts.recent_capacity == 0 {
            return invalid("alerts.recentCapacity must be greater than zero");
        }
        if self.staleness.threshold_secs == 0 {
            return invalid("staleness.thresholdSecs must be greater than zero");
        }
        Ok(())
    }
}

/// Where data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Try the push socket before polling.
    pub push_enabled: bool,

    /// WebSocket URL of the push hub.
    pub push_url: String,

    /// Base URL of the REST API (`/api/airquality/...` is appended).
    pub api_base_url: String,

    /// Poll period while degraded.
    pub poll_interval_ms: u64,

    /// Connect and request timeout.
    pub request_timeout_ms: u64,
}

impl TransportSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            push_enabled: true,
            push_url: "ws://localhost:3000/hubs/airquality".to_string(),
            api_base_url: "http://localhost:3001".to_string(),
            poll_interval_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Push reconnect and fallback policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Retries after a failed connect before falling back to polling.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// How often the push transport is probed while polling.
    pub probe_interval_ms: u64,
}

impl ReconnectSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            probe_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerSettings {
    pub history_cap: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertSettings {
    /// Also alert for the moderate band (51-100).
    pub alert_on_moderate: bool,
    /// Alerts kept for display.
    pub recent_capacity: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            alert_on_moderate: false,
            recent_capacity: DEFAULT_RECENT_ALERTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StalenessSettings {
    /// Seconds without an accepted observation before "waiting for data".
    pub threshold_secs: u64,
}

impl StalenessSettings {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

impl Default for StalenessSettings {
    fn default() -> Self {
        Self { threshold_secs: 60 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    /// In-memory storage for testing.
    struct MemoryConfigStorage {
        data: RwLock<Option<String>>,
    }

    impl MemoryConfigStorage {
        fn new() -> Self {
            Self {
                data: RwLock::new(None),
            }
        }
    }

    impl ConfigStorage for MemoryConfigStorage {
        fn load_settings(&self) -> Result<Settings, ConfigError> {
            let data = self.data.read();
            let json = data
                .as_ref()
                .ok_or_else(|| ConfigError::NotFound("settings".to_string()))?;
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))
        }

        fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError> {
            let json = serde_json::to_string(settings)
                .map_err(|e| ConfigError::WriteError(e.to_string()))?;
            *self.data.write() = Some(json);
            Ok(())
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.reconciler.history_cap, 20);
        assert_eq!(settings.alerts.recent_capacity, 5);
        assert_eq!(settings.reconnect.probe_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{
            "transport": { "pushUrl": "ws://sensors.example:9000/hub" },
            "reconciler": { "historyCap": 50 }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.transport.push_url, "ws://sensors.example:9000/hub");
        assert!(settings.transport.push_enabled);
        assert_eq!(settings.transport.poll_interval_ms, 10_000);
        assert_eq!(settings.reconciler.history_cap, 50);
        assert_eq!(settings.staleness.threshold_secs, 60);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.reconciler.history_cap = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidData(_))
        ));

        let mut settings = Settings::default();
        settings.reconnect.multiplier = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.transport.push_url = String::new();
        assert!(settings.validate().is_err());
        settings.transport.push_enabled = false;
        settings.validate().unwrap();
    }

    #[test]
    fn test_settings_round_trip() {
        let storage = MemoryConfigStorage::new();
        assert!(matches!(
            storage.load_settings(),
            Err(ConfigError::NotFound(_))
        ));

        let mut settings = Settings::default();
        settings.alerts.alert_on_moderate = true;
        settings.transport.poll_interval_ms = 2_500;

        storage.save_settings(&settings).unwrap();
        let loaded = storage.load_settings().unwrap();
        assert_eq!(loaded, settings);
    }
}
