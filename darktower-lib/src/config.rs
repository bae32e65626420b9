use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the controller. Durations are kept in milliseconds so the
/// struct maps one-to-one onto a JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TowerConfig {
    /// Advertised name handed to the transport on connect
    pub device_name: String,
    /// Service ids handed to the transport on connect
    pub service_ids: Vec<String>,

    pub health_check_interval_ms: u64,
    /// Silence on every frame type after which the link is declared dead
    pub response_timeout_ms: u64,
    pub heartbeat_monitoring: bool,
    pub heartbeat_timeout_ms: u64,
    pub long_operation_timeout_ms: u64,
    /// Re-check the link layer before acting on a missed heartbeat
    pub verify_before_disconnect: bool,
    /// Long-operation flag is dropped after this delay even without a completion frame
    pub long_operation_grace_ms: u64,

    pub command_timeout_ms: u64,
    pub max_send_retries: u32,
    pub retry_delay_step_ms: u64,

    pub battery_notify_enabled: bool,
    pub battery_notify_on_change_only: bool,
    pub battery_notify_interval_ms: u64,
    pub log_battery_frames: bool,

    /// Sample played by `break_seal`
    pub seal_break_sound: u8,
}

impl Default for TowerConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            service_ids: vec![UART_SERVICE_UUID.to_string(), DEVICE_INFO_SERVICE_UUID.to_string()],
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            heartbeat_monitoring: true,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            long_operation_timeout_ms: DEFAULT_LONG_OPERATION_TIMEOUT_MS,
            verify_before_disconnect: true,
            long_operation_grace_ms: DEFAULT_LONG_OPERATION_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            max_send_retries: DEFAULT_MAX_SEND_RETRIES,
            retry_delay_step_ms: DEFAULT_RETRY_DELAY_STEP_MS,
            battery_notify_enabled: true,
            battery_notify_on_change_only: false,
            battery_notify_interval_ms: DEFAULT_BATTERY_NOTIFY_INTERVAL_MS,
            log_battery_frames: false,
            seal_break_sound: 0x2B,
        }
    }
}

impl TowerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn long_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.long_operation_timeout_ms)
    }

    pub fn long_operation_grace(&self) -> Duration {
        Duration::from_millis(self.long_operation_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn battery_notify_interval(&self) -> Duration {
        Duration::from_millis(self.battery_notify_interval_ms)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_step_ms * u64::from(attempt))
    }

    pub fn with_heartbeat_monitoring(mut self, enabled: bool) -> Self {
        self.heartbeat_monitoring = enabled;
        self
    }

    pub fn with_verify_before_disconnect(mut self, enabled: bool) -> Self {
        self.verify_before_disconnect = enabled;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_long_operation_timeout(mut self, timeout: Duration) -> Self {
        self.long_operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_long_operation_grace(mut self, grace: Duration) -> Self {
        self.long_operation_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_send_retries(mut self, retries: u32) -> Self {
        self.max_send_retries = retries;
        self
    }

    pub fn with_battery_notify_on_change_only(mut self, enabled: bool) -> Self {
        self.battery_notify_on_change_only = enabled;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timings() {
        let config = TowerConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(3));
        assert_eq!(config.long_operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.response_timeout(), Duration::from_secs(30));
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.battery_notify_interval(), Duration::from_secs(15));
        assert_eq!(config.max_send_retries, 5);
        assert_eq!(config.retry_delay(3), Duration::from_millis(750));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = TowerConfig::from_json(r#"{ "heartbeat_timeout_ms": 5000, "verify_before_disconnect": false }"#)
            .unwrap();
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(5));
        assert!(!config.verify_before_disconnect);
        assert_eq!(config.max_send_retries, DEFAULT_MAX_SEND_RETRIES);
        assert_eq!(config.device_name, DEFAULT_DEVICE_NAME);
    }
}
