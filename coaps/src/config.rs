use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use proto::{ConfigError, ExchangeConfig, RecoveryConfig, UpdateConfig};
use serde::{Deserialize, Serialize};

/// Runtime configuration of a [`Client`](crate::Client)
///
/// Loadable from JSON; every field has a default, so a file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server address
    pub destination: SocketAddr,
    /// Local address to bind
    pub local: SocketAddr,
    /// Path of the telemetry resource
    pub telemetry_path: String,
    /// Query parameters sent with each telemetry message, e.g. the device identity
    pub telemetry_query: Vec<String>,
    /// Seconds between telemetry messages, until the server suggests otherwise
    pub interval_secs: u64,
    /// Upper bound on the engine's wait, so bookkeeping runs regularly
    pub poll_interval_ms: u64,
    /// How long suspend permission must hold before the power manager is told
    pub suspend_debounce_ms: u64,
    /// Ask the network to release the connection right after each exchange
    pub release_assistance: bool,
    /// Initial retransmission timeout
    pub ack_timeout_ms: u64,
    /// Deadline extension while the link is not ready
    pub not_ready_margin_ms: u64,
    /// Retransmissions before an exchange fails
    pub max_retransmissions: u32,
    /// Wait for a separate response after an empty acknowledgement
    pub separate_response_timeout_secs: u64,
    /// Largest datagram built
    pub max_message_size: usize,
    /// Largest firmware image accepted
    pub max_image_size: u64,
    /// Requested block size exponent
    pub block_szx: u8,
    /// Path prepended to relative firmware resources
    pub firmware_prefix: String,
    /// Consecutive failures before the DTLS session is discarded
    pub reset_session_after: u32,
    /// Consecutive failures before the modem restarts
    pub restart_modem_after: u32,
    /// Consecutive failures before the device reboots
    pub reboot_after: u32,
}

impl ClientConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Send interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Engine wait bound
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Suspend debounce
    pub fn suspend_debounce(&self) -> Duration {
        Duration::from_millis(self.suspend_debounce_ms)
    }

    /// Protocol parameters of the exchange
    pub fn exchange_config(&self) -> Result<ExchangeConfig, ConfigError> {
        let mut config = ExchangeConfig::default();
        config
            .ack_timeout(Duration::from_millis(self.ack_timeout_ms))?
            .max_retransmissions(self.max_retransmissions)?
            .max_message_size(self.max_message_size)?
            .not_ready_margin(Duration::from_millis(self.not_ready_margin_ms))?
            .separate_response_timeout(Duration::from_secs(self.separate_response_timeout_secs))?;
        Ok(config)
    }

    /// Parameters of firmware downloads
    pub fn update_config(&self) -> Result<UpdateConfig, ConfigError> {
        let mut config = UpdateConfig::default();
        config
            .szx(self.block_szx)?
            .max_image_size(self.max_image_size)
            .prefix(self.firmware_prefix.clone());
        Ok(config)
    }

    /// Failure escalation thresholds
    pub fn recovery_config(&self) -> Result<RecoveryConfig, ConfigError> {
        RecoveryConfig::new(
            self.reset_session_after,
            self.restart_modem_after,
            self.reboot_after,
        )
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            destination: SocketAddr::from((Ipv4Addr::LOCALHOST, proto::DEFAULT_PORT)),
            local: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            telemetry_path: "s".into(),
            telemetry_query: Vec::new(),
            interval_secs: 3600,
            poll_interval_ms: 1000,
            suspend_debounce_ms: 1000,
            release_assistance: true,
            ack_timeout_ms: 3000,
            not_ready_margin_ms: 3000,
            max_retransmissions: 4,
            separate_response_timeout_secs: 60,
            max_message_size: 1152,
            max_image_size: 0x70000,
            block_szx: 5,
            firmware_prefix: "fw".into(),
            reset_session_after: 2,
            restart_modem_after: 3,
            reboot_after: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"destination": "192.0.2.1:5684", "block_szx": 6}"#).unwrap();
        assert_eq!(config.destination.port(), 5684);
        assert_eq!(config.interval(), Duration::from_secs(3600));
        assert!(config.update_config().is_ok());
        assert!(config.exchange_config().is_ok());
    }

    #[test]
    fn invalid_protocol_values() {
        let config = ClientConfig {
            max_retransmissions: 20,
            block_szx: 7,
            reboot_after: 1,
            ..ClientConfig::default()
        };
        assert!(config.exchange_config().is_err());
        assert!(config.update_config().is_err());
        assert!(config.recovery_config().is_err());
        assert!(serde_json::from_str::<ClientConfig>(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn oversized_timeouts_rejected() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"ack_timeout_ms": 9223372036854775807}"#).unwrap();
        assert!(config.exchange_config().is_err());
        let config = ClientConfig {
            separate_response_timeout_secs: u64::MAX,
            ..ClientConfig::default()
        };
        assert!(config.exchange_config().is_err());
    }
}
