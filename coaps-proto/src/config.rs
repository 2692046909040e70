use std::{fmt, time::Duration};

use thiserror::Error;

use crate::message::Block;

/// Upper bound of every configurable timeout
///
/// Fully backed off, `MAX_TIMEOUT * 2^15` still fits an `Instant` offset.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Parameters governing the request/response exchange
///
/// The defaults follow the device defaults used for NB-IoT and LTE-M links, where a radio may
/// spend several seconds waking up before the first datagram leaves the modem.
pub struct ExchangeConfig {
    pub(crate) ack_timeout: Duration,
    pub(crate) not_ready_margin: Duration,
    pub(crate) max_retransmissions: u32,
    pub(crate) separate_response_timeout: Duration,
    pub(crate) max_message_size: usize,
}

impl ExchangeConfig {
    /// Initial retransmission timeout
    ///
    /// The timeout doubles with every retransmission. Must be nonzero and at most
    /// [`MAX_TIMEOUT`].
    pub fn ack_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() || value > MAX_TIMEOUT {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_timeout = value;
        Ok(self)
    }

    /// Extra time granted once per attempt while the network reports it is not yet ready
    pub fn not_ready_margin(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value > MAX_TIMEOUT {
            return Err(ConfigError::OutOfBounds);
        }
        self.not_ready_margin = value;
        Ok(self)
    }

    /// Number of retransmissions before an exchange is declared failed
    ///
    /// Must be below 16, which keeps the doubled timeout representable.
    pub fn max_retransmissions(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value >= 16 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_retransmissions = value;
        Ok(self)
    }

    /// How long to wait for a separate response after the request was acknowledged
    pub fn separate_response_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value > MAX_TIMEOUT {
            return Err(ConfigError::OutOfBounds);
        }
        self.separate_response_timeout = value;
        Ok(self)
    }

    /// Largest datagram the engine will build
    pub fn max_message_size(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if !(64..=65_507).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_message_size = value;
        Ok(self)
    }

    /// Largest datagram the engine will build
    pub fn get_max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(3),
            not_ready_margin: Duration::from_secs(3),
            max_retransmissions: 4,
            separate_response_timeout: Duration::from_secs(60),
            max_message_size: 1152,
        }
    }
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ExchangeConfig")
            .field("ack_timeout", &self.ack_timeout)
            .field("not_ready_margin", &self.not_ready_margin)
            .field("max_retransmissions", &self.max_retransmissions)
            .field("separate_response_timeout", &self.separate_response_timeout)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

/// Parameters of the block-wise firmware download
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub(crate) max_image_size: u64,
    pub(crate) szx: u8,
    pub(crate) prefix: String,
}

impl UpdateConfig {
    /// Largest image accepted; larger announced totals cancel the transfer
    pub fn max_image_size(&mut self, value: u64) -> &mut Self {
        self.max_image_size = value;
        self
    }

    /// Block size requested from the server, as a size exponent (`2^(szx + 4)` bytes)
    ///
    /// The server may answer with smaller blocks, which are then used for the rest of the
    /// transfer.
    pub fn szx(&mut self, value: u8) -> Result<&mut Self, ConfigError> {
        if value > Block::MAX_SZX {
            return Err(ConfigError::OutOfBounds);
        }
        self.szx = value;
        Ok(self)
    }

    /// Path prepended to resource identifiers that don't start with `/`
    pub fn prefix(&mut self, value: impl Into<String>) -> &mut Self {
        self.prefix = value.into();
        self
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_image_size: 0x70000,
            szx: 5,
            prefix: "fw".into(),
        }
    }
}

/// Consecutive exchange failures at which each recovery step is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub(crate) reset_session: u32,
    pub(crate) restart_modem: u32,
    pub(crate) reboot: u32,
}

impl RecoveryConfig {
    /// Construct a policy; thresholds must be nonzero and strictly increasing
    pub fn new(reset_session: u32, restart_modem: u32, reboot: u32) -> Result<Self, ConfigError> {
        if reset_session == 0 || reset_session >= restart_modem || restart_modem >= reboot {
            return Err(ConfigError::OutOfBounds);
        }
        Ok(Self {
            reset_session,
            restart_modem,
            reboot,
        })
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reset_session: 2,
            restart_modem: 3,
            reboot: 5,
        }
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
