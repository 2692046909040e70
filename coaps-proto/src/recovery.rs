//! Escalating recovery after consecutive failed exchanges

use tracing::warn;

use crate::config::RecoveryConfig;

/// Recovery step to take after a failed exchange
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Recovery {
    /// Keep going; the next cycle retries normally
    None,
    /// Discard the DTLS security context
    ResetSession,
    /// Restart the modem and reattach to the network
    RestartModem,
    /// Reboot the device
    Reboot,
}

/// Maps the consecutive-failure counter onto recovery steps
///
/// Each step fires once, when the counter reaches its threshold. Failures past the reboot
/// threshold keep requesting a reboot.
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    config: RecoveryConfig,
}

impl Escalation {
    /// Create a policy with the given thresholds
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Step to take now that `consecutive` exchanges in a row have failed
    pub fn on_failure(&self, consecutive: u32) -> Recovery {
        let step = if consecutive >= self.config.reboot {
            Recovery::Reboot
        } else if consecutive == self.config.restart_modem {
            Recovery::RestartModem
        } else if consecutive == self.config.reset_session {
            Recovery::ResetSession
        } else {
            Recovery::None
        };
        if step != Recovery::None {
            warn!(consecutive, ?step, "escalating recovery");
        }
        step
    }
}
