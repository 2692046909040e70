use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::ExchangeConfig;

/// Outcome of an expired retransmission deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Backoff {
    /// The link is still coming up; the deadline moved out by the margin
    Extended(Instant),
    /// Send the current message again and wait `timeout`
    Resend { attempt: u32, timeout: Duration },
    /// Retransmissions are used up
    Exhausted,
}

/// Per-exchange timeout, backoff and retry accounting
///
/// Each retransmission doubles the timeout. While the network reports that it isn't ready, an
/// expired deadline is pushed out by the not-ready margin instead of triggering a resend, at most
/// once per attempt.
#[derive(Debug)]
pub(crate) struct Retransmission {
    base: Duration,
    margin: Duration,
    max: u32,
    count: u32,
    timeout: Duration,
    deadline: Option<Instant>,
    extended: bool,
}

impl Retransmission {
    pub(crate) fn new(config: &ExchangeConfig) -> Self {
        Self {
            base: config.ack_timeout,
            margin: config.not_ready_margin,
            max: config.max_retransmissions,
            count: 0,
            timeout: config.ack_timeout,
            deadline: None,
            extended: false,
        }
    }

    /// Forget the previous attempt; the next `arm` uses the base timeout
    pub(crate) fn reset(&mut self) {
        self.count = 0;
        self.timeout = self.base;
        self.deadline = None;
        self.extended = false;
    }

    /// Start waiting for the current attempt, returning the deadline
    pub(crate) fn arm(&mut self, now: Instant) -> Instant {
        let deadline = now + self.timeout;
        self.deadline = Some(deadline);
        self.extended = false;
        deadline
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn on_timeout(&mut self, link_ready: bool) -> Backoff {
        if !link_ready && !self.extended {
            if let Some(deadline) = self.deadline {
                self.extended = true;
                let deadline = deadline + self.margin;
                self.deadline = Some(deadline);
                trace!(margin = ?self.margin, "link not ready, extending deadline");
                return Backoff::Extended(deadline);
            }
        }
        self.deadline = None;
        if self.count >= self.max {
            return Backoff::Exhausted;
        }
        self.count += 1;
        self.timeout *= 2;
        Backoff::Resend {
            attempt: self.count,
            timeout: self.timeout,
        }
    }

    /// Retransmissions performed for the current exchange
    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// The timeout that the next `arm` will use
    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Timeout in effect after `k` retransmissions
pub fn timeout_for(base: Duration, k: u32) -> Duration {
    base * (1 << k)
}
