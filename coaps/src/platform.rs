//! Narrow interfaces to the device around the exchange engine, with host implementations

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};

use proto::State;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Cellular modem control
pub trait Modem: Send + Sync {
    /// Whether the device is attached to a network
    fn is_attached(&self) -> bool;
    /// Whether the radio link is fully up, rather than still connecting
    fn is_ready(&self) -> bool {
        self.is_attached()
    }
    /// Restart the modem and reattach
    fn restart(&mut self) -> io::Result<()>;
    /// Request release assistance, letting the network drop the connection right after a reply
    fn set_release_assistance(&mut self, enable: bool) -> io::Result<()>;
}

/// Receives the suspend permission computed by the power liaison
pub trait PowerManager: Send {
    /// `true` if the device may enter its low-power state
    fn suspend(&mut self, allowed: bool);
}

/// Status LED or similar
pub trait Indicator: Send {
    /// Reflect the exchange state
    fn show(&mut self, state: State);
}

/// Device-level services
pub trait System: Send + Sync {
    /// Restart the device; `code` records why
    fn reboot(&self, code: RebootCode);
    /// Signal liveness to the watchdog
    fn feed_watchdog(&self) {}
}

/// Supplies the application lines of each telemetry message
pub trait TelemetrySource: Send {
    /// Lines to append after the sequence number and uptime
    fn lines(&mut self) -> Vec<String>;
}

/// Reasons for a controlled reboot
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RebootCode {
    /// Requested by the operator
    Requested = 1,
    /// Booting into a downloaded image
    Update = 2,
    /// Too many failed exchanges in a row
    Recovery = 3,
    /// The UDP socket could not be created
    Socket = 4,
    /// The DTLS engine could not be initialized
    Session = 5,
}

impl RebootCode {
    fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Requested,
            2 => Self::Update,
            3 => Self::Recovery,
            4 => Self::Socket,
            5 => Self::Session,
            _ => return None,
        })
    }
}

impl fmt::Display for RebootCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Requested => "requested",
            Self::Update => "update",
            Self::Recovery => "recovery",
            Self::Socket => "socket failure",
            Self::Session => "session failure",
        })
    }
}

/// Modem of a host that is always online
#[derive(Debug)]
pub struct HostModem {
    attached: Arc<AtomicBool>,
    restarts: usize,
}

impl HostModem {
    /// An attached modem
    pub fn new() -> Self {
        Self {
            attached: Arc::new(AtomicBool::new(true)),
            restarts: 0,
        }
    }

    /// Handle to toggle attachment from outside, e.g. in tests
    pub fn attachment(&self) -> Arc<AtomicBool> {
        self.attached.clone()
    }
}

impl Default for HostModem {
    fn default() -> Self {
        Self::new()
    }
}

impl Modem for HostModem {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    fn restart(&mut self) -> io::Result<()> {
        self.restarts += 1;
        info!(restarts = self.restarts, "restarting modem");
        self.attached.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn set_release_assistance(&mut self, enable: bool) -> io::Result<()> {
        trace!(enable, "release assistance");
        Ok(())
    }
}

/// Logs suspend permission changes
#[derive(Debug, Default)]
pub struct LogPower {
    since: Option<Instant>,
}

impl PowerManager for LogPower {
    fn suspend(&mut self, allowed: bool) {
        match (allowed, self.since) {
            (true, _) => {
                debug!("suspend allowed");
                self.since = Some(Instant::now());
            }
            (false, Some(since)) => {
                debug!(slept = ?since.elapsed(), "stay active");
                self.since = None;
            }
            (false, None) => trace!("stay active"),
        }
    }
}

/// Logs state changes in place of an LED
#[derive(Debug, Default)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn show(&mut self, state: State) {
        trace!(%state, "indicator");
    }
}

/// Turns reboot requests into a clean shutdown of the process
#[derive(Debug)]
pub struct HostSystem {
    shutdown: CancellationToken,
    code: AtomicU8,
}

impl HostSystem {
    /// Reboots cancel `shutdown`
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            code: AtomicU8::new(0),
        }
    }

    /// Why the last reboot was requested
    pub fn reboot_code(&self) -> Option<RebootCode> {
        RebootCode::from_u8(self.code.load(Ordering::Acquire))
    }
}

impl System for HostSystem {
    fn reboot(&self, code: RebootCode) {
        warn!(%code, "reboot requested");
        self.code.store(code as u8, Ordering::Release);
        self.shutdown.cancel();
    }
}

/// Telemetry without application data
#[derive(Debug, Default)]
pub struct NoTelemetry;

impl TelemetrySource for NoTelemetry {
    fn lines(&mut self) -> Vec<String> {
        Vec::new()
    }
}

impl<F: FnMut() -> Vec<String> + Send> TelemetrySource for F {
    fn lines(&mut self) -> Vec<String> {
        self()
    }
}
