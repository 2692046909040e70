//! Cellular CoAP/DTLS telemetry client with resumable firmware download
//!
//! The protocol state machines live in the runtime-independent [`proto`] crate. This crate drives
//! them with tokio: it owns the UDP socket, runs the foreground engine loop, schedules background
//! work such as flash erases and the telemetry timer, and exposes a cloneable [`Client`] handle
//! for operators and tests.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use coaps::{proto, Client, ClientConfig, Platform};
//!
//! let config = ClientConfig::default();
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! let platform = Platform::host("/var/lib/coaps", shutdown.clone())?;
//! let (client, driver) = Client::start(
//!     &config,
//!     proto::Plain,
//!     proto::Credentials::default(),
//!     platform,
//! )?;
//! client.trigger();
//! driver.await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use proto::{
    update::ApplyAction, CancelReason, Code, ConfigError, Credentials, ExchangeError,
    FirmwareStore, Purpose, Recovery, Session, State, Stats, Status, Update, UpdateError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod engine;
mod mutex;
pub mod platform;
mod power;
mod store;
mod tasks;
mod telemetry;
mod udp;

pub use crate::config::ClientConfig;
pub use crate::platform::RebootCode;
pub use crate::store::FileStore;
pub use crate::telemetry::Reply;

pub use proto;

use crate::{
    engine::Engine,
    mutex::Mutex,
    platform::{
        HostModem, HostSystem, Indicator, LogIndicator, LogPower, Modem, NoTelemetry,
        PowerManager, System, TelemetrySource,
    },
    tasks::TaskQueue,
};

#[cfg(test)]
mod tests;

/// Delay before a scheduled reboot, so the triggering event can still be logged and reported
const REBOOT_DELAY: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 64;

/// The device around the engine
pub struct Platform {
    /// Cellular modem
    pub modem: Box<dyn Modem>,
    /// Power manager informed about suspend permission
    pub power: Box<dyn PowerManager>,
    /// Status indicator
    pub indicator: Box<dyn Indicator>,
    /// Reboot and watchdog
    pub system: Arc<dyn System>,
    /// Flash staging area and boot-loader
    pub store: Box<dyn FirmwareStore + Send>,
    /// Application data for telemetry messages
    pub telemetry: Box<dyn TelemetrySource>,
}

impl Platform {
    /// Host implementations staging firmware in `dir`; reboots cancel `shutdown`
    pub fn host(dir: impl Into<PathBuf>, shutdown: CancellationToken) -> io::Result<Self> {
        Ok(Self {
            modem: Box::new(HostModem::new()),
            power: Box::<LogPower>::default(),
            indicator: Box::new(LogIndicator),
            system: Arc::new(HostSystem::new(shutdown)),
            store: Box::new(FileStore::open(dir)?),
            telemetry: Box::new(NoTelemetry),
        })
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Errors starting a [`Client`]
#[derive(Debug, Error)]
pub enum StartError {
    /// The configuration is out of bounds
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The socket could not be created; a reboot was requested
    #[error("socket unavailable: {0}")]
    Socket(#[from] io::Error),
}

/// Something the client did, for tooling and tests
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// An exchange completed
    Succeeded {
        /// Who issued the request
        purpose: Purpose,
        /// Response code
        code: Code,
        /// Time from trigger to response
        rtt: Duration,
    },
    /// An exchange failed
    Failed {
        /// Who issued the request
        purpose: Purpose,
        /// Why it failed
        error: ExchangeError,
    },
    /// The server answered a telemetry message
    Telemetry(Reply),
    /// A firmware image was downloaded and staged
    UpdateFinished {
        /// Whether a reboot into it was scheduled
        apply: bool,
    },
    /// A firmware download stopped
    UpdateCanceled(CancelReason),
    /// A recovery step was taken after repeated failures
    Recovery(Recovery),
    /// A reboot was requested
    Reboot(RebootCode),
}

/// Exchange state and counters as last published by the engine
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub(crate) state: State,
    pub(crate) stats: Stats,
}

pub(crate) struct Shared {
    /// Coalesced trigger signal for the engine
    pub(crate) wake: Notify,
    pub(crate) telemetry_due: AtomicBool,
    pub(crate) radio_sleeping: AtomicBool,
    pub(crate) interval: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskQueue,
    // Lock order: `update` before `store`
    pub(crate) update: Mutex<Update>,
    pub(crate) store: Mutex<Box<dyn FirmwareStore + Send>>,
    pub(crate) snapshot: Mutex<Snapshot>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) system: Arc<dyn System>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn reboot_now(&self, code: RebootCode) {
        self.emit(ClientEvent::Reboot(code));
        self.system.reboot(code);
    }

    pub(crate) fn schedule_reboot(self: &Arc<Self>, code: RebootCode) {
        info!(%code, delay = ?REBOOT_DELAY, "reboot scheduled");
        let shared = self.clone();
        self.tasks
            .schedule("reboot", REBOOT_DELAY, move || shared.reboot_now(code));
    }

    pub(crate) fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.load(Ordering::Relaxed))
    }
}

/// Handle to a running client
///
/// Cheap to clone. Every method is non-blocking; the engine picks up requests on its next cycle.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Open the socket and spawn the engine
    ///
    /// Must be called from within a tokio runtime. The returned handle resolves once the engine
    /// stops after [`Client::shutdown`] or a reboot request.
    pub fn start<S: Session + 'static>(
        config: &ClientConfig,
        session: S,
        credentials: Credentials,
        platform: Platform,
    ) -> Result<(Self, JoinHandle<()>), StartError> {
        let exchange_config = Arc::new(config.exchange_config()?);
        let update_config = config.update_config()?;
        let recovery_config = config.recovery_config()?;

        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            wake: Notify::new(),
            telemetry_due: AtomicBool::new(false),
            radio_sleeping: AtomicBool::new(false),
            interval: AtomicU64::new(config.interval_secs.max(1)),
            tasks: TaskQueue::new(shutdown.clone()),
            shutdown,
            update: Mutex::new("update", Update::new(update_config)),
            store: Mutex::new("store", platform.store),
            snapshot: Mutex::new(
                "snapshot",
                Snapshot {
                    state: State::None,
                    stats: Stats::default(),
                },
            ),
            events,
            system: platform.system,
        });

        let engine = Engine::new(
            shared.clone(),
            config,
            exchange_config,
            recovery_config,
            session,
            credentials,
            platform.modem,
            platform.power,
            platform.indicator,
            platform.telemetry,
        );
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                shared.reboot_now(RebootCode::Socket);
                shared.shutdown.cancel();
                return Err(e.into());
            }
        };
        let driver = tokio::spawn(engine.run());
        Ok((Self { shared }, driver))
    }

    /// Send telemetry as soon as the engine is idle
    ///
    /// Repeated triggers before the engine gets to it result in a single message.
    pub fn trigger(&self) {
        self.shared.telemetry_due.store(true, Ordering::Release);
        self.shared.wake();
    }

    /// Start downloading firmware `resource`, optionally rebooting into it when done
    ///
    /// The staging area is erased in the background; the first block is requested afterwards.
    /// Fails with [`UpdateError::Busy`] while a download, or the erase of a canceled one, is
    /// still running.
    pub fn download(&self, resource: &str, apply: bool) -> Result<(), UpdateError> {
        self.shared.update.lock("download").download(resource, apply)?;
        let shared = self.shared.clone();
        self.shared
            .tasks
            .schedule_blocking("erase", Duration::ZERO, move || erase(&shared));
        Ok(())
    }

    /// Download `resource` and reboot into it when done
    pub fn update(&self, resource: &str) -> Result<(), UpdateError> {
        self.download(resource, true)
    }

    /// Reboot into the staged image, or arrange to once the running download finishes
    pub fn apply(&self) -> Result<ApplyAction, UpdateError> {
        let action = self.shared.update.lock("apply").apply()?;
        match action {
            ApplyAction::RebootNow => self.shared.schedule_reboot(RebootCode::Update),
            ApplyAction::OnFinish => info!("image will be applied when the download finishes"),
        }
        Ok(action)
    }

    /// Stop the firmware download, or discard the staged image
    ///
    /// Returns whether there was anything to cancel. Canceling again has no effect.
    pub fn cancel(&self) -> bool {
        let canceled = {
            let mut update = self.shared.update.lock("cancel");
            let before = update.status();
            if let Some(abort) = update.cancel(CancelReason::Command) {
                abort.apply(&mut **self.shared.store.lock("cancel"));
            }
            update.status() != before
        };
        if canceled {
            self.shared.emit(ClientEvent::UpdateCanceled(CancelReason::Command));
        }
        canceled
    }

    /// Current exchange and update status
    pub fn status(&self) -> ClientStatus {
        let snapshot = *self.shared.snapshot.lock("status");
        let update = self.shared.update.lock("status").status();
        ClientStatus {
            state: snapshot.state.to_string(),
            stats: snapshot.stats.into(),
            interval_secs: self.shared.interval().as_secs(),
            update: UpdateReport::from(&update),
        }
    }

    /// Exchange counters
    pub fn stats(&self) -> Stats {
        self.shared.snapshot.lock("stats").stats
    }

    /// Report whether the radio entered its sleep state
    pub fn set_radio_sleeping(&self, sleeping: bool) {
        self.shared.radio_sleeping.store(sleeping, Ordering::Release);
        self.shared.wake();
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the engine and all background tasks
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Background half of [`Client::download`]
fn erase(shared: &Arc<Shared>) {
    let result = shared.store.lock("erase").erase();
    let failed = result.is_err();
    let (erased, reason) = {
        let mut update = shared.update.lock("erase complete");
        let erased = update.erase_complete(result);
        (erased, update.status().reason)
    };
    match erased {
        proto::update::Erased::Ready => shared.wake(),
        proto::update::Erased::Canceled(abort) => {
            if let Some(abort) = abort {
                abort.apply(&mut **shared.store.lock("abort"));
            }
            if failed && reason == Some(CancelReason::NotAvailable) {
                shared.emit(ClientEvent::UpdateCanceled(CancelReason::NotAvailable));
            } else if failed {
                warn!("erase failed after cancel");
            }
        }
    }
}

/// Status report, printable or serializable as JSON
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Exchange state
    pub state: String,
    /// Exchange counters
    pub stats: StatsReport,
    /// Current telemetry interval
    pub interval_secs: u64,
    /// Firmware update record
    pub update: UpdateReport,
}

impl ClientStatus {
    /// Render as JSON
    pub fn to_json(&self) -> String {
        // Plain data with string keys always serializes
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state: {}", self.state)?;
        writeln!(
            f,
            "exchanges: {} ok, {} failed ({} in a row), {} retransmissions",
            self.stats.successes,
            self.stats.failures,
            self.stats.consecutive_failures,
            self.stats.retransmissions
        )?;
        if let Some(rtt) = self.stats.last_rtt_ms {
            writeln!(f, "last rtt: {rtt} ms")?;
        }
        writeln!(f, "interval: {} s", self.interval_secs)?;
        write!(f, "update: {}", self.update.summary)
    }
}

/// Serializable form of [`Stats`]
#[derive(Debug, Clone, Copy, Serialize)]
#[allow(missing_docs)]
pub struct StatsReport {
    pub exchanges: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub retransmissions: u64,
    pub handshakes: u64,
    pub last_rtt_ms: Option<u64>,
}

impl From<Stats> for StatsReport {
    fn from(stats: Stats) -> Self {
        Self {
            exchanges: stats.exchanges,
            successes: stats.successes,
            failures: stats.failures,
            consecutive_failures: stats.consecutive_failures,
            retransmissions: stats.retransmissions,
            handshakes: stats.handshakes,
            last_rtt_ms: stats.last_rtt.map(|rtt| rtt.as_millis() as u64),
        }
    }
}

/// Serializable form of the update [`Status`]
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    /// Human-readable one-liner
    pub summary: String,
    /// `idle`, `erasing`, `downloading`, `ready` or `canceled`
    pub phase: String,
    /// Resource of the last download
    pub resource: Option<String>,
    /// Bytes received
    pub offset: u64,
    /// Announced size
    pub total: Option<u64>,
    /// Whether the image is applied when done
    pub apply: bool,
    /// Stable name of the cancellation reason
    pub reason: Option<&'static str>,
    /// Stable code of the cancellation reason
    pub reason_code: Option<u8>,
}

impl From<&Status> for UpdateReport {
    fn from(status: &Status) -> Self {
        Self {
            summary: status.to_string(),
            phase: status.phase.to_string(),
            resource: status.resource.clone(),
            offset: status.offset,
            total: status.total,
            apply: status.apply,
            reason: status.reason.map(CancelReason::as_str),
            reason_code: status.reason.map(CancelReason::code),
        }
    }
}
