//! The foreground engine loop
//!
//! A single task owns the exchange state machine and the socket. It blocks only in one bounded
//! wait for a datagram, a timer, the wake signal or shutdown; everything else is non-blocking
//! state transition logic.

use std::{
    io,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use bytes::Bytes;
use proto::{
    power::Liaison, update::Progress, Credentials, Escalation, Event, Exchange, ExchangeConfig,
    ExchangeError, Message, Purpose, Recovery, RecoveryConfig, Request, Session, State,
    TriggerError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    config::ClientConfig,
    platform::{Indicator, Modem, PowerManager, RebootCode, TelemetrySource},
    power::SuspendDebounce,
    telemetry::{Reply, Telemetry},
    udp::SocketManager,
    ClientEvent, Shared, Snapshot,
};

const MAX_DATAGRAM: usize = u16::MAX as usize;

enum Input {
    Shutdown,
    Wake,
    Datagram(io::Result<usize>),
    Timer,
}

pub(crate) struct Engine<S> {
    shared: Arc<Shared>,
    exchange: Exchange<S>,
    socket: SocketManager,
    telemetry: Telemetry,
    telemetry_timer: CancellationToken,
    escalation: Escalation,
    liaison: Liaison,
    debounce: SuspendDebounce,
    indicator: Box<dyn Indicator>,
    poll_interval: Duration,
    /// The running image was confirmed, or found confirmed, this boot
    confirmed: bool,
}

impl<S: Session + 'static> Engine<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: &ClientConfig,
        exchange_config: Arc<ExchangeConfig>,
        recovery_config: RecoveryConfig,
        session: S,
        credentials: Credentials,
        modem: Box<dyn Modem>,
        power: Box<dyn PowerManager>,
        indicator: Box<dyn Indicator>,
        source: Box<dyn TelemetrySource>,
    ) -> io::Result<Self> {
        let mut socket = SocketManager::new(
            config.destination,
            config.local,
            config.release_assistance,
            modem,
        );
        socket.open()?;
        let telemetry = Telemetry::new(
            config.telemetry_path.clone(),
            config.telemetry_query.clone(),
            exchange_config.get_max_message_size(),
            source,
        );
        Ok(Self {
            telemetry_timer: telemetry_timer(&shared),
            shared,
            exchange: Exchange::new(exchange_config, session, credentials),
            socket,
            telemetry,
            escalation: Escalation::new(recovery_config),
            liaison: Liaison::default(),
            debounce: SuspendDebounce::new(config.suspend_debounce(), power),
            indicator,
            poll_interval: config.poll_interval(),
            confirmed: false,
        })
    }

    pub(crate) async fn run(mut self) {
        let span = info_span!("engine");
        async {
            self.drive().await;
            self.debounce.cancel();
            self.shared.shutdown.cancel();
            info!("engine stopped");
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            let now = clock();
            self.service(now).await;
            self.publish();

            let bound = now + self.poll_interval;
            let deadline = self
                .exchange
                .poll_timeout()
                .map_or(bound, |timeout| timeout.min(bound));
            let input = tokio::select! {
                _ = self.shared.shutdown.cancelled() => Input::Shutdown,
                _ = self.shared.wake.notified() => Input::Wake,
                result = self.socket.recv(&mut buf) => Input::Datagram(result),
                _ = tokio::time::sleep_until(deadline.into()) => Input::Timer,
            };

            match input {
                Input::Shutdown => break,
                Input::Wake => trace!("woken"),
                Input::Datagram(Ok(n)) => {
                    let datagram = Bytes::copy_from_slice(&buf[..n]);
                    self.exchange.handle_datagram(clock(), datagram);
                }
                Input::Datagram(Err(e)) => {
                    // Typically an ICMP error surfacing on the connected socket
                    if !self.socket.recover(&e) {
                        warn!(reopens = self.socket.reopens(), "socket unavailable");
                    }
                }
                Input::Timer => self.shared.system.feed_watchdog(),
            }
        }
    }

    /// One cycle of non-blocking work
    async fn service(&mut self, now: Instant) {
        self.exchange.handle_timeout(now);
        self.exchange.set_link_ready(self.socket.link_ready());
        let sleeping = self.shared.radio_sleeping.load(Ordering::Acquire);
        self.exchange.set_radio_sleeping(sleeping);

        loop {
            self.start_request(now);
            self.flush(now).await;
            // A response may leave more work, like the next block; a failure waits for the next
            // cycle
            if !self.handle_events() {
                break;
            }
        }
        self.update_liaison();
    }

    fn start_request(&mut self, now: Instant) {
        if !matches!(self.exchange.state(), State::None | State::WaitSuspend) {
            return;
        }

        let result = {
            let mut update = self.shared.update.lock("request");
            match update.pending_request() {
                Some(message) => {
                    let result = self.exchange.trigger(
                        now,
                        Request {
                            purpose: Purpose::Update,
                            message,
                        },
                    );
                    match &result {
                        Ok(()) => update.requested(),
                        Err(TriggerError::Encode(_)) => {
                            if let Some(abort) = update.cancel(proto::CancelReason::NotAvailable) {
                                abort.apply(&mut **self.shared.store.lock("request"));
                            }
                        }
                        Err(_) => {}
                    }
                    Some(result)
                }
                None => None,
            }
        };
        match result {
            Some(Ok(())) => return,
            Some(Err(e)) => {
                if let TriggerError::Encode(_) = e {
                    self.shared.emit(ClientEvent::UpdateCanceled(
                        proto::CancelReason::NotAvailable,
                    ));
                }
                self.trigger_failed(e);
            }
            None => {}
        }

        if !self.shared.telemetry_due.swap(false, Ordering::AcqRel) {
            return;
        }
        let message = self.telemetry.request(now);
        let result = self.exchange.trigger(
            now,
            Request {
                purpose: Purpose::Telemetry,
                message,
            },
        );
        match result {
            Ok(()) => debug!(sequence = self.telemetry.sequence(), "telemetry triggered"),
            Err(e) => {
                if let TriggerError::Busy(_) = e {
                    self.shared.telemetry_due.store(true, Ordering::Release);
                }
                self.trigger_failed(e);
            }
        }
    }

    fn trigger_failed(&mut self, error: TriggerError) {
        match error {
            TriggerError::Busy(state) => trace!(%state, "busy, trigger kept"),
            TriggerError::Encode(e) => warn!("request dropped: {}", e),
            TriggerError::Session(e) => {
                error!("handshake engine failed: {}", e);
                self.shared.reboot_now(RebootCode::Session);
            }
        }
    }

    /// Send everything the exchange has queued
    async fn flush(&mut self, now: Instant) {
        let mut recovered = false;
        while let Some(datagram) = self.exchange.poll_transmit(now) {
            match self.socket.send(&datagram).await {
                Ok(()) => recovered = false,
                Err(e) => {
                    // Each datagram gets one recovery attempt
                    let retry = !recovered && self.socket.recover(&e);
                    if !retry {
                        warn!("send failed: {}", e);
                    }
                    self.exchange.on_transmit_error(retry);
                    recovered = retry;
                }
            }
        }
    }

    /// Dispatch exchange events, returning whether a response arrived
    fn handle_events(&mut self) -> bool {
        let mut responded = false;
        while let Some(event) = self.exchange.poll() {
            match event {
                Event::StateChanged(state) => {
                    self.indicator.show(state);
                    self.update_liaison();
                }
                Event::Response {
                    purpose,
                    response,
                    rtt,
                    retransmissions,
                } => {
                    debug!(?purpose, code = %response.code, ?rtt, retransmissions, "response");
                    responded = true;
                    self.shared.emit(ClientEvent::Succeeded {
                        purpose,
                        code: response.code,
                        rtt,
                    });
                    self.confirm_image();
                    match purpose {
                        Purpose::Telemetry => self.on_telemetry(&response),
                        Purpose::Update => self.on_block(&response),
                    }
                }
                Event::Failed { purpose, error } => self.on_failure(purpose, error),
            }
        }
        responded
    }

    fn on_telemetry(&mut self, response: &Message) {
        let reply = Reply::parse(response);
        if let Some(interval) = reply.interval {
            self.set_interval(interval);
        }
        self.shared.emit(ClientEvent::Telemetry(reply));
    }

    fn on_block(&mut self, response: &Message) {
        let progress = {
            let mut update = self.shared.update.lock("block");
            // The erase task holds the store; nothing is written until it reports back
            if update.awaits_block() {
                let mut store = self.shared.store.lock("block");
                match update.handle_response(response, &mut **store) {
                    Progress::Canceled(reason, abort) => {
                        if let Some(abort) = abort {
                            abort.apply(&mut **store);
                        }
                        Progress::Canceled(reason, None)
                    }
                    progress => progress,
                }
            } else {
                Progress::Ignored
            }
        };
        match progress {
            Progress::Ignored => debug!("block response without a download"),
            Progress::Next => {}
            Progress::Finished { apply } => {
                self.shared.emit(ClientEvent::UpdateFinished { apply });
                if apply {
                    self.shared.schedule_reboot(RebootCode::Update);
                }
            }
            Progress::Canceled(reason, _) => {
                self.shared.emit(ClientEvent::UpdateCanceled(reason))
            }
        }
    }

    fn on_failure(&mut self, purpose: Purpose, error: ExchangeError) {
        if purpose == Purpose::Update {
            self.shared.update.lock("failure").exchange_failed();
        }
        self.shared.emit(ClientEvent::Failed { purpose, error });

        let consecutive = self.exchange.stats().consecutive_failures;
        let step = self.escalation.on_failure(consecutive);
        match step {
            Recovery::None => return,
            Recovery::ResetSession => self.exchange.reset_session(),
            Recovery::RestartModem => {
                if let Err(e) = self.socket.restart_modem() {
                    warn!("modem restart failed: {}", e);
                }
            }
            Recovery::Reboot => {}
        }
        self.shared.emit(ClientEvent::Recovery(step));
        if step == Recovery::Reboot {
            self.shared.reboot_now(RebootCode::Recovery);
        }
    }

    /// Mark the running image good after the first successful exchange
    fn confirm_image(&mut self) {
        if self.confirmed {
            return;
        }
        self.confirmed = true;
        let shared = self.shared.clone();
        self.shared
            .tasks
            .schedule_blocking("confirm", Duration::ZERO, move || confirm(&shared));
    }

    fn set_interval(&mut self, secs: u32) {
        let secs = u64::from(secs);
        if secs == 0 || secs == self.shared.interval.load(Ordering::Relaxed) {
            return;
        }
        info!(secs, "send interval changed");
        self.shared.interval.store(secs, Ordering::Relaxed);
        self.telemetry_timer.cancel();
        self.telemetry_timer = telemetry_timer(&self.shared);
    }

    fn update_liaison(&mut self) {
        let sleeping = self.shared.radio_sleeping.load(Ordering::Acquire);
        if let Some(signal) = self.liaison.update(sleeping, self.exchange.state()) {
            self.debounce.signal(&self.shared.tasks, signal);
        }
    }

    fn publish(&self) {
        *self.shared.snapshot.lock("publish") = Snapshot {
            state: self.exchange.state(),
            stats: self.exchange.stats(),
        };
    }
}

/// Background half of `Engine::confirm_image`; may wait for a running erase
fn confirm(shared: &Shared) {
    let mut store = shared.store.lock("confirm");
    if store.is_confirmed() {
        return;
    }
    match store.confirm() {
        Ok(()) => info!("running image confirmed"),
        Err(e) => warn!("confirming image failed: {}", e),
    }
}

/// Periodically request telemetry at the shared interval
fn telemetry_timer(shared: &Arc<Shared>) -> CancellationToken {
    let period = shared.clone();
    let due = shared.clone();
    shared.tasks.periodic(
        "telemetry",
        move || period.interval(),
        move || {
            due.telemetry_due.store(true, Ordering::Release);
            due.wake();
        },
    )
}

fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}
