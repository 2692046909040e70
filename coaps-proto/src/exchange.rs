//! The request state machine
//!
//! An [`Exchange`] drives one confirmable request at a time from trigger to a terminal success or
//! failure. It performs no I/O: outgoing datagrams are collected with
//! [`Exchange::poll_transmit`], incoming ones are fed to [`Exchange::handle_datagram`], and the
//! caller is responsible for invoking [`Exchange::handle_timeout`] at the instant returned by
//! [`Exchange::poll_timeout`].

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    coding::Overflow,
    config::ExchangeConfig,
    dtls::{Alert, Credentials, DtlsEvent, Handshake, Session, SessionError},
    message::{Message, Token, Type},
    power,
    retransmit::{Backoff, Retransmission},
    timer::{Timer, TimerTable},
};

const TOKEN_LEN: usize = 4;

/// Position of the exchange in its lifecycle
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// Idle
    None,
    /// A datagram of the current exchange is waiting to be sent
    Send,
    /// Waiting for the response or the next handshake flight
    Receive,
    /// The request was acknowledged; waiting for the separate response
    WaitResponse,
    /// Acknowledging a confirmable response before completing
    SendAck,
    /// Finished; waiting for the radio to sleep or for the next trigger
    WaitSuspend,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::None => "none",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::WaitResponse => "wait response",
            Self::SendAck => "send ack",
            Self::WaitSuspend => "wait suspend",
        })
    }
}

/// Which consumer issued a request and receives its response
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Purpose {
    /// Periodic telemetry
    Telemetry,
    /// Block request of a firmware download
    Update,
}

/// A request ready to be started
///
/// The message ID and token are assigned by the exchange.
#[derive(Debug, Clone)]
pub struct Request {
    /// Who gets the response
    pub purpose: Purpose,
    /// The request; sent as confirmable
    pub message: Message,
}

/// Application-facing events
#[derive(Debug)]
pub enum Event {
    /// The state machine moved to a new state
    StateChanged(State),
    /// The exchange completed with a response
    Response {
        /// Who issued the request
        purpose: Purpose,
        /// The response message
        response: Message,
        /// Time from trigger to response
        rtt: Duration,
        /// Retransmissions it took
        retransmissions: u32,
    },
    /// The exchange failed
    Failed {
        /// Who issued the request
        purpose: Purpose,
        /// Why it failed
        error: ExchangeError,
    },
}

/// Reasons an exchange fails
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// No response after all retransmissions, or no separate response in time
    #[error("timed out after {retransmissions} retransmissions")]
    TimedOut {
        /// Retransmissions performed
        retransmissions: u32,
    },
    /// The peer rejected the request with a reset
    #[error("reset by peer")]
    Reset,
    /// The DTLS handshake was aborted
    #[error("handshake alert {0}")]
    Alert(Alert),
    /// The socket could not be recovered
    #[error("transport unavailable")]
    Transport,
    /// The record layer failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Reasons a trigger is refused
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Another exchange is in flight
    #[error("exchange in progress ({0})")]
    Busy(State),
    /// The request doesn't fit in a datagram
    #[error(transparent)]
    Encode(#[from] Overflow),
    /// The handshake could not be started
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Counters describing the exchanges so far
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Stats {
    /// Exchanges started
    pub exchanges: u64,
    /// Exchanges completed with a response
    pub successes: u64,
    /// Exchanges declared failed
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Datagrams and flights resent
    pub retransmissions: u64,
    /// Handshakes started
    pub handshakes: u64,
    /// Round-trip time of the last successful exchange
    pub last_rtt: Option<Duration>,
}

struct Current {
    purpose: Purpose,
    id: u16,
    token: Token,
    plain: Bytes,
    started: Instant,
    /// Confirmable response waiting for its acknowledgement to go out
    response: Option<Message>,
}

/// The request/response state machine for a single server
pub struct Exchange<S> {
    config: Arc<ExchangeConfig>,
    handshake: Handshake<S>,
    rtx: Retransmission,
    timers: TimerTable,
    state: State,
    current: Option<Current>,
    /// Datagrams queued behind the session's own records
    outbox: VecDeque<Bytes>,
    /// Last datagram handed out by `poll_transmit`
    in_flight: Option<Bytes>,
    /// Message ID and token of the last completed exchange, to re-acknowledge duplicates
    last: Option<(u16, Token)>,
    rng: StdRng,
    next_id: u16,
    link_ready: bool,
    radio_sleeping: bool,
    events: VecDeque<Event>,
    stats: Stats,
}

impl<S: Session> Exchange<S> {
    /// Create an idle exchange
    pub fn new(config: Arc<ExchangeConfig>, session: S, credentials: Credentials) -> Self {
        Self::with_rng(config, session, credentials, StdRng::from_entropy())
    }

    /// Create an idle exchange drawing IDs and tokens from `rng`
    pub fn with_rng(
        config: Arc<ExchangeConfig>,
        session: S,
        credentials: Credentials,
        mut rng: StdRng,
    ) -> Self {
        let next_id = rng.gen();
        Self {
            rtx: Retransmission::new(&config),
            config,
            handshake: Handshake::new(session, credentials),
            timers: TimerTable::default(),
            state: State::None,
            current: None,
            outbox: VecDeque::new(),
            in_flight: None,
            last: None,
            rng,
            next_id,
            link_ready: true,
            radio_sleeping: false,
            events: VecDeque::new(),
            stats: Stats::default(),
        }
    }

    /// Start an exchange
    ///
    /// Allowed only while idle or waiting to suspend. If the session needs a handshake, it runs
    /// first and the request follows as soon as it completes.
    pub fn trigger(&mut self, now: Instant, request: Request) -> Result<(), TriggerError> {
        if !matches!(self.state, State::None | State::WaitSuspend) {
            return Err(TriggerError::Busy(self.state));
        }

        let Request {
            purpose,
            mut message,
        } = request;
        let id = self.next_id;
        let mut token = [0; TOKEN_LEN];
        self.rng.fill(&mut token[..]);
        message.ty = Type::Confirmable;
        message.id = id;
        message.token = Token::new(&token);
        let plain = message.to_bytes(self.config.max_message_size)?;

        let handshake = self.handshake.begin()?;
        let record = match handshake {
            true => None,
            false => Some(self.handshake.session.seal(plain.clone())?),
        };
        self.next_id = self.next_id.wrapping_add(1);
        self.rtx.reset();
        self.timers.stop_all();
        self.outbox.clear();
        self.outbox.extend(record);
        self.stats.exchanges += 1;
        if handshake {
            self.stats.handshakes += 1;
        }
        debug!(?purpose, %message, handshake, "exchange started");
        self.current = Some(Current {
            purpose,
            id,
            token: message.token,
            plain,
            started: now,
            response: None,
        });
        self.set_state(State::Send);
        Ok(())
    }

    /// Next datagram to send
    ///
    /// Call repeatedly until it returns `None`; the flight counts as sent at that point and the
    /// retransmission timer starts. Report a failed send with [`Exchange::on_transmit_error`]
    /// before polling again.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        let next = self
            .handshake
            .session
            .poll_transmit()
            .or_else(|| self.outbox.pop_front());
        if let Some(datagram) = next {
            self.in_flight = Some(datagram.clone());
            return Some(datagram);
        }
        self.in_flight = None;

        match self.state {
            State::Send => {
                self.set_state(State::Receive);
                let deadline = self.rtx.arm(now);
                self.timers.set(Timer::Retransmit, deadline);
            }
            State::SendAck => {
                if let Some(response) = self.current.as_mut().and_then(|c| c.response.take()) {
                    self.succeed(now, response);
                }
            }
            _ => {}
        }
        None
    }

    /// The last datagram from `poll_transmit` could not be sent
    ///
    /// If the transport `recovered`, the datagram is queued again without counting as a
    /// retransmission. Otherwise the exchange fails.
    pub fn on_transmit_error(&mut self, recovered: bool) {
        let datagram = self.in_flight.take();
        if !self.is_active() {
            return;
        }
        match (recovered, datagram) {
            (true, Some(datagram)) => {
                debug!("transport recovered, resending");
                self.outbox.push_front(datagram);
            }
            _ => self.fail(ExchangeError::Transport),
        }
    }

    /// Process an incoming datagram
    pub fn handle_datagram(&mut self, now: Instant, datagram: Bytes) {
        let opened = self.handshake.session.open(datagram);
        self.process_session_events(now);
        let plain = match opened {
            Ok(Some(plain)) => plain,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping record: {}", e);
                return;
            }
        };
        let msg = match Message::decode(plain) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed message: {}", e);
                return;
            }
        };
        trace!(%msg, "received");
        self.handle_message(now, msg);
    }

    fn process_session_events(&mut self, now: Instant) {
        while let Some(event) = self.handshake.session.poll_event() {
            let was_pending = self.handshake.is_pending();
            self.handshake.on_event(event);
            if !self.is_active() {
                continue;
            }
            match event {
                DtlsEvent::Connecting => {}
                DtlsEvent::Connected if was_pending => {
                    // Handshake retransmissions don't count against the request
                    self.rtx.reset();
                    self.timers.stop(Timer::Retransmit);
                    let plain = match &self.current {
                        Some(current) => current.plain.clone(),
                        None => continue,
                    };
                    match self.handshake.session.seal(plain) {
                        Ok(record) => {
                            self.outbox.push_back(record);
                            self.set_state(State::Send);
                        }
                        Err(e) => self.fail(e.into()),
                    }
                }
                DtlsEvent::Connected => {}
                DtlsEvent::Alert(alert) => self.fail(ExchangeError::Alert(alert)),
            }
        }
    }

    fn handle_message(&mut self, now: Instant, msg: Message) {
        let waiting = matches!(self.state, State::Receive | State::WaitResponse);
        let current = match self.current.as_ref() {
            Some(current) if waiting && !self.handshake.is_pending() => current,
            _ => return self.handle_stray(msg),
        };

        match msg.ty {
            Type::Reset if msg.id == current.id => {
                self.fail(ExchangeError::Reset);
            }
            Type::Acknowledgement if msg.id == current.id => {
                if msg.is_empty() {
                    if self.state == State::Receive {
                        debug!("request acknowledged, awaiting separate response");
                        self.rtx.disarm();
                        self.timers.stop(Timer::Retransmit);
                        self.timers.set(
                            Timer::Response,
                            now + self.config.separate_response_timeout,
                        );
                        self.set_state(State::WaitResponse);
                    }
                } else if msg.token == current.token {
                    self.succeed(now, msg);
                } else {
                    debug!(token = %msg.token, "acknowledgement with foreign token");
                }
            }
            Type::Confirmable | Type::NonConfirmable
                if msg.token == current.token && !msg.code.is_request() && !msg.is_empty() =>
            {
                if msg.ty == Type::NonConfirmable {
                    return self.succeed(now, msg);
                }
                self.timers.stop_all();
                self.rtx.disarm();
                self.queue(Message::empty_ack(msg.id));
                if let Some(current) = self.current.as_mut() {
                    current.response = Some(msg);
                }
                self.set_state(State::SendAck);
            }
            _ => self.handle_stray(msg),
        }
    }

    /// A message that belongs to no active exchange
    fn handle_stray(&mut self, msg: Message) {
        if msg.ty != Type::Confirmable {
            trace!(%msg, "ignoring stray message");
            return;
        }
        match self.last {
            // Our acknowledgement of the last separate response was lost
            Some((_, token)) if token == msg.token && !msg.code.is_request() => {
                trace!(%msg, "acknowledging duplicate response");
                self.queue(Message::empty_ack(msg.id));
            }
            _ => {
                debug!(%msg, "rejecting unexpected confirmable message");
                self.queue(Message {
                    ty: Type::Reset,
                    ..Message::empty_ack(msg.id)
                });
            }
        }
    }

    fn queue(&mut self, msg: Message) {
        let plain = match msg.to_bytes(self.config.max_message_size) {
            Ok(plain) => plain,
            Err(e) => return debug!("could not queue {}: {}", msg, e),
        };
        match self.handshake.session.seal(plain) {
            Ok(record) => self.outbox.push_back(record),
            Err(e) => debug!("could not queue {}: {}", msg, e),
        }
    }

    /// Process expired timers
    pub fn handle_timeout(&mut self, now: Instant) {
        for timer in self.timers.take_expired(now).collect::<Vec<_>>() {
            match timer {
                Timer::Retransmit => self.on_retransmit_timeout(now),
                Timer::Response => {
                    let retransmissions = self.rtx.count();
                    self.fail(ExchangeError::TimedOut { retransmissions });
                }
            }
        }
    }

    fn on_retransmit_timeout(&mut self, now: Instant) {
        if self.state != State::Receive {
            return;
        }
        match self.rtx.on_timeout(self.link_ready) {
            Backoff::Extended(deadline) => self.timers.set(Timer::Retransmit, deadline),
            Backoff::Resend { attempt, timeout } => {
                self.stats.retransmissions += 1;
                debug!(attempt, ?timeout, handshake = self.handshake.is_pending(), "retransmitting");
                let result = if self.handshake.is_pending() {
                    self.handshake.retransmit()
                } else {
                    match &self.current {
                        Some(current) => {
                            let plain = current.plain.clone();
                            self.handshake
                                .session
                                .seal(plain)
                                .map(|record| self.outbox.push_back(record))
                        }
                        None => Ok(()),
                    }
                };
                match result {
                    Ok(()) => self.set_state(State::Send),
                    Err(e) => self.fail(e.into()),
                }
            }
            Backoff::Exhausted => {
                let retransmissions = self.rtx.count();
                self.fail(ExchangeError::TimedOut { retransmissions });
            }
        }
    }

    /// Earliest instant at which `handle_timeout` must be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Next application-facing event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether the network link is fully up
    ///
    /// While it isn't, retransmission deadlines are extended once per attempt.
    pub fn set_link_ready(&mut self, ready: bool) {
        self.link_ready = ready;
    }

    /// Whether the radio has entered its sleep state
    ///
    /// A sleeping radio ends the `WaitSuspend` state.
    pub fn set_radio_sleeping(&mut self, sleeping: bool) {
        self.radio_sleeping = sleeping;
        if sleeping && self.state == State::WaitSuspend {
            self.set_state(State::None);
        }
    }

    /// Force a full handshake before the next exchange
    pub fn reset_session(&mut self) {
        self.handshake.require_reset();
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a handshake is in progress
    pub fn is_handshaking(&self) -> bool {
        self.handshake.is_pending()
    }

    /// Counters so far
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Whether the device may suspend right now
    pub fn may_suspend(&self) -> bool {
        power::may_suspend(self.radio_sleeping, self.state)
    }

    /// The record-layer session
    pub fn session(&self) -> &S {
        &self.handshake.session
    }

    /// The record-layer session
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.handshake.session
    }

    fn is_active(&self) -> bool {
        !matches!(self.state, State::None | State::WaitSuspend)
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        trace!("{} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(Event::StateChanged(state));
    }

    fn succeed(&mut self, now: Instant, response: Message) {
        let current = match self.current.take() {
            Some(current) => current,
            None => return,
        };
        let rtt = now.saturating_duration_since(current.started);
        let retransmissions = self.rtx.count();
        self.stats.successes += 1;
        self.stats.consecutive_failures = 0;
        self.stats.last_rtt = Some(rtt);
        debug!(code = %response.code, ?rtt, retransmissions, "exchange succeeded");
        self.last = Some((current.id, current.token));
        self.finish();
        self.events.push_back(Event::Response {
            purpose: current.purpose,
            response,
            rtt,
            retransmissions,
        });
        self.set_state(State::WaitSuspend);
    }

    fn fail(&mut self, error: ExchangeError) {
        let current = match self.current.take() {
            Some(current) => current,
            None => return,
        };
        self.stats.failures += 1;
        self.stats.consecutive_failures += 1;
        warn!(
            purpose = ?current.purpose,
            consecutive = self.stats.consecutive_failures,
            "exchange failed: {}",
            error
        );
        if self.handshake.is_pending() {
            self.handshake.abandon();
        }
        self.finish();
        self.outbox.clear();
        self.events.push_back(Event::Failed {
            purpose: current.purpose,
            error,
        });
        self.set_state(State::WaitSuspend);
    }

    fn finish(&mut self) {
        self.timers.stop_all();
        self.rtx.disarm();
    }
}

impl<S> fmt::Debug for Exchange<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
