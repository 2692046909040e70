//! Low-level protocol logic for a CoAP telemetry and firmware-update client
//!
//! coaps-proto contains a fully deterministic implementation of the client's exchange engine. It
//! contains no networking code and does not get any relevant timestamps from the operating
//! system. Most users will want the tokio-based `coaps` crate instead.
//!
//! The most important types are `Exchange`, which drives one confirmable request at a time
//! through handshake, retransmission and acknowledgement, and `Update`, which layers a resumable
//! block-wise firmware download on top of it. DTLS is treated as an opaque record layer behind
//! the `Session` trait.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![cfg_attr(test, allow(dead_code))]

#[doc(hidden)]
pub mod coding;
pub use crate::coding::{BoundedBuf, Overflow, UnexpectedEnd};

mod config;
pub use crate::config::{ConfigError, ExchangeConfig, RecoveryConfig, UpdateConfig, MAX_TIMEOUT};

pub mod dtls;
pub use crate::dtls::{Credentials, DtlsEvent, Plain, Session, SessionError};

mod exchange;
pub use crate::exchange::{
    Event, Exchange, ExchangeError, Purpose, Request, State, Stats, TriggerError,
};

pub mod message;
pub use crate::message::{Block, BlockError, Code, DecodeError, Message, OptionNumber, Type};

pub mod power;

mod recovery;
pub use crate::recovery::{Escalation, Recovery};

mod retransmit;
pub use crate::retransmit::timeout_for;

mod timer;
pub use crate::timer::Timer;

pub mod update;
pub use crate::update::{
    CancelReason, FirmwareStore, ImageInfo, Progress, Status, Update, UpdateError,
};


/// Default CoAP port
pub const DEFAULT_PORT: u16 = 5683;
/// Default CoAP-over-DTLS port
pub const DEFAULT_SECURE_PORT: u16 = 5684;
