//! DTLS handshake coordination
//!
//! The record layer itself is an opaque [`Session`]; this module only tracks whether a handshake
//! is pending and whether the security context must be discarded before the next exchange.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Capability interface of a DTLS record-layer engine
///
/// Implementations queue outgoing records internally and hand them out through
/// [`Session::poll_transmit`]. Handshake progress is reported through [`Session::poll_event`].
pub trait Session: Send {
    /// Whether a handshake must complete before application data can be sealed
    fn needs_handshake(&self) -> bool;
    /// Begin a handshake with `credentials`, queueing its first flight
    fn start_handshake(&mut self, credentials: &Credentials) -> Result<(), SessionError>;
    /// Queue the current handshake flight again
    fn retransmit_handshake(&mut self) -> Result<(), SessionError>;
    /// Next record to put on the wire
    fn poll_transmit(&mut self) -> Option<Bytes>;
    /// Protect an application datagram
    fn seal(&mut self, plaintext: Bytes) -> Result<Bytes, SessionError>;
    /// Process a record from the peer, yielding application data if it carried any
    fn open(&mut self, record: Bytes) -> Result<Option<Bytes>, SessionError>;
    /// Next handshake event
    fn poll_event(&mut self) -> Option<DtlsEvent>;
    /// Discard all security context so the next exchange performs a full handshake
    fn reset(&mut self);
    /// Whether the established session carries a connection ID and survives address changes
    fn uses_connection_id(&self) -> bool {
        false
    }
}

/// Unsecured CoAP: datagrams pass through unchanged
#[derive(Debug, Default)]
pub struct Plain;

impl Session for Plain {
    fn needs_handshake(&self) -> bool {
        false
    }

    fn start_handshake(&mut self, _: &Credentials) -> Result<(), SessionError> {
        Ok(())
    }

    fn retransmit_handshake(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn poll_transmit(&mut self) -> Option<Bytes> {
        None
    }

    fn seal(&mut self, plaintext: Bytes) -> Result<Bytes, SessionError> {
        Ok(plaintext)
    }

    fn open(&mut self, record: Bytes) -> Result<Option<Bytes>, SessionError> {
        Ok(Some(record))
    }

    fn poll_event(&mut self) -> Option<DtlsEvent> {
        None
    }

    fn reset(&mut self) {}
}

/// Handshake progress reported by a [`Session`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DtlsEvent {
    /// The handshake is under way
    Connecting,
    /// The session is established and application data may flow
    Connected,
    /// The peer or the local engine aborted with an alert
    Alert(Alert),
}

/// TLS alert description
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Alert(pub u8);

impl Alert {
    #![allow(missing_docs)]
    pub const CLOSE_NOTIFY: Self = Self(0);
    pub const UNEXPECTED_MESSAGE: Self = Self(10);
    pub const BAD_RECORD_MAC: Self = Self(20);
    pub const HANDSHAKE_FAILURE: Self = Self(40);
    pub const BAD_CERTIFICATE: Self = Self(42);
    pub const ILLEGAL_PARAMETER: Self = Self(47);
    pub const DECRYPT_ERROR: Self = Self(51);
    pub const INTERNAL_ERROR: Self = Self(80);
    pub const UNKNOWN_PSK_IDENTITY: Self = Self(115);
}

impl fmt::Debug for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::CLOSE_NOTIFY => "CLOSE_NOTIFY",
            Self::UNEXPECTED_MESSAGE => "UNEXPECTED_MESSAGE",
            Self::BAD_RECORD_MAC => "BAD_RECORD_MAC",
            Self::HANDSHAKE_FAILURE => "HANDSHAKE_FAILURE",
            Self::BAD_CERTIFICATE => "BAD_CERTIFICATE",
            Self::ILLEGAL_PARAMETER => "ILLEGAL_PARAMETER",
            Self::DECRYPT_ERROR => "DECRYPT_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::UNKNOWN_PSK_IDENTITY => "UNKNOWN_PSK_IDENTITY",
            _ => return write!(f, "Alert({})", self.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failures of the record-layer engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The engine could not be set up; not recoverable in-process
    #[error("handshake engine unavailable: {0}")]
    Init(String),
    /// A record could not be protected or verified
    #[error("record rejected: {0}")]
    Record(String),
    /// Application data was offered before the handshake finished
    #[error("session not established")]
    NotConnected,
}

/// Pre-shared key credential
#[derive(Clone)]
pub struct Psk {
    /// Identity sent in the clear
    pub identity: Bytes,
    /// Secret key
    pub key: Bytes,
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Psk")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .finish_non_exhaustive()
    }
}

/// Raw-public-key credential on P-256
#[derive(Clone)]
pub struct EcdsaKey {
    /// Private scalar
    pub private: Bytes,
    /// Uncompressed public point
    pub public: Bytes,
}

impl fmt::Debug for EcdsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdsaKey")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

/// Decides whether a peer's public key is trusted
pub type PeerVerifier = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Credential slots handed to the [`Session`] at handshake start
#[derive(Clone, Default)]
pub struct Credentials {
    /// Pre-shared key
    pub psk: Option<Psk>,
    /// Own ECDSA key pair
    pub ecdsa: Option<EcdsaKey>,
    /// Peer public key check used with `ecdsa`
    pub verify_peer: Option<PeerVerifier>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("psk", &self.psk)
            .field("ecdsa", &self.ecdsa)
            .field("verify_peer", &self.verify_peer.is_some())
            .finish()
    }
}

/// Tracks the handshake on behalf of the exchange state machine
pub(crate) struct Handshake<S> {
    pub(crate) session: S,
    credentials: Credentials,
    pending: bool,
    reset_required: bool,
}

impl<S: Session> Handshake<S> {
    pub(crate) fn new(session: S, credentials: Credentials) -> Self {
        Self {
            session,
            credentials,
            pending: false,
            reset_required: false,
        }
    }

    /// Start a handshake if the session needs one, returning whether it is pending
    pub(crate) fn begin(&mut self) -> Result<bool, SessionError> {
        if self.reset_required {
            debug!("discarding security context");
            self.session.reset();
            self.reset_required = false;
        }
        if self.session.needs_handshake() {
            self.session.start_handshake(&self.credentials)?;
            self.pending = true;
        }
        Ok(self.pending)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn retransmit(&mut self) -> Result<(), SessionError> {
        self.session.retransmit_handshake()
    }

    /// Stop tracking an unfinished handshake; the next exchange starts over
    pub(crate) fn abandon(&mut self) {
        self.pending = false;
    }

    /// Force a full handshake before the next exchange
    pub(crate) fn require_reset(&mut self) {
        self.reset_required = true;
    }

    pub(crate) fn on_event(&mut self, event: DtlsEvent) {
        match event {
            DtlsEvent::Connecting => trace!("handshake in progress"),
            DtlsEvent::Connected => {
                debug!(cid = self.session.uses_connection_id(), "handshake complete");
                self.pending = false;
            }
            DtlsEvent::Alert(alert) => {
                warn!(%alert, "handshake aborted");
                self.pending = false;
                self.reset_required = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_is_redacted() {
        let creds = Credentials {
            psk: Some(Psk {
                identity: Bytes::from_static(b"cali.352656"),
                key: Bytes::from_static(b"secret"),
            }),
            ..Credentials::default()
        };
        let text = format!("{creds:?}");
        assert!(text.contains("cali.352656"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn alert_forces_reset() {
        let mut hs = Handshake::new(Plain, Credentials::default());
        assert!(!hs.begin().unwrap());
        hs.on_event(DtlsEvent::Alert(Alert::HANDSHAKE_FAILURE));
        assert!(hs.reset_required);
        hs.begin().unwrap();
        assert!(!hs.reset_required);
        assert_eq!(Alert(99).to_string(), "Alert(99)");
    }
}
