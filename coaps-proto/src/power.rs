//! Power/idle liaison between the exchange and an external power manager

use tracing::trace;

use crate::exchange::State;

/// Whether the device may enter its low-power state
///
/// Only an idle exchange on a sleeping radio may suspend. Every other state, including a pending
/// acknowledgement or an unfinished handshake, keeps the device active.
pub fn may_suspend(radio_sleeping: bool, state: State) -> bool {
    radio_sleeping && state == State::None
}

/// Signal for the external power manager
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Suspend {
    /// Safe to suspend
    Allowed,
    /// Must stay active
    StayActive,
}

/// Reports suspend permission whenever it changes
#[derive(Debug, Default)]
pub struct Liaison {
    last: Option<Suspend>,
}

impl Liaison {
    /// Re-evaluate after a state or radio change, returning the new signal if it differs
    pub fn update(&mut self, radio_sleeping: bool, state: State) -> Option<Suspend> {
        let signal = match may_suspend(radio_sleeping, state) {
            true => Suspend::Allowed,
            false => Suspend::StayActive,
        };
        if self.last == Some(signal) {
            return None;
        }
        trace!(?signal, ?state, radio_sleeping, "suspend permission changed");
        self.last = Some(signal);
        Some(signal)
    }
}
