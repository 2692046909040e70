use std::{
    ops::{Index, IndexMut},
    time::Instant,
};

/// Kinds of timeouts needed to run an exchange
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum Timer {
    /// When to resend the request or handshake flight, or give up
    Retransmit = 0,
    /// When to stop waiting for a separate response
    Response = 1,
}

impl Timer {
    pub(crate) const VALUES: [Self; 2] = [Self::Retransmit, Self::Response];
}

/// Deadlines of each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 2],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self[timer] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self[timer]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self[timer] = None;
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = [None; 2];
    }

    /// Earliest armed deadline
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Expired timers, earliest first, disarming them
    pub(crate) fn take_expired(&mut self, now: Instant) -> impl Iterator<Item = Timer> {
        let mut expired = Timer::VALUES
            .iter()
            .copied()
            .filter_map(|timer| match self[timer] {
                Some(deadline) if deadline <= now => Some((deadline, timer)),
                _ => None,
            })
            .collect::<Vec<_>>();
        expired.sort();
        for &(_, timer) in &expired {
            self.stop(timer);
        }
        expired.into_iter().map(|(_, timer)| timer)
    }
}

impl Index<Timer> for TimerTable {
    type Output = Option<Instant>;
    fn index(&self, index: Timer) -> &Option<Instant> {
        &self.data[index as usize]
    }
}

impl IndexMut<Timer> for TimerTable {
    fn index_mut(&mut self, index: Timer) -> &mut Option<Instant> {
        &mut self.data[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn expired_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerTable::default();
        timers.set(Timer::Retransmit, now + Duration::from_secs(2));
        timers.set(Timer::Response, now + Duration::from_secs(1));
        assert_eq!(timers.next_timeout(), Some(now + Duration::from_secs(1)));
        assert_eq!(timers.take_expired(now).count(), 0);
        let expired = timers
            .take_expired(now + Duration::from_secs(5))
            .collect::<Vec<_>>();
        assert_eq!(expired, [Timer::Response, Timer::Retransmit]);
        assert_eq!(timers.next_timeout(), None);
    }
}
