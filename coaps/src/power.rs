use std::{sync::Arc, time::Duration};

use proto::power::Suspend;
use tokio_util::sync::CancellationToken;

use crate::{mutex::Mutex, platform::PowerManager, tasks::TaskQueue};

/// Forwards suspend permission to the power manager
///
/// Permission to suspend is only passed on after it held for the debounce delay, so a quick
/// follow-up exchange doesn't cycle the device through sleep. Staying active takes effect
/// immediately.
pub(crate) struct SuspendDebounce {
    delay: Duration,
    power: Arc<Mutex<Box<dyn PowerManager>>>,
    pending: Option<CancellationToken>,
}

impl SuspendDebounce {
    pub(crate) fn new(delay: Duration, power: Box<dyn PowerManager>) -> Self {
        Self {
            delay,
            power: Arc::new(Mutex::new("power", power)),
            pending: None,
        }
    }

    pub(crate) fn signal(&mut self, tasks: &TaskQueue, signal: Suspend) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        match signal {
            Suspend::Allowed => {
                let power = self.power.clone();
                self.pending = Some(tasks.schedule("suspend", self.delay, move || {
                    power.lock("suspend").suspend(true)
                }));
            }
            Suspend::StayActive => self.power.lock("stay active").suspend(false),
        }
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}
