use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::PoisonError,
};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use super::*;
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };
    use tracing::warn;

    const MAX_LOCK_OWNERS: usize = 20;
    const SLOW: Duration = Duration::from_millis(10);

    #[derive(Debug)]
    struct Inner<T> {
        last_lock_owner: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// Subsystem lock that records who held it and for how long
    pub(crate) struct Mutex<T> {
        name: &'static str,
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: Debug> Debug for Mutex<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(name: &'static str, value: T) -> Self {
            Self {
                name,
                inner: std::sync::Mutex::new(Inner {
                    last_lock_owner: VecDeque::new(),
                    value,
                }),
            }
        }

        /// Acquire the lock for `purpose`, which is remembered among the last owners
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let requested = Instant::now();
            let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let acquired = Instant::now();
            let waited = acquired.duration_since(requested);
            if waited > SLOW {
                warn!(
                    lock = self.name,
                    purpose,
                    ?waited,
                    owners = ?guard.last_lock_owner,
                    "slow lock acquisition"
                );
            }
            MutexGuard {
                guard,
                name: self.name,
                acquired,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        name: &'static str,
        acquired: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            let held = self.acquired.elapsed();
            if held > SLOW {
                warn!(lock = self.name, purpose = self.purpose, ?held, "lock held too long");
            }
            let owners = &mut self.guard.last_lock_owner;
            if owners.len() == MAX_LOCK_OWNERS {
                owners.pop_back();
            }
            owners.push_front((self.purpose, held));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.guard.value
        }
    }
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::Mutex;

#[cfg(not(feature = "lock_tracking"))]
mod non_tracking {
    use super::*;

    /// Subsystem lock; with `lock_tracking` it also records who held it and for how long
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(_name: &'static str, value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        /// Acquire the lock for `purpose`
        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, T>,
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.guard.deref()
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.guard.deref_mut()
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use non_tracking::Mutex;
