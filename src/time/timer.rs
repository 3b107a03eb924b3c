//! Deadline-ordered timer heap shared by the reactor and sleep emulation.
//!
//! Timers are kept in an ordered set keyed by `(deadline, sequence)`: the earliest
//! deadline comes first and timers sharing a deadline fire in insertion order. A timer
//! is in the set exactly while it is live, that is while it still holds a callback.
//!
//! The reactor polls [`TimerManager::next_timer`] to bound its kernel wait and drains
//! due callbacks with [`TimerManager::list_expired`]. Whenever a newly inserted timer
//! becomes the earliest one, the front hook runs so a blocked wait can be shortened.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::time::TimerManager;
//!
//! let timers = TimerManager::new();
//! let timer = timers.add_timer(1000, || println!("tick"), true);
//!
//! for callback in timers.list_expired() {
//!     callback();
//! }
//! timer.cancel();
//! ```

use crate::time::clock::{Clock, SystemClock};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback stored in a timer. Recurring timers invoke it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A backward clock jump larger than this expires every timer.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

type TimerKey = (u64, u64);

struct TimerState {
    /// Period in milliseconds.
    ms: u64,
    /// Absolute deadline in milliseconds.
    next: u64,
    /// `None` once cancelled or consumed.
    callback: Option<TimerCallback>,
}

/// Handle to a scheduled timer.
pub struct Timer {
    seq: u64,
    recurring: bool,
    state: Mutex<TimerState>,
    manager: Weak<TimerShared>,
}

impl Timer {
    /// Removes the timer without running it.
    ///
    /// Returns `false` when the timer already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = shared.timers.write();
        let mut state = self.state.lock();

        if state.callback.take().is_some() {
            timers.remove(&(state.next, self.seq));
            return true;
        }

        false
    }

    /// Re-arms the timer one period from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = shared.timers.write();
        let mut state = self.state.lock();

        if state.callback.is_none() {
            return false;
        }

        let Some(timer) = timers.remove(&(state.next, self.seq)) else {
            return false;
        };

        state.next = shared.clock.now_ms() + state.ms;
        timers.insert((state.next, self.seq), timer);
        true
    }

    /// Changes the period to `ms`.
    ///
    /// With `from_now` the new deadline is `now + ms`, otherwise it is computed from the
    /// start of the current period.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = shared.timers.write();
        let mut state = self.state.lock();

        if ms == state.ms && !from_now {
            return true;
        }

        let Some(timer) = timers.remove(&(state.next, self.seq)) else {
            return false;
        };

        let start = if from_now {
            shared.clock.now_ms()
        } else {
            state.next - state.ms
        };

        state.ms = ms;
        state.next = start + ms;
        let key = (state.next, self.seq);
        drop(state);

        shared.insert(timer, key, timers);
        true
    }

    /// Whether the timer is still scheduled.
    pub fn is_live(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Absolute deadline in milliseconds.
    pub fn deadline(&self) -> u64 {
        self.state.lock().next
    }

    pub fn period(&self) -> u64 {
        self.state.lock().ms
    }
}

struct TimerShared {
    timers: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    clock: Arc<dyn Clock>,
    previous_ms: AtomicU64,
    next_seq: AtomicU64,
    front_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerShared {
    // Inserts under the held write lock, releases it, then runs the front hook if the
    // timer became the earliest one.
    fn insert(
        &self,
        timer: Arc<Timer>,
        key: TimerKey,
        mut timers: RwLockWriteGuard<'_, BTreeMap<TimerKey, Arc<Timer>>>,
    ) {
        timers.insert(key, timer);
        let at_front = timers.keys().next() == Some(&key);
        drop(timers);

        if at_front && let Some(hook) = self.front_hook.read().as_ref() {
            hook();
        }
    }

    fn detect_clock_rollover(&self, now_ms: u64) -> bool {
        let previous = self.previous_ms.swap(now_ms, Ordering::SeqCst);
        now_ms < previous.saturating_sub(ROLLOVER_MS)
    }
}

/// Ordered collection of deadline callbacks.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Creates a timer heap driven by the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a timer heap driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();

        Self {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(BTreeMap::new()),
                clock,
                previous_ms: AtomicU64::new(now),
                next_seq: AtomicU64::new(1),
                front_hook: RwLock::new(None),
            }),
        }
    }

    /// Installs the hook run when a new timer becomes the earliest deadline.
    pub fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.front_hook.write() = Some(Box::new(hook));
    }

    /// Current time of the heap's clock, in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Schedules `callback` to run `ms` milliseconds from now.
    ///
    /// # Arguments
    /// * `ms` - Delay before the first run, and the period of a recurring timer
    /// * `callback` - Invoked by whoever drains [`Self::list_expired`]
    /// * `recurring` - Re-arm after every run at `fire time + ms`
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_shared_timer(ms, Arc::new(callback), recurring)
    }

    /// Like [`Self::add_timer`] but the callback only runs while `condition` is alive.
    ///
    /// Used for I/O timeouts: once the waiter drops its token the timeout becomes a
    /// no-op even if it is already queued for execution.
    pub fn add_condition_timer<F, W>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    fn add_shared_timer(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let shared = &self.shared;
        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let next = shared.clock.now_ms() + ms;

        let timer = Arc::new(Timer {
            seq,
            recurring,
            state: Mutex::new(TimerState {
                ms,
                next,
                callback: Some(callback),
            }),
            manager: Arc::downgrade(shared),
        });

        let timers = shared.timers.write();
        shared.insert(timer.clone(), (next, seq), timers);
        timer
    }

    /// Milliseconds until the earliest deadline, `Some(0)` when one is already due and
    /// `None` when the heap is empty.
    pub fn next_timer(&self) -> Option<u64> {
        let timers = self.shared.timers.read();
        let (deadline, _) = *timers.keys().next()?;
        let now = self.shared.clock.now_ms();

        Some(deadline.saturating_sub(now))
    }

    /// Removes every due timer and returns their callbacks in firing order.
    ///
    /// Recurring timers are re-inserted at `now + period`. If the clock moved backward
    /// by more than an hour since the previous call, every timer is treated as due.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let shared = &self.shared;
        let now = shared.clock.now_ms();

        if shared.timers.read().is_empty() {
            return Vec::new();
        }

        let mut timers = shared.timers.write();
        if timers.is_empty() {
            return Vec::new();
        }

        let rollover = shared.detect_clock_rollover(now);
        if rollover {
            log::warn!("clock moved backward beyond one hour, expiring {} timers", timers.len());
        }

        let expired: Vec<Arc<Timer>> = if rollover {
            std::mem::take(&mut *timers).into_values().collect()
        } else {
            let keep = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, keep).into_values().collect()
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for timer in expired {
            let mut state = timer.state.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            callbacks.push(callback);

            if timer.recurring {
                state.next = now + state.ms;
                let key = (state.next, timer.seq);
                drop(state);
                timers.insert(key, timer);
            } else {
                state.callback = None;
            }
        }

        callbacks
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().is_empty()
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.shared.timers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }

    /// Deadlines of the live timers in firing order.
    pub fn deadlines(&self) -> Vec<u64> {
        self.shared.timers.read().keys().map(|(next, _)| *next).collect()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
