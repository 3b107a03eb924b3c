//! Epoll-backed I/O manager.
//!
//! [`IoManager`] is a [`Driver`] combining a [`Scheduler`] with a [`TimerManager`]. Fibers
//! park on descriptor readiness with [`IoManager::add_event`] and are rescheduled by
//! whichever worker observes the event. Idle workers block in `epoll_wait`, bounded by
//! the earliest timer deadline and the `reactor.max_wait_ms` tunable; other threads
//! interrupt that wait through a semaphore eventfd, one wake-up per blocked worker.
//!
//! Registration is edge triggered. An event fires once and is removed: a fiber that
//! wants to keep reading registers again after draining the descriptor.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Driver, Event, IoManager, Task};
//!
//! let io = IoManager::new(2, false, "io")?;
//! io.schedule(Task::call(move || {
//!     let io = IoManager::current().unwrap();
//!     io.add_event(fd, Event::READ, None).unwrap();
//!     fiberio::Fiber::yield_to_hold();
//!     // fd is readable
//! }));
//! io.stop();
//! ```

use crate::config;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberState};
use crate::reactor::event::Event;
use crate::reactor::poller::{EpollPoller, WAKE_TOKEN};
use crate::runtime::context;
use crate::runtime::{Driver, Scheduler};
use crate::task::Task;
use crate::time::{Timer, TimerManager};

use libc::{EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP, epoll_event};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Kernel events collected per wait.
const MAX_EVENTS: usize = 256;

const INITIAL_CONTEXTS: usize = 32;

/// Closure run when a registered event fires.
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// What to resume when one event kind becomes ready.
#[derive(Default)]
struct EventContext {
    /// Scheduler the waiter is rescheduled on.
    driver: Option<Weak<dyn Driver>>,
    fiber: Option<Arc<Fiber>>,
    callback: Option<EventCallback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.driver.is_none() && self.fiber.is_none() && self.callback.is_none()
    }
}

/// Reactor-side state of one descriptor.
struct FdEvents {
    fd: RawFd,
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdEvents {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: Event::NONE,
            read: EventContext::default(),
            write: EventContext::default(),
        }
    }

    fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            crate::macros::fail("event == READ || event == WRITE", format_args!("got {event:?}"))
        }
    }

    /// Clears `event` and hands its waiter back to the scheduler it came from.
    fn trigger(&mut self, event: Event) {
        invariant!(
            self.events.contains(event),
            "fd {} triggered {:?} while registered for {:?}",
            self.fd,
            event,
            self.events
        );

        self.events = self.events & !event;
        let fd = self.fd;
        let context = std::mem::take(self.context_mut(event));

        let Some(driver) = context.driver.as_ref().and_then(Weak::upgrade) else {
            log::warn!("fd {fd}: {event:?} fired after its scheduler went away");
            return;
        };

        if let Some(callback) = context.callback {
            driver.schedule(Task::call(callback));
        } else if let Some(fiber) = context.fiber {
            driver.schedule(Task::fiber(fiber));
        }
    }
}

/// Scheduler whose idle workers wait on epoll and run due timers.
pub struct IoManager {
    scheduler: Scheduler,
    timers: TimerManager,
    poller: EpollPoller,
    contexts: RwLock<Vec<Arc<Mutex<FdEvents>>>>,
    pending: AtomicUsize,
    me: Weak<IoManager>,
}

impl IoManager {
    /// Creates an I/O manager and starts its worker threads.
    ///
    /// # Arguments
    /// * `threads` - Total worker count, including the caller when `use_caller` is set
    /// * `use_caller` - Adopt the constructing thread as a worker
    /// * `name` - Used for worker thread names and log lines
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the epoll instance, the wake-up eventfd or the caller's
    /// root fiber cannot be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let poller = EpollPoller::new()?;

        let io = Arc::new_cyclic(|me| IoManager {
            scheduler: Scheduler::unbound(threads, use_caller, name),
            timers: TimerManager::new(),
            poller,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            me: me.clone(),
        });

        io.resize_contexts(INITIAL_CONTEXTS);

        let weak = io.me.clone();
        io.timers.set_front_hook(move || {
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        });

        if use_caller {
            let weak: Weak<IoManager> = io.me.clone();
            io.scheduler.adopt_caller(weak.clone(), Some(weak))?;
        }

        io.start();
        Ok(io)
    }

    /// Returns the I/O manager serving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        context::current_io_manager()
    }

    /// Spawns the worker threads. Already done by [`Self::new`]; further calls do nothing.
    pub fn start(self: &Arc<Self>) {
        crate::runtime::driver::start(self.clone());
    }

    /// Waits until the queue, every registered event and every timer are gone, then
    /// joins the workers.
    pub fn stop(&self) {
        crate::runtime::driver::stop(self);
    }

    /// The timer heap driving sleeps and I/O timeouts.
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Schedules `callback` on the timer heap. See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
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
        self.timers.add_condition_timer(ms, callback, condition, recurring)
    }

    /// Number of registered, not yet fired events.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.contexts.write();
        let start = contexts.len();
        if size <= start {
            return;
        }

        contexts.extend((start..size).map(|fd| Arc::new(Mutex::new(FdEvents::new(fd as RawFd)))));
    }

    // Slot for `fd`, growing the table when `grow` is set.
    fn slot(&self, fd: RawFd, grow: bool) -> Option<Arc<Mutex<FdEvents>>> {
        let index = usize::try_from(fd).ok()?;

        if let Some(slot) = self.contexts.read().get(index) {
            return Some(slot.clone());
        }

        if !grow {
            return None;
        }

        let len = self.contexts.read().len();
        self.resize_contexts((index + 1).max(len * 3 / 2));
        self.contexts.read().get(index).cloned()
    }

    /// Registers interest in `event` on `fd`.
    ///
    /// When the event fires, `callback` is scheduled if given; otherwise the calling
    /// fiber is rescheduled and is expected to yield to `Hold` right after this returns.
    ///
    /// # Arguments
    /// * `fd` - Descriptor to watch
    /// * `event` - Exactly one of [`Event::READ`] or [`Event::WRITE`]
    /// * `callback` - Closure to run instead of resuming the current fiber
    ///
    /// # Errors
    /// * [`Error::NotInScheduler`] without a callback outside of a scheduled fiber
    /// * [`Error::InvalidFd`] for a negative descriptor
    /// * [`Error::EventExists`] if `event` is already registered on `fd`
    /// * [`Error::Io`] if the kernel rejects the registration
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<EventCallback>) -> Result<()> {
        if callback.is_none() && Fiber::current().is_root() {
            return Err(Error::NotInScheduler);
        }

        let slot = self.slot(fd, true).ok_or(Error::InvalidFd(fd))?;
        let mut fd_events = slot.lock();

        if fd_events.events.intersects(event) {
            log::error!(
                "add_event: fd {fd} already has {:?}, requested {event:?}",
                fd_events.events
            );
            return Err(Error::EventExists { fd, event });
        }

        let op = if fd_events.events.is_empty() {
            EPOLL_CTL_ADD
        } else {
            EPOLL_CTL_MOD
        };
        let mask = EPOLLET as u32 | (fd_events.events | event).bits();

        if let Err(error) = self.poller.ctl(op, fd, mask, fd as u64) {
            log::error!("epoll_ctl({op}) on fd {fd} with {mask:#x} failed: {error}");
            return Err(error.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        fd_events.events |= event;

        let driver = self.waiter_driver();
        let context = fd_events.context_mut(event);
        invariant!(context.is_empty(), "fd {fd}: stale {event:?} context");
        context.driver = Some(driver);

        match callback {
            Some(callback) => context.callback = Some(callback),
            None => {
                let fiber = Fiber::current();
                invariant!(
                    fiber.state() == FiberState::Exec,
                    "fiber {} waits on fd {fd} while {:?}",
                    fiber.id(),
                    fiber.state()
                );
                context.fiber = Some(fiber);
            }
        }

        Ok(())
    }

    // The scheduler running the caller, or this manager when called from outside.
    fn waiter_driver(&self) -> Weak<dyn Driver> {
        if let Some(driver) = context::current_driver() {
            return Arc::downgrade(&driver);
        }

        let me: Weak<dyn Driver> = self.me.clone();
        me
    }

    /// Removes `event` from `fd` without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.slot(fd, false) else {
            return false;
        };
        let mut fd_events = slot.lock();

        if !fd_events.events.intersects(event) {
            return false;
        }

        let remaining = fd_events.events & !event;
        if !self.update_registration(fd, remaining) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        fd_events.events = remaining;
        *fd_events.context_mut(event) = EventContext::default();
        true
    }

    /// Removes `event` from `fd`, firing it once so the waiter resumes.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.slot(fd, false) else {
            return false;
        };
        let mut fd_events = slot.lock();

        if !fd_events.events.intersects(event) {
            return false;
        }

        let remaining = fd_events.events & !event;
        if !self.update_registration(fd, remaining) {
            return false;
        }

        fd_events.trigger(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Removes every event on `fd`, firing each registered one once.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.slot(fd, false) else {
            return false;
        };
        let mut fd_events = slot.lock();

        if fd_events.events.is_empty() {
            return false;
        }

        if !self.update_registration(fd, Event::NONE) {
            return false;
        }

        for event in [Event::READ, Event::WRITE] {
            if fd_events.events.contains(event) {
                fd_events.trigger(event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }

        invariant!(fd_events.events.is_empty());
        true
    }

    // Re-registers `fd` for `remaining`, or removes it from epoll when nothing is left.
    fn update_registration(&self, fd: RawFd, remaining: Event) -> bool {
        let op = if remaining.is_empty() {
            EPOLL_CTL_DEL
        } else {
            EPOLL_CTL_MOD
        };
        let mask = EPOLLET as u32 | remaining.bits();

        match self.poller.ctl(op, fd, mask, fd as u64) {
            Ok(()) => true,
            Err(error) => {
                log::error!("epoll_ctl({op}) on fd {fd} with {mask:#x} failed: {error}");
                false
            }
        }
    }

    /// Events currently registered on `fd`.
    pub fn registered(&self, fd: RawFd) -> Event {
        self.slot(fd, false)
            .map(|slot| slot.lock().events)
            .unwrap_or(Event::NONE)
    }

    // Whether workers may exit, and how long the next wait may block.
    fn stopping_with_timeout(&self) -> (bool, Option<u64>) {
        let next = self.timers.next_timer();
        let stopping = next.is_none()
            && self.pending_events() == 0
            && self.scheduler.is_drained();
        (stopping, next)
    }

    // Dispatches one kernel event.
    fn dispatch(&self, event: &epoll_event) {
        let bits = event.events;
        let token = event.u64;

        let Ok(fd) = RawFd::try_from(token) else {
            return;
        };
        let Some(slot) = self.slot(fd, false) else {
            return;
        };
        let mut fd_events = slot.lock();

        let mut ready = bits;
        if bits & (EPOLLERR | EPOLLHUP) as u32 != 0 {
            ready |= fd_events.events.bits();
        }

        let fired = Event::from_epoll(ready) & fd_events.events;
        if fired.is_empty() {
            return;
        }

        let remaining = fd_events.events & !fired;
        if !self.update_registration(fd, remaining) {
            return;
        }

        for event in [Event::READ, Event::WRITE] {
            if fired.contains(event) {
                fd_events.trigger(event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Driver for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }

        log::trace!("{}: tickle", self.scheduler.name());
        if let Err(error) = self.poller.wake() {
            log::error!("{}: failed to signal wake-up eventfd: {error}", self.scheduler.name());
        }
    }

    fn stopping(&self) -> bool {
        self.stopping_with_timeout().0
    }

    fn idle(&self) {
        log::debug!("{}: idle", self.scheduler.name());
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let (stopping, next_timeout) = self.stopping_with_timeout();
            if stopping {
                log::info!("{}: idle stopping", self.scheduler.name());
                break;
            }

            let max_wait = config::reactor_max_wait().value();
            let timeout = next_timeout.map_or(max_wait, |next| next.min(max_wait));
            let timeout = i32::try_from(timeout).unwrap_or(i32::MAX);

            let count = match self.poller.wait(&mut events, timeout) {
                Ok(count) => count,
                Err(error) => {
                    log::error!("{}: epoll_wait failed: {error}", self.scheduler.name());
                    0
                }
            };

            let ready = &events[..count];
            if ready.iter().any(|event| event.u64 == WAKE_TOKEN) {
                self.poller.consume_wake();
            }

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                self.schedule_batch(
                    expired
                        .into_iter()
                        .map(|callback| Task::call(move || callback()))
                        .collect(),
                );
            }

            for event in ready.iter().filter(|event| event.u64 != WAKE_TOKEN) {
                self.dispatch(event);
            }

            Fiber::yield_to_hold();
        }
    }

    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("epfd", &self.poller.raw_fd())
            .field("pending_events", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}
