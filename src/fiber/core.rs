//! Stackful fibers and the per-thread switching state.
//!
//! A [`Fiber`] owns a stack, a saved machine context and the closure it runs. Control
//! moves between fibers only through explicit switches:
//!
//! - the scheduler resumes a fiber with `swap_in` and the fiber gives control back with
//!   [`Fiber::yield_to_ready`], [`Fiber::yield_to_hold`] or by returning
//! - a caller-mode fiber (the scheduling loop of a thread that participates in its own
//!   scheduler) is entered with `call` and returns to the thread's root fiber with `back`
//!
//! Every OS thread lazily gets a root fiber (id 0, no stack) standing for "the thread
//! itself". The fiber that yields records the state it wants to end up in; the side
//! that resumes publishes that state once the switch has completed, so another worker
//! never observes a suspended-looking fiber whose registers are still being saved.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Fiber, FiberState};
//!
//! let fiber = Fiber::new(|| {
//!     println!("first half");
//!     Fiber::yield_to_hold();
//!     println!("second half");
//! }, 0)?;
//! ```

use crate::config;
use crate::error::Result;
use crate::fiber::context::Context;
use crate::fiber::stack::Stack;

use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Closure executed by a fiber.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Fiber running on this thread.
    static CURRENT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// The thread's root fiber.
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber that runs the scheduling loop on this thread.
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

// Thread-local accessors stay out of line: a fiber may resume on another thread, and
// an inlined access could reuse the previous thread's TLS address across a switch.
#[inline(never)]
fn current_ptr() -> *const Fiber {
    CURRENT.with(|current| current.get())
}

#[inline(never)]
fn set_current(fiber: *const Fiber) {
    CURRENT.with(|current| current.set(fiber));
}

#[inline(never)]
fn thread_root_ptr() -> *const Fiber {
    THREAD_ROOT.with(|root| {
        root.borrow()
            .as_ref()
            .map(Arc::as_ptr)
            .unwrap_or(ptr::null())
    })
}

#[inline(never)]
fn scheduler_fiber_ptr() -> *const Fiber {
    let fiber = SCHEDULER_FIBER.with(|fiber| fiber.get());
    if fiber.is_null() { thread_root_ptr() } else { fiber }
}

/// Designates the fiber the scheduling loop runs on for this thread.
///
/// Fibers swapped out with `swap_out` resume it. Pass a null pointer to fall back to
/// the thread's root fiber.
#[inline(never)]
pub(crate) fn set_scheduler_fiber(fiber: *const Fiber) {
    SCHEDULER_FIBER.with(|slot| slot.set(fiber));
}

/// Lifecycle state of a fiber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Created or reset, never run.
    Init = 0,
    /// Suspended until something reschedules it.
    Hold = 1,
    /// Running on some thread.
    Exec = 2,
    /// Entry returned normally.
    Term = 3,
    /// Suspended and asking to be rescheduled right away.
    Ready = 4,
    /// Entry panicked.
    Except = 5,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Hold,
            2 => Self::Exec,
            3 => Self::Term,
            4 => Self::Ready,
            _ => Self::Except,
        }
    }

    /// Whether the entry has finished, normally or not.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

/// A stackful, cooperatively scheduled unit of execution.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// State requested by the fiber when it switched away, published by the resumer.
    exit_state: AtomicU8,
    caller_mode: bool,
    stack: Option<Stack>,
    context: Context,
    entry: Mutex<Option<Entry>>,
}

impl Fiber {
    /// Creates a fiber that runs `entry` on a fresh stack.
    ///
    /// # Arguments
    /// * `entry` - Closure run when the fiber is first resumed
    /// * `stack_size` - Stack size in bytes; `0` uses the `fiber.stack_size` tunable
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] when the stack or the context cannot be set up.
    pub fn new<F>(entry: F, stack_size: usize) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::create(Box::new(entry), stack_size, false)
    }

    /// Creates a caller-mode fiber, which returns to the thread's root fiber instead
    /// of the scheduler fiber when it finishes.
    pub fn with_caller<F>(entry: F, stack_size: usize) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::create(Box::new(entry), stack_size, true)
    }

    pub(crate) fn create(entry: Entry, stack_size: usize, caller_mode: bool) -> Result<Arc<Fiber>> {
        let size = if stack_size == 0 {
            config::fiber_stack_size().value() as usize
        } else {
            stack_size
        };

        let stack = Stack::new(size)?;
        let context = Context::on_stack(&stack, fiber_main)?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::debug!("fiber {id} created with {} byte stack", stack.size());

        Ok(Arc::new(Fiber {
            id,
            state: AtomicU8::new(FiberState::Init as u8),
            exit_state: AtomicU8::new(FiberState::Hold as u8),
            caller_mode,
            stack: Some(stack),
            context,
            entry: Mutex::new(Some(entry)),
        }))
    }

    // The thread's root fiber: already executing, no stack, no entry.
    fn root() -> Arc<Fiber> {
        let context = match Context::capture() {
            Ok(context) => context,
            Err(error) => crate::macros::fail("getcontext", format_args!("{error}")),
        };

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::debug!("root fiber created");

        Arc::new(Fiber {
            id: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            exit_state: AtomicU8::new(FiberState::Exec as u8),
            caller_mode: false,
            stack: None,
            context,
            entry: Mutex::new(None),
        })
    }

    /// Returns the running fiber, creating this thread's root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let current = current_ptr();
        if !current.is_null() {
            // SAFETY: `CURRENT` always points at a fiber kept alive by an `Arc` owned by
            // whoever resumed it (scheduler, thread root slot or caller).
            unsafe {
                Arc::increment_strong_count(current);
                return Arc::from_raw(current);
            }
        }

        let root = Fiber::root();
        THREAD_ROOT.with(|slot| *slot.borrow_mut() = Some(root.clone()));
        set_current(Arc::as_ptr(&root));
        root
    }

    /// Id of the running fiber, `0` outside of any fiber.
    pub fn current_id() -> u64 {
        let current = current_ptr();
        if current.is_null() {
            0
        } else {
            unsafe { (*current).id }
        }
    }

    /// Number of fibers alive in the process.
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map(Stack::size).unwrap_or(0)
    }

    /// Reuses the stack for a new entry.
    ///
    /// Only fibers that finished or never ran may be reset; anything else is a fatal
    /// invariant violation.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(&self, entry: Entry) {
        let state = self.state();
        invariant!(self.stack.is_some(), "root fiber cannot be reset");
        invariant!(
            matches!(state, FiberState::Term | FiberState::Except | FiberState::Init),
            "fiber {} reset while {:?}",
            self.id,
            state
        );

        if let Some(stack) = self.stack.as_ref()
            && let Err(error) = self.context.prepare(stack, fiber_main)
        {
            crate::macros::fail("makecontext", format_args!("{error}"));
        }

        *self.entry.lock() = Some(entry);
        self.set_state(FiberState::Init);
    }

    /// Switches from the scheduler fiber into this fiber.
    ///
    /// Returns once this fiber switches back out; its state then reflects what it
    /// requested (`Ready`, `Hold`, `Term` or `Except`).
    pub(crate) fn swap_in(&self) {
        self.resume_from(scheduler_fiber_ptr());
    }

    /// Switches from the thread's root fiber into this caller-mode fiber.
    pub(crate) fn call(&self) {
        if thread_root_ptr().is_null() {
            drop(Fiber::current());
        }
        self.resume_from(thread_root_ptr());
    }

    fn resume_from(&self, from: *const Fiber) {
        let state = self.state();
        invariant!(!from.is_null(), "no fiber to switch from");
        invariant!(state != FiberState::Exec, "fiber {} is already running", self.id);
        invariant!(!state.is_finished(), "fiber {} already finished", self.id);

        self.exit_state.store(FiberState::Hold as u8, Ordering::Relaxed);
        self.set_state(FiberState::Exec);
        set_current(self);

        log::trace!("switch into fiber {}", self.id);

        // SAFETY: `from` is the fiber running this code and stays alive while suspended.
        if let Err(error) = unsafe { Context::switch(&(*from).context, &self.context) } {
            crate::macros::fail("swapcontext", format_args!("{error}"));
        }

        let requested = self.exit_state.load(Ordering::Acquire);
        self.state.store(requested, Ordering::Release);
    }

    /// Switches from this fiber back to the scheduler fiber.
    pub(crate) fn swap_out(&self) {
        self.switch_to(scheduler_fiber_ptr());
    }

    /// Switches from this caller-mode fiber back to the thread's root fiber.
    pub(crate) fn back(&self) {
        self.switch_to(thread_root_ptr());
    }

    fn switch_to(&self, to: *const Fiber) {
        invariant!(!to.is_null(), "no fiber to switch back to");
        set_current(to);

        // SAFETY: `to` is suspended in `resume_from` waiting for this switch.
        if let Err(error) = unsafe { Context::switch(&self.context, &(*to).context) } {
            crate::macros::fail("swapcontext", format_args!("{error}"));
        }
    }

    fn suspend(&self, requested: FiberState) {
        self.exit_state.store(requested as u8, Ordering::Release);
        if self.caller_mode {
            self.back();
        } else {
            self.swap_out();
        }
    }

    /// Suspends the running fiber and asks the scheduler to requeue it.
    pub fn yield_to_ready() {
        Self::yield_as(FiberState::Ready);
    }

    /// Suspends the running fiber until something reschedules it.
    pub fn yield_to_hold() {
        Self::yield_as(FiberState::Hold);
    }

    fn yield_as(requested: FiberState) {
        let current = Fiber::current();
        invariant!(!current.is_root(), "the root fiber cannot yield");
        invariant!(current.state() == FiberState::Exec);

        let fiber = Arc::as_ptr(&current);
        drop(current);

        // SAFETY: the resumer holds a strong reference while this fiber runs.
        unsafe { (*fiber).suspend(requested) };
    }

    // Runs the entry, converting a panic into `Except`.
    fn run_entry(&self) -> FiberState {
        let entry = self.entry.lock().take();
        let Some(entry) = entry else {
            return FiberState::Term;
        };

        match catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => FiberState::Term,
            Err(payload) => {
                log::error!(
                    "fiber {} panicked: {}\n{}",
                    self.id,
                    panic_message(payload.as_ref()),
                    Backtrace::capture()
                );
                FiberState::Except
            }
        }
    }
}

extern "C" fn fiber_main() {
    let current = Fiber::current();
    let outcome = current.run_entry();

    let fiber = Arc::as_ptr(&current);
    drop(current);

    // SAFETY: the resumer still owns the fiber; this frame is never resumed.
    unsafe { (*fiber).suspend(outcome) };

    crate::macros::fail("unreachable", format_args!("finished fiber resumed"));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();

        if self.stack.is_some() {
            invariant!(
                matches!(state, FiberState::Term | FiberState::Except | FiberState::Init),
                "fiber {} dropped while {:?}",
                self.id,
                state
            );
        } else {
            invariant!(self.entry.get_mut().is_none());
            invariant!(state == FiberState::Exec, "root fiber dropped while {:?}", state);

            if current_ptr() == self as *const Fiber {
                set_current(ptr::null());
            }
        }

        log::debug!("fiber {} dropped, {} alive", self.id, Fiber::total());
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}
