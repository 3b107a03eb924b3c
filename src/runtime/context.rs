//! Thread-local scheduler context.
//!
//! Every worker entering a scheduling loop records which driver it serves, so code
//! running inside fibers can reach the current scheduler (and the current I/O manager,
//! when the driver is one) without an explicit handle. Entering the loop also turns on
//! syscall interception for the thread; both are restored when the loop exits.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::runtime::context;
//!
//! if let Some(driver) = context::current_driver() {
//!     driver.schedule(fiberio::Task::call(|| println!("queued from inside a fiber")));
//! }
//! ```

use crate::hook;
use crate::reactor::IoManager;
use crate::runtime::driver::Driver;

use std::cell::RefCell;
use std::sync::{Arc, Weak};

thread_local! {
    /// Driver whose scheduling loop runs on this thread.
    static CURRENT_DRIVER: RefCell<Option<Weak<dyn Driver>>> = const { RefCell::new(None) };

    /// The same driver viewed as an I/O manager, when it is one.
    static CURRENT_IO_MANAGER: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// Runs `function` with `driver` installed as the thread's current driver.
///
/// Syscall interception is enabled for the duration of the call. The previous
/// context is restored on exit.
///
/// # Arguments
/// * `driver` - Driver whose loop is about to run on this thread
/// * `function` - Closure executed within this context
///
/// # Returns
/// Whatever `function` returns.
#[inline(never)]
pub(crate) fn enter_context<F, R>(driver: &Arc<dyn Driver>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let io_manager = driver.clone().as_io_manager().map(|io| Arc::downgrade(&io));

    let previous_driver = CURRENT_DRIVER.with(|current| current.borrow_mut().replace(Arc::downgrade(driver)));
    let previous_io = CURRENT_IO_MANAGER.with(|current| std::mem::replace(&mut *current.borrow_mut(), io_manager));
    let previous_hook = hook::is_hook_enabled();
    hook::set_hook_enabled(true);

    let result = function();

    hook::set_hook_enabled(previous_hook);
    CURRENT_IO_MANAGER.with(|current| *current.borrow_mut() = previous_io);
    CURRENT_DRIVER.with(|current| *current.borrow_mut() = previous_driver);

    result
}

/// Records `driver` as current on the constructing thread without entering its loop.
///
/// Used for schedulers that adopt their creator thread as a worker.
#[inline(never)]
pub(crate) fn bind(driver: Weak<dyn Driver>, io_manager: Option<Weak<IoManager>>) {
    CURRENT_DRIVER.with(|current| *current.borrow_mut() = Some(driver));
    CURRENT_IO_MANAGER.with(|current| *current.borrow_mut() = io_manager);
}

/// Clears the binding made by [`bind`] if it still refers to `scheduler`.
#[inline(never)]
pub(crate) fn unbind(scheduler: *const crate::runtime::Scheduler) {
    CURRENT_DRIVER.with(|current| {
        let mut current = current.borrow_mut();
        let bound = current
            .as_ref()
            .and_then(Weak::upgrade)
            .is_none_or(|driver| std::ptr::eq(driver.scheduler(), scheduler));

        if bound {
            *current = None;
            CURRENT_IO_MANAGER.with(|io| *io.borrow_mut() = None);
        }
    });
}

/// Returns the driver serving the current thread, if any.
#[inline(never)]
pub fn current_driver() -> Option<Arc<dyn Driver>> {
    CURRENT_DRIVER.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
}

/// Returns the I/O manager serving the current thread, if any.
#[inline(never)]
pub fn current_io_manager() -> Option<Arc<IoManager>> {
    CURRENT_IO_MANAGER.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
}

/// OS thread id of the calling thread.
pub fn current_thread_id() -> i32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() }
}
