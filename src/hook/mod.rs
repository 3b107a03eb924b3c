//! Fiber-aware versions of blocking system calls.
//!
//! Inside a scheduler worker, the functions of this module look like their blocking
//! counterparts to the calling fiber while leaving the OS thread free: a socket
//! operation that would block registers a reactor event, parks the fiber and retries
//! once the descriptor is ready or its timeout expired; sleeps park the fiber on a
//! timer. Outside a worker, or on a thread that disabled interception, every call goes
//! straight to the [`IoBackend`].
//!
//! Interception only applies to sockets recorded in the [`FdTable`](crate::fd::FdTable)
//! whose user did not ask for non-blocking semantics. Timeouts surface as
//! [`std::io::ErrorKind::TimedOut`].
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Driver, IoManager, Task, hook};
//!
//! let io = IoManager::new(1, false, "io")?;
//! io.schedule(Task::call(|| {
//!     let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
//!     hook::connect(fd, &"127.0.0.1:8080".parse().unwrap()).unwrap();
//!     hook::write(fd, b"ping").unwrap();
//!     hook::close(fd).unwrap();
//! }));
//! ```

pub mod backend;
pub mod io;
pub mod sleep;
pub mod socket;

pub use self::backend::{IoBackend, SystemBackend, install_backend};
pub use self::io::{read, readv, recv, recvfrom, recvmsg, send, sendmsg, sendto, write, writev};
pub use self::sleep::{nanosleep, sleep, usleep};
pub use self::socket::{
    accept, close, connect, connect_with_timeout, fcntl_getfl, fcntl_setfl, getsockopt_error,
    ioctl_fionbio, setsockopt_timeout, socket,
};

use crate::config;
use crate::fd::{FdTable, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::{Event, IoManager};

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Once};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether calls made on this thread are intercepted.
#[inline(never)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

/// Turns interception on or off for this thread. Workers enable it for themselves.
#[inline(never)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

/// Current `errno` of the calling thread.
pub fn errno() -> i32 {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

/// Sets `errno`, for [`IoBackend`] implementations reporting a failure.
pub fn set_errno(value: i32) {
    // SAFETY: see `errno`.
    unsafe { *libc::__errno_location() = value };
}

static CONNECT_TIMEOUT: AtomicI64 = AtomicI64::new(-1);
static CONNECT_TIMEOUT_INIT: Once = Once::new();

/// Default timeout of [`connect`], following the `tcp.connect.timeout` tunable.
pub(crate) fn connect_timeout() -> Option<u64> {
    CONNECT_TIMEOUT_INIT.call_once(|| {
        let var = config::tcp_connect_timeout();
        var.add_listener(|old, new| {
            log::info!("tcp connect timeout changed from {old} to {new}");
            CONNECT_TIMEOUT.store(*new, Ordering::SeqCst);
        });
        CONNECT_TIMEOUT.store(var.value(), Ordering::SeqCst);
    });

    u64::try_from(CONNECT_TIMEOUT.load(Ordering::SeqCst)).ok()
}

pub(crate) fn cvt(result: libc::c_int) -> std::io::Result<libc::c_int> {
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

pub(crate) fn cvt_size(result: isize) -> std::io::Result<usize> {
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Shared between a parked operation and its timeout.
#[derive(Default)]
pub(crate) struct WaitState {
    /// Errno recorded by the timeout, `0` while the wait is still live.
    cancelled: AtomicI32,
}

impl WaitState {
    pub(crate) fn cancelled(&self) -> Option<i32> {
        match self.cancelled.load(Ordering::SeqCst) {
            0 => None,
            errno => Some(errno),
        }
    }
}

/// Parks the current fiber until `event` fires on `fd` or `timeout_ms` elapses.
///
/// The timeout is armed only once the event is registered, so a timer that fires on
/// another worker always finds a registration to cancel and the fiber is woken.
/// Returns the errno recorded by the timeout when it won the race.
pub(crate) fn wait_for(
    io: &Arc<IoManager>,
    fd: RawFd,
    event: Event,
    timeout_ms: Option<u64>,
    name: &str,
) -> std::io::Result<()> {
    if let Err(error) = io.add_event(fd, event, None) {
        log::error!("{name}: add_event({fd}, {event:?}) failed: {error}");
        return Err(error.into());
    }

    let state = Arc::new(WaitState::default());
    let timer = timeout_ms.map(|ms| {
        let weak_state = Arc::downgrade(&state);
        let weak_io = Arc::downgrade(io);
        io.add_condition_timer(
            ms,
            move || {
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state
                    .cancelled
                    .compare_exchange(0, libc::ETIMEDOUT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return;
                }
                if let Some(io) = weak_io.upgrade() {
                    io.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&state),
            false,
        )
    });

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }

    match state.cancelled() {
        Some(errno) => Err(std::io::Error::from_raw_os_error(errno)),
        None => Ok(()),
    }
}

/// Runs a socket operation the way a blocking call would behave, without blocking the
/// worker thread.
///
/// # Arguments
/// * `fd` - Descriptor the operation works on
/// * `name` - Operation name for log lines
/// * `event` - Readiness to wait for when the operation would block
/// * `kind` - Which of the descriptor's timeouts applies
/// * `op` - The raw call, returning `-1` and setting `errno` on failure
pub(crate) fn do_io<F>(
    fd: RawFd,
    name: &str,
    event: Event,
    kind: TimeoutKind,
    mut op: F,
) -> std::io::Result<usize>
where
    F: FnMut() -> isize,
{
    if !is_hook_enabled() {
        return cvt_size(op());
    }

    let Some(context) = FdTable::global().get(fd, false) else {
        return cvt_size(op());
    };

    if context.is_closed() {
        return Err(std::io::Error::from_raw_os_error(libc::EBADF));
    }

    if !context.is_socket() || context.user_nonblock() {
        return cvt_size(op());
    }

    let timeout = context.timeout(kind);

    loop {
        let mut result = op();
        while result == -1 && errno() == libc::EINTR {
            result = op();
        }

        if result != -1 || errno() != libc::EAGAIN {
            return cvt_size(result);
        }

        let Some(io) = IoManager::current() else {
            return cvt_size(result);
        };

        log::trace!("{name}: fd {fd} would block, waiting for {event:?}");
        wait_for(&io, fd, event, timeout, name)?;
    }
}
