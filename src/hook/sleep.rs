//! Sleeps that park the calling fiber on a timer instead of the thread.

use crate::fiber::Fiber;
use crate::hook::is_hook_enabled;
use crate::reactor::IoManager;
use crate::runtime::Driver;
use crate::task::Task;

use std::io;
use std::sync::Arc;
use std::time::Duration;

// Parks the current fiber for `ms`. Returns `false` when the caller is not a fiber of
// an I/O manager with interception enabled.
fn park_for(ms: u64) -> bool {
    if !is_hook_enabled() {
        return false;
    }

    let Some(io) = IoManager::current() else {
        return false;
    };

    let fiber = Fiber::current();
    if fiber.is_root() {
        return false;
    }

    let weak = Arc::downgrade(&io);
    io.add_timer(
        ms,
        move || {
            if let Some(io) = weak.upgrade() {
                io.schedule(Task::fiber(fiber.clone()));
            }
        },
        false,
    );
    drop(io);

    Fiber::yield_to_hold();
    true
}

/// Sleeps for `seconds`. Always returns `0`, the unslept remainder.
pub fn sleep(seconds: u32) -> u32 {
    let duration = Duration::from_secs(u64::from(seconds));
    if !park_for(duration.as_millis() as u64) {
        std::thread::sleep(duration);
    }
    0
}

/// Sleeps for `usec` microseconds, with millisecond resolution inside a fiber.
pub fn usleep(usec: u64) -> io::Result<()> {
    if !park_for(usec / 1000) {
        std::thread::sleep(Duration::from_micros(usec));
    }
    Ok(())
}

/// Sleeps for `duration`, with millisecond resolution inside a fiber.
pub fn nanosleep(duration: Duration) -> io::Result<()> {
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if !park_for(ms) {
        std::thread::sleep(duration);
    }
    Ok(())
}
