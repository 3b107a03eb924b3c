//! Fatal assertion used for programming-invariant violations.
//!
//! A broken invariant inside the runtime (switching into a running fiber, freeing a
//! live stack, ...) leaves the process in a state that cannot be unwound safely,
//! especially when the violation happens on a fiber stack. The assertion logs the
//! failed condition together with a captured backtrace and aborts the process.

/// Aborts the process when `cond` does not hold.
///
/// # Example
/// ```ignore
/// invariant!(state != FiberState::Exec, "fiber {} is already running", id);
/// ```
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !($cond) {
            $crate::macros::fail(stringify!($cond), format_args!(""));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::macros::fail(stringify!($cond), format_args!($($arg)+));
        }
    };
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn fail(condition: &str, message: std::fmt::Arguments<'_>) -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    log::error!("assertion failed: {condition} {message}\nbacktrace:\n{backtrace}");
    eprintln!("assertion failed: {condition} {message}");
    std::process::abort()
}
