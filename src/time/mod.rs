//! Timer heap and clocks.
//!
//! - [`timer`]: [`TimerManager`], the deadline-ordered set shared by the reactor and
//!   the intercepted sleep calls, and the [`Timer`] handles it returns
//! - [`clock`]: the millisecond [`Clock`] abstraction, with the system wall clock and a
//!   manually driven clock for tests
//!
//! # Example
//!
//! ```ignore
//! use fiberio::time::{ManualClock, TimerManager};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let timers = TimerManager::with_clock(clock.clone());
//! timers.add_timer(100, || println!("fired"), false);
//!
//! clock.advance(100);
//! assert_eq!(timers.list_expired().len(), 1);
//! ```

pub mod clock;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock, current_ms};
pub use timer::{Timer, TimerCallback, TimerManager};
