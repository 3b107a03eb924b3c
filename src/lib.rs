//! Stackful fiber runtime with an epoll reactor and fiber-aware system calls.
//!
//! This crate multiplexes cooperatively scheduled fibers over a pool of OS threads.
//! Blocking-style socket code keeps its shape: inside a worker, the calls in [`hook`]
//! park the calling fiber on the reactor instead of blocking the thread.
//!
//! # Architecture
//!
//! - **Fiber**: stackful unit of execution with an explicit state machine
//! - **Task**: a fiber to resume or a closure to run, with an optional thread affinity
//! - **Scheduler**: FIFO task queue served by worker threads, plugged with a [`Driver`]
//! - **IoManager**: scheduler driver that waits on epoll and runs timers when idle
//! - **TimerManager**: deadline-ordered timers with clock-rollback detection
//! - **FdTable**: per-descriptor metadata consulted by the interception layer
//! - **hook**: fiber-aware `read`/`write`/`connect`/`sleep` and friends
//! - **Config**: named tunables loadable from TOML
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Driver, SchedulerBuilder, Task, hook};
//!
//! let io = SchedulerBuilder::new().threads(2).use_caller(false).build_io()?;
//! io.schedule(Task::call(|| {
//!     hook::sleep(1);
//!     println!("slept without blocking a worker");
//! }));
//! io.stop();
//! ```

#[doc(hidden)]
#[macro_use]
pub mod macros;

pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod runtime;
pub mod task;
pub mod time;

pub use config::{Config, ConfigVar};
pub use error::{Error, Result};
pub use fd::{FdContext, FdTable, TimeoutKind};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, IoManager};
pub use runtime::{Driver, Scheduler, SchedulerBuilder, yield_now};
pub use task::{Task, TaskKind};
pub use time::{Timer, TimerManager};
