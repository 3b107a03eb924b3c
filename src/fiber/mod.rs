//! Stackful fibers.
//!
//! - [`core`]: the [`Fiber`] type, its states and the per-thread switching state
//! - [`stack`]: guard-paged stacks owned by fibers
//! - [`context`]: the saved machine context and the switch primitive

pub mod core;
pub(crate) mod context;
pub(crate) mod stack;

pub use self::core::{Entry, Fiber, FiberState};
pub(crate) use self::core::set_scheduler_fiber;
