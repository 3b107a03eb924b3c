//! Fiber scheduling: the worker pool, its pending queue and the per-thread context.

pub mod builder;
pub mod context;
pub mod driver;
pub(crate) mod queue;
pub mod scheduler;

pub use builder::SchedulerBuilder;
pub use context::current_thread_id;
pub use driver::Driver;
pub use scheduler::Scheduler;

use crate::fiber::Fiber;

/// Gives up the processor: the running fiber goes back to the end of its scheduler's
/// queue and resumes once the other pending work had a turn.
pub fn yield_now() {
    Fiber::yield_to_ready();
}
