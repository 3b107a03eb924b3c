//! Fluent construction of schedulers and I/O managers.

use crate::error::Result;
use crate::reactor::IoManager;
use crate::runtime::Scheduler;

use std::sync::Arc;

/// Builder for [`Scheduler`] and [`IoManager`].
///
/// # Example
///
/// ```ignore
/// use fiberio::SchedulerBuilder;
///
/// let io = SchedulerBuilder::new()
///     .threads(4)
///     .use_caller(false)
///     .name("io")
///     .build_io()?;
/// io.start();
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    threads: usize,
    use_caller: bool,
    name: String,
}

impl SchedulerBuilder {
    /// One thread, caller adopted, named `"scheduler"`.
    pub fn new() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            name: "scheduler".to_string(),
        }
    }

    /// Total worker count, including the caller when it is adopted.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builds a plain scheduler whose idle workers just yield.
    pub fn build(self) -> Result<Arc<Scheduler>> {
        Scheduler::new(self.threads, self.use_caller, &self.name)
    }

    /// Builds an I/O manager whose idle workers wait on epoll and run timers.
    pub fn build_io(self) -> Result<Arc<IoManager>> {
        IoManager::new(self.threads, self.use_caller, &self.name)
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
