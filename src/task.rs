//! Scheduling units.
//!
//! A [`Task`] is what sits in a scheduler's pending queue: either a fiber to resume or
//! a plain closure to run on a pooled fiber, plus an optional thread affinity. Tasks
//! are consumed when a worker dispatches them.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::Task;
//!
//! let anywhere = Task::call(|| println!("any worker"));
//! let pinned = Task::call(|| println!("worker 1234 only")).pinned(1234);
//! ```

use crate::fiber::Fiber;

use std::fmt;
use std::sync::Arc;

/// Work carried by a [`Task`].
pub enum TaskKind {
    /// Resume an existing fiber.
    Fiber(Arc<Fiber>),
    /// Run a closure on a worker-owned fiber.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// A pending unit of work with an optional thread affinity.
pub struct Task {
    pub(crate) kind: TaskKind,
    /// OS thread id allowed to run the task, `None` for any worker.
    pub(crate) affinity: Option<i32>,
}

impl Task {
    /// Wraps a fiber. The fiber is resumed where it last suspended.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self {
            kind: TaskKind::Fiber(fiber),
            affinity: None,
        }
    }

    /// Wraps a closure.
    pub fn call<F>(function: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: TaskKind::Call(Box::new(function)),
            affinity: None,
        }
    }

    /// Restricts the task to the worker whose OS thread id is `thread`.
    pub fn pinned(mut self, thread: i32) -> Self {
        self.affinity = Some(thread);
        self
    }

    /// Sets the affinity; `None` lets any worker run the task.
    pub fn with_affinity(mut self, thread: Option<i32>) -> Self {
        self.affinity = thread;
        self
    }

    pub fn affinity(&self) -> Option<i32> {
        self.affinity
    }

    /// Whether a worker running on OS thread `thread` may take this task.
    pub(crate) fn runs_on(&self, thread: i32) -> bool {
        self.affinity.is_none_or(|wanted| wanted == thread)
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Task");
        match &self.kind {
            TaskKind::Fiber(fiber) => debug.field("fiber", &fiber.id()),
            TaskKind::Call(_) => debug.field("call", &"<closure>"),
        };
        debug.field("affinity", &self.affinity).finish()
    }
}
