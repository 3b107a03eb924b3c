//! Pending task list shared by a scheduler's workers.
//!
//! A mutex-protected FIFO. Workers take the first task they are allowed to run; tasks
//! pinned to another thread stay where they are and only mark the queue as needing a
//! wake-up so their owner notices them.

use crate::fiber::FiberState;
use crate::task::{Task, TaskKind};

use parking_lot::Mutex;
use std::collections::VecDeque;

pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

/// Outcome of [`TaskQueue::take_for`].
pub(crate) struct Taken {
    pub(crate) task: Option<Task>,
    /// Other workers have something to look at.
    pub(crate) tickle: bool,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a task and reports whether the queue was empty before.
    pub(crate) fn push(&self, task: Task) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    /// Appends every task under a single lock; reports whether the queue was empty.
    pub(crate) fn push_all(&self, tasks: impl IntoIterator<Item = Task>) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.extend(tasks);
        was_empty && !queue.is_empty()
    }

    /// Removes the first task runnable on OS thread `thread`.
    ///
    /// `on_take` runs under the queue lock when a task is removed, so the caller can
    /// account for it before another worker inspects the queue.
    pub(crate) fn take_for(&self, thread: i32, on_take: impl FnOnce()) -> Taken {
        let mut queue = self.queue.lock();
        let mut tickle = false;

        let position = queue.iter().position(|task| {
            if !task.runs_on(thread) {
                tickle = true;
                return false;
            }

            // Still switching out on another worker.
            !matches!(&task.kind, TaskKind::Fiber(fiber) if fiber.state() == FiberState::Exec)
        });

        let task = position.and_then(|index| {
            let task = queue.remove(index);
            on_take();
            tickle |= index < queue.len();
            task
        });

        Taken { task, tickle }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
