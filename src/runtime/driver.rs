//! The seam between the generic scheduling loop and what a worker does when idle.
//!
//! A [`Driver`] owns a [`Scheduler`] and decides how idle workers wait and how they are
//! woken. The plain scheduler is its own driver and simply yields while idle; the
//! [`IoManager`](crate::reactor::IoManager) blocks in the kernel poller and runs due
//! timers. Worker threads are started and joined through the free functions in this
//! module so both kinds share one lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Driver, Scheduler, Task};
//!
//! let scheduler = Scheduler::new(2, false, "pool")?;
//! scheduler.start();
//! scheduler.schedule(Task::call(|| println!("hello from a fiber")));
//! scheduler.stop();
//! ```

use crate::fiber::Fiber;
use crate::reactor::IoManager;
use crate::runtime::context::{current_thread_id, enter_context};
use crate::runtime::scheduler::Scheduler;
use crate::task::Task;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// Scheduling policy plugged into a [`Scheduler`]'s worker loop.
pub trait Driver: Send + Sync + 'static {
    /// The scheduler whose queue and workers this driver runs.
    fn scheduler(&self) -> &Scheduler;

    /// Wakes one idle worker.
    fn tickle(&self);

    /// Body of every worker's idle fiber. Returning ends the worker's loop.
    fn idle(&self);

    /// Whether the workers may exit.
    fn stopping(&self) -> bool {
        self.scheduler().is_drained()
    }

    /// Downcast used to expose the current I/O manager to fibers.
    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }

    /// Enqueues a task and wakes a worker if the queue was empty.
    fn schedule(&self, task: Task) {
        if self.scheduler().enqueue(task) {
            self.tickle();
        }
    }

    /// Resumes `fiber` on any worker.
    fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule(Task::fiber(fiber));
    }

    /// Runs `function` on a pooled fiber of any worker.
    fn schedule_fn<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.schedule(Task::call(function));
    }

    /// Enqueues every task under a single lock, tickling at most once.
    fn schedule_batch(&self, tasks: Vec<Task>) {
        if self.scheduler().enqueue_all(tasks) {
            self.tickle();
        }
    }
}

/// Spawns the driver's worker threads. Does nothing once stopping or when the
/// workers already exist.
pub fn start(driver: Arc<dyn Driver>) {
    let scheduler = driver.scheduler();
    let mut threads = scheduler.threads.lock();

    if scheduler.is_stopping() || !threads.is_empty() {
        return;
    }

    for index in 0..scheduler.thread_count() {
        let (tx, rx) = mpsc::channel();
        let worker = driver.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}_{}", scheduler.name(), index))
            .spawn(move || {
                let _ = tx.send(current_thread_id());
                drop(tx);
                run(&worker);
            });

        match spawned {
            Ok(handle) => {
                if let Ok(tid) = rx.recv() {
                    scheduler.thread_ids.lock().push(tid);
                }
                threads.push(handle);
            }
            Err(error) => {
                log::error!("{}: failed to spawn worker {index}: {error}", scheduler.name());
            }
        }
    }

    log::info!("{} started with {} worker threads", scheduler.name(), threads.len());
}

/// Stops the driver: waits until every queued task ran, then joins the workers.
///
/// With a caller-mode scheduler this must run on the creating thread, which drains the
/// queue itself before returning.
pub fn stop(driver: &dyn Driver) {
    let scheduler = driver.scheduler();
    scheduler.set_auto_stop();

    if scheduler.caller_only_finished() {
        log::info!("{} stopped", scheduler.name());
        scheduler.set_stopping();
        if driver.stopping() {
            return;
        }
    }

    if let Some(root_thread) = scheduler.root_thread() {
        crate::invariant!(
            root_thread == current_thread_id(),
            "caller-mode scheduler {} must be stopped from its creating thread",
            scheduler.name()
        );
    }

    scheduler.set_stopping();

    for _ in 0..scheduler.thread_count() {
        driver.tickle();
    }

    let root_fiber = scheduler.root_fiber();
    if root_fiber.is_some() {
        driver.tickle();
    }

    if let Some(root) = root_fiber
        && !driver.stopping()
        && !root.state().is_finished()
    {
        root.call();
    }

    let threads = std::mem::take(&mut *scheduler.threads.lock());
    for handle in threads {
        if handle.join().is_err() {
            log::error!("{}: worker thread panicked", scheduler.name());
        }
    }

    log::info!("{} stopped", scheduler.name());
}

/// Worker entry point: runs the scheduling loop inside the driver's context.
pub(crate) fn run(driver: &Arc<dyn Driver>) {
    enter_context(driver, || driver.scheduler().run_loop(driver));
}
