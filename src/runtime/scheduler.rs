//! M:N fiber scheduler.
//!
//! A [`Scheduler`] multiplexes fibers and closures over a fixed pool of OS threads.
//! Pending work sits in a single FIFO shared by every worker; each worker takes the
//! first task it may run, resumes it, and goes back to the queue. When nothing is
//! runnable the worker resumes its idle fiber, whose behaviour comes from the
//! [`Driver`] owning the scheduler.
//!
//! With `use_caller` the constructing thread counts as one of the workers: it runs the
//! scheduling loop inside a caller-mode root fiber when [`Scheduler::stop`] is called,
//! draining whatever is left before returning.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Driver, Scheduler, Task};
//!
//! let scheduler = Scheduler::new(1, true, "main")?;
//! scheduler.schedule(Task::call(|| println!("runs when main stops")));
//! scheduler.start();
//! scheduler.stop();
//! ```

use crate::error::Result;
use crate::fiber::{self, Fiber, FiberState};
use crate::runtime::context::{self, current_thread_id};
use crate::runtime::driver::{self, Driver};
use crate::runtime::queue::TaskQueue;
use crate::task::{Task, TaskKind};

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Fiber scheduler over a pool of OS threads.
pub struct Scheduler {
    name: String,
    queue: TaskQueue,
    pub(crate) threads: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) thread_ids: Mutex<Vec<i32>>,
    /// Worker threads to spawn, not counting an adopted caller thread.
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_thread: Option<i32>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Creates a plain scheduler that is its own [`Driver`].
    ///
    /// # Arguments
    /// * `threads` - Total worker count, including the caller when `use_caller` is set
    /// * `use_caller` - Adopt the constructing thread as a worker
    /// * `name` - Used for worker thread names and log lines
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] when the caller's root fiber cannot be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Scheduler>> {
        let scheduler = Arc::new(Scheduler::unbound(threads, use_caller, name));

        if use_caller {
            let weak: Weak<Scheduler> = Arc::downgrade(&scheduler);
            scheduler.adopt_caller(weak, None)?;
        }

        Ok(scheduler)
    }

    /// Scheduler state for a custom [`Driver`] that embeds it. The caller thread is not
    /// adopted.
    pub fn for_driver(threads: usize, name: &str) -> Scheduler {
        Scheduler::unbound(threads, false, name)
    }

    // Drivers adopting the caller call `adopt_caller` once they live in an `Arc`.
    pub(crate) fn unbound(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        crate::invariant!(threads > 0, "scheduler {name} needs at least one thread");

        let (thread_count, root_thread) = if use_caller {
            (threads - 1, Some(current_thread_id()))
        } else {
            (threads, None)
        };

        Scheduler {
            name: name.to_string(),
            queue: TaskQueue::new(),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(root_thread.into_iter().collect()),
            thread_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
        }
    }

    /// Creates the caller-mode root fiber that runs `driver`'s loop on this thread.
    pub(crate) fn adopt_caller(
        &self,
        driver: Weak<dyn Driver>,
        io_manager: Option<Weak<crate::reactor::IoManager>>,
    ) -> Result<()> {
        // The thread's root fiber must exist before the caller-mode fiber can return to it.
        drop(Fiber::current());

        let weak = driver.clone();
        let root = Fiber::with_caller(
            move || {
                if let Some(driver) = weak.upgrade() {
                    driver::run(&driver);
                }
            },
            0,
        )?;

        *self.root_fiber.lock() = Some(root);
        context::bind(driver, io_manager);
        Ok(())
    }

    /// Returns the driver serving the current thread, if any.
    pub fn current() -> Option<Arc<dyn Driver>> {
        context::current_driver()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the worker threads. Calling it again, or after [`Self::stop`], does nothing.
    pub fn start(self: &Arc<Self>) {
        driver::start(self.clone());
    }

    /// Waits for the queue to drain, then stops and joins every worker.
    pub fn stop(&self) {
        driver::stop(self);
    }

    /// OS thread ids of the workers, the adopted caller first.
    pub fn thread_ids(&self) -> Vec<i32> {
        self.thread_ids.lock().clone()
    }

    /// Number of worker threads spawned by [`Self::start`].
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn root_thread(&self) -> Option<i32> {
        self.root_thread
    }

    pub(crate) fn root_fiber(&self) -> Option<Arc<Fiber>> {
        self.root_fiber.lock().clone()
    }

    /// Workers currently running a task.
    pub fn active_threads(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_threads(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads() > 0
    }

    /// Tasks waiting to be dispatched.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_auto_stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);
    }

    /// Stop was requested, the queue is empty and no worker is running a task.
    pub fn is_drained(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.is_stopping()
            && self.queue.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    // Caller-only scheduler whose loop never ran or already finished.
    pub(crate) fn caller_only_finished(&self) -> bool {
        self.thread_count == 0
            && self
                .root_fiber
                .lock()
                .as_ref()
                .is_some_and(|root| matches!(root.state(), FiberState::Term | FiberState::Init))
    }

    /// Pushes a task; returns whether the queue was empty and a worker should be woken.
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        self.queue.push(task)
    }

    pub(crate) fn enqueue_all(&self, tasks: Vec<Task>) -> bool {
        self.queue.push_all(tasks)
    }

    /// The scheduling loop executed by every worker.
    pub(crate) fn run_loop(&self, driver: &Arc<dyn Driver>) {
        let thread = current_thread_id();
        log::debug!("{}: worker {thread} entering loop", self.name);

        // Whatever runs this loop (thread root or caller-mode root fiber) is where
        // suspended fibers switch back to.
        let scheduler_fiber = Fiber::current();
        fiber::set_scheduler_fiber(Arc::as_ptr(&scheduler_fiber));

        let idle_driver = driver.clone();
        let idle_fiber = match Fiber::new(move || idle_driver.idle(), 0) {
            Ok(fiber) => fiber,
            Err(error) => {
                log::error!("{}: cannot create idle fiber: {error}", self.name);
                fiber::set_scheduler_fiber(std::ptr::null());
                return;
            }
        };

        let mut call_fiber: Option<Arc<Fiber>> = None;

        loop {
            let taken = self.queue.take_for(thread, || {
                self.active.fetch_add(1, Ordering::SeqCst);
            });

            if taken.tickle {
                driver.tickle();
            }

            let Some(task) = taken.task else {
                if idle_fiber.state() == FiberState::Term {
                    log::debug!("{}: idle fiber finished on worker {thread}", self.name);
                    break;
                }

                self.idle.fetch_add(1, Ordering::SeqCst);
                idle_fiber.swap_in();
                self.idle.fetch_sub(1, Ordering::SeqCst);
                continue;
            };

            match task.kind {
                TaskKind::Fiber(fiber) => {
                    if !fiber.state().is_finished() {
                        fiber.swap_in();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);

                    if fiber.state() == FiberState::Ready {
                        driver.schedule(Task::fiber(fiber));
                    }
                }
                TaskKind::Call(function) => {
                    let fiber = match call_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(function);
                            fiber
                        }
                        None => match Fiber::create(function, 0, false) {
                            Ok(fiber) => fiber,
                            Err(error) => {
                                log::error!("{}: cannot create task fiber: {error}", self.name);
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };

                    fiber.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);

                    match fiber.state() {
                        FiberState::Ready => driver.schedule(Task::fiber(fiber)),
                        // Finished: keep the stack for the next closure.
                        state if state.is_finished() => call_fiber = Some(fiber),
                        // Parked: whoever resumes it now owns it.
                        _ => {}
                    }
                }
            }
        }

        fiber::set_scheduler_fiber(std::ptr::null());
    }
}

impl Driver for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn tickle(&self) {
        log::trace!("{}: tickle", self.name);
    }

    fn idle(&self) {
        log::debug!("{}: idle", self.name);

        while !self.stopping() {
            std::thread::yield_now();
            Fiber::yield_to_hold();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_stopping() {
            log::warn!("{} dropped without being stopped", self.name);
        }

        if self.root_thread == Some(current_thread_id()) {
            context::unbind(self);
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("active", &self.active_threads())
            .field("idle", &self.idle_threads())
            .field("pending", &self.pending_tasks())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
