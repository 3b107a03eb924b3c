//! Saved machine context of a fiber.
//!
//! Thin wrapper over `ucontext_t`. The context is boxed because glibc stores pointers
//! into the structure itself (the floating point save area), so it must never move
//! after `getcontext` ran.

use crate::fiber::stack::Stack;

use libc::{getcontext, makecontext, swapcontext, ucontext_t};
use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

pub(crate) struct Context {
    inner: Box<UnsafeCell<MaybeUninit<ucontext_t>>>,
}

// Only the thread currently switching into or out of the fiber touches the context.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Captures the calling thread's context. Used for root fibers.
    pub(crate) fn capture() -> io::Result<Self> {
        let context = Self {
            inner: Box::new(UnsafeCell::new(MaybeUninit::zeroed())),
        };

        if unsafe { getcontext(context.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(context)
    }

    /// Builds a context that starts `entry` on `stack`.
    pub(crate) fn on_stack(stack: &Stack, entry: extern "C" fn()) -> io::Result<Self> {
        let context = Self {
            inner: Box::new(UnsafeCell::new(MaybeUninit::zeroed())),
        };
        context.prepare(stack, entry)?;
        Ok(context)
    }

    /// Re-initialises the context to start `entry` from the top of `stack`.
    pub(crate) fn prepare(&self, stack: &Stack, entry: extern "C" fn()) -> io::Result<()> {
        let uc = self.as_ptr();

        unsafe {
            if getcontext(uc) != 0 {
                return Err(io::Error::last_os_error());
            }

            (*uc).uc_link = ptr::null_mut();
            (*uc).uc_stack.ss_sp = stack.bottom();
            (*uc).uc_stack.ss_size = stack.size();
            (*uc).uc_stack.ss_flags = 0;

            makecontext(uc, entry, 0);
        }

        Ok(())
    }

    /// Saves the running context into `from` and resumes `to`.
    ///
    /// # Safety
    /// `from` must describe the code calling this function and `to` must hold a valid,
    /// suspended context that no other thread is resuming.
    pub(crate) unsafe fn switch(from: &Context, to: &Context) -> io::Result<()> {
        if unsafe { swapcontext(from.as_ptr(), to.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn as_ptr(&self) -> *mut ucontext_t {
        self.inner.get() as *mut ucontext_t
    }
}
