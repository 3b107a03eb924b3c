//! Owned fiber stacks.
//!
//! Each stack is an anonymous private mapping with one inaccessible guard page at its
//! low end, so an overflow faults instead of silently corrupting the neighbouring
//! allocation. The mapping is released when the [`Stack`] is dropped.

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, MAP_STACK, PROT_NONE, PROT_READ, PROT_WRITE,
    _SC_PAGESIZE, c_void, mmap, mprotect, munmap, sysconf,
};
use std::io;
use std::ptr;

pub(crate) struct Stack {
    /// Start of the mapping, guard page included.
    base: *mut u8,
    /// Length of the mapping, guard page included.
    mapped: usize,
    /// Usable bytes above the guard page.
    size: usize,
}

// The mapping is exclusively owned; only the fiber running on it touches its contents.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Maps a stack with at least `size` usable bytes.
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = size.max(page).div_ceil(page) * page;
        let mapped = size + page;

        let base = unsafe {
            mmap(
                ptr::null_mut(),
                mapped,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_STACK,
                -1,
                0,
            )
        };

        if base == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if unsafe { mprotect(base, page, PROT_NONE) } != 0 {
            let error = io::Error::last_os_error();
            unsafe { munmap(base, mapped) };
            return Err(error);
        }

        Ok(Self {
            base: base as *mut u8,
            mapped,
            size,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub(crate) fn bottom(&self) -> *mut c_void {
        unsafe { self.base.add(self.mapped - self.size) as *mut c_void }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base as *mut c_void, self.mapped);
        }
    }
}

fn page_size() -> usize {
    match unsafe { sysconf(_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_to_pages() {
        let stack = Stack::new(1000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 1000);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        let bottom = stack.bottom() as *mut u8;

        unsafe {
            bottom.write(0xAB);
            bottom.add(stack.size() - 1).write(0xCD);
            assert_eq!(bottom.read(), 0xAB);
        }
    }
}
