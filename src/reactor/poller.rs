//! Thin wrapper over an epoll instance and its wake-up eventfd.
//!
//! The eventfd runs in semaphore mode and is registered level triggered, so every
//! [`EpollPoller::wake`] lets exactly one reader consume it while all waiters keep
//! seeing it readable until the count is used up. Waking N blocked workers takes N
//! wakes.

use crate::hook::errno;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EFD_SEMAPHORE, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLLIN, c_void,
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, eventfd,
};
use std::io;
use std::os::unix::io::RawFd;

/// Marker stored in the eventfd's registration to tell it apart from descriptor events.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

pub(crate) struct EpollPoller {
    epfd: RawFd,
    wake_fd: RawFd,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { eventfd(0, EFD_SEMAPHORE | EFD_NONBLOCK | EFD_CLOEXEC) };
        if wake_fd < 0 {
            let error = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(error);
        }

        let poller = EpollPoller { epfd, wake_fd };
        poller.ctl(EPOLL_CTL_ADD, poller.wake_fd, EPOLLIN as u32, WAKE_TOKEN)?;

        Ok(poller)
    }

    /// Adds, modifies or removes the registration of `fd`.
    pub(crate) fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };

        if unsafe { epoll_ctl(self.epfd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits up to `timeout_ms` and returns how many entries of `events` were filled.
    ///
    /// Interrupted waits are retried.
    pub(crate) fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        loop {
            let count = unsafe {
                epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };

            if count >= 0 {
                return Ok(count as usize);
            }

            if errno() != libc::EINTR {
                return Err(io::Error::last_os_error());
            }
        }
    }

    /// Lets one thread blocked in [`Self::wait`] return.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let written = unsafe {
            libc::write(self.wake_fd, (&one as *const u64).cast::<c_void>(), size_of::<u64>())
        };

        // A saturated counter already guarantees pending wake-ups.
        if written == size_of::<u64>() as isize || errno() == libc::EAGAIN {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Consumes a single wake-up. Returns `false` when another waiter took it first.
    pub(crate) fn consume_wake(&self) -> bool {
        let mut value: u64 = 0;
        let read = unsafe {
            libc::read(self.wake_fd, (&mut value as *mut u64).cast::<c_void>(), size_of::<u64>())
        };
        read == size_of::<u64>() as isize
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fd);
        }
    }
}
