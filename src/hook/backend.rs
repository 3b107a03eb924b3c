//! The raw system call surface the interception layer drives.
//!
//! Every method follows the kernel convention: a negative return means failure and the
//! reason is left in `errno`. The provided implementations call straight into `libc`,
//! so a custom backend only overrides what it needs to fake.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::hook::{IoBackend, install_backend, set_errno};
//!
//! struct NoWrites;
//!
//! impl IoBackend for NoWrites {
//!     fn write(&self, _fd: i32, _buf: &[u8]) -> isize {
//!         set_errno(libc::ENOSPC);
//!         -1
//!     }
//! }
//!
//! install_backend(Box::new(NoWrites));
//! ```

use libc::{c_int, c_void, msghdr, sockaddr, sockaddr_storage, socklen_t};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

/// Raw, possibly blocking operations wrapped by the interception layer.
pub trait IoBackend: Send + Sync + 'static {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        unsafe { libc::socket(domain, ty, protocol) }
    }

    fn connect(&self, fd: RawFd, addr: &sockaddr_storage, len: socklen_t) -> c_int {
        unsafe { libc::connect(fd, (addr as *const sockaddr_storage).cast::<sockaddr>(), len) }
    }

    fn accept(&self, fd: RawFd, addr: &mut sockaddr_storage, len: &mut socklen_t) -> c_int {
        unsafe { libc::accept(fd, (addr as *mut sockaddr_storage).cast::<sockaddr>(), len) }
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        unsafe { libc::read(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len()) }
    }

    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> isize {
        let count = bufs.len().min(c_int::MAX as usize) as c_int;
        unsafe { libc::readv(fd, bufs.as_mut_ptr().cast::<libc::iovec>(), count) }
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
        unsafe { libc::recv(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len(), flags) }
    }

    fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: c_int,
        addr: &mut sockaddr_storage,
        len: &mut socklen_t,
    ) -> isize {
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                flags,
                (addr as *mut sockaddr_storage).cast::<sockaddr>(),
                len,
            )
        }
    }

    /// # Safety
    /// Every pointer in `msg` (name, iovecs, control buffer) must be valid for writes
    /// of the lengths it declares.
    unsafe fn recvmsg(&self, fd: RawFd, msg: &mut msghdr, flags: c_int) -> isize {
        unsafe { libc::recvmsg(fd, msg, flags) }
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> isize {
        unsafe { libc::write(fd, buf.as_ptr().cast::<c_void>(), buf.len()) }
    }

    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> isize {
        let count = bufs.len().min(c_int::MAX as usize) as c_int;
        unsafe { libc::writev(fd, bufs.as_ptr().cast::<libc::iovec>(), count) }
    }

    fn send(&self, fd: RawFd, buf: &[u8], flags: c_int) -> isize {
        unsafe { libc::send(fd, buf.as_ptr().cast::<c_void>(), buf.len(), flags) }
    }

    fn sendto(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: c_int,
        addr: &sockaddr_storage,
        len: socklen_t,
    ) -> isize {
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast::<c_void>(),
                buf.len(),
                flags,
                (addr as *const sockaddr_storage).cast::<sockaddr>(),
                len,
            )
        }
    }

    /// # Safety
    /// Every pointer in `msg` must be valid for reads of the lengths it declares.
    unsafe fn sendmsg(&self, fd: RawFd, msg: &msghdr, flags: c_int) -> isize {
        unsafe { libc::sendmsg(fd, msg, flags) }
    }

    fn close(&self, fd: RawFd) -> c_int {
        unsafe { libc::close(fd) }
    }

    /// `fcntl` for the commands taking an integer argument (or none).
    fn fcntl(&self, fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
        unsafe { libc::fcntl(fd, cmd, arg) }
    }

    fn ioctl_fionbio(&self, fd: RawFd, nonblock: &mut c_int) -> c_int {
        unsafe { libc::ioctl(fd, libc::FIONBIO, nonblock as *mut c_int) }
    }

    fn getsockopt_int(&self, fd: RawFd, level: c_int, name: c_int, value: &mut c_int) -> c_int {
        let mut len = size_of::<c_int>() as socklen_t;
        unsafe { libc::getsockopt(fd, level, name, (value as *mut c_int).cast::<c_void>(), &mut len) }
    }

    fn setsockopt_timeval(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        value: &libc::timeval,
    ) -> c_int {
        unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                (value as *const libc::timeval).cast::<c_void>(),
                size_of::<libc::timeval>() as socklen_t,
            )
        }
    }
}

/// Backend calling the C library directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl IoBackend for SystemBackend {}

static BACKEND: OnceLock<Box<dyn IoBackend>> = OnceLock::new();

/// Selects the backend used by every intercepted call.
///
/// Must happen before the first intercepted call; returns `false` once a backend is
/// already in place.
pub fn install_backend(backend: Box<dyn IoBackend>) -> bool {
    let installed = BACKEND.set(backend).is_ok();
    if !installed {
        log::warn!("I/O backend already installed, keeping the existing one");
    }
    installed
}

/// The backend in use, [`SystemBackend`] unless another one was installed.
pub fn backend() -> &'static dyn IoBackend {
    BACKEND.get_or_init(|| Box::new(SystemBackend)).as_ref()
}
