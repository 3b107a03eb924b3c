//! Reads and writes that park the calling fiber while the socket is not ready.

use crate::fd::TimeoutKind;
use crate::hook::backend::backend;
use crate::hook::do_io;
use crate::hook::socket::{raw_to_socket_addr, socket_addr_to_raw};
use crate::reactor::Event;

use libc::{c_int, msghdr, sockaddr_storage, socklen_t};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Reads into `buf`, waiting for readability and honouring the receive timeout.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || {
        backend().read(fd, buf)
    })
}

/// Scatter read into `bufs`.
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || {
        backend().readv(fd, bufs)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || {
        backend().recv(fd, buf, flags)
    })
}

/// Receives a datagram and the address it came from.
pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<(usize, Option<SocketAddr>)> {
    // SAFETY: sockaddr_storage is plain old data.
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;

    let received = do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        len = size_of::<sockaddr_storage>() as socklen_t;
        backend().recvfrom(fd, buf, flags, &mut storage, &mut len)
    })?;

    Ok((received, raw_to_socket_addr(&storage, len)))
}

/// Receives a message described by `msg`, control data included.
///
/// # Safety
/// The name, iovec and control pointers in `msg` must be valid for writes of the
/// lengths they declare until the call returns.
pub unsafe fn recvmsg(fd: RawFd, msg: &mut msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        backend().recvmsg(fd, msg, flags)
    })
}

/// Writes `buf`, waiting for writability and honouring the send timeout.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || {
        backend().write(fd, buf)
    })
}

/// Gather write from `bufs`.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || {
        backend().writev(fd, bufs)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || {
        backend().send(fd, buf, flags)
    })
}

/// Sends a datagram to `addr`.
pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = socket_addr_to_raw(addr);

    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        backend().sendto(fd, buf, flags, &storage, len)
    })
}

/// Sends the message described by `msg`, control data included.
///
/// # Safety
/// The name, iovec and control pointers in `msg` must be valid for reads of the
/// lengths they declare until the call returns.
pub unsafe fn sendmsg(fd: RawFd, msg: &msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        backend().sendmsg(fd, msg, flags)
    })
}
