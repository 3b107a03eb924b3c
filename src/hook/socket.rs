//! Socket lifecycle and option calls, kept consistent with the descriptor table.

use crate::fd::{FdTable, TimeoutKind};
use crate::hook::backend::backend;
use crate::hook::{connect_timeout, cvt, do_io, errno, is_hook_enabled, wait_for};
use crate::reactor::{Event, IoManager};

use libc::{c_int, sa_family_t, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Encodes `addr` as a kernel socket address.
pub(crate) fn socket_addr_to_raw(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    // SAFETY: sockaddr_storage is plain old data.
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = sockaddr_in {
                sin_family: libc::AF_INET as sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_storage is large and aligned enough for any address.
            unsafe { std::ptr::write((&mut storage as *mut sockaddr_storage).cast(), raw) };
            size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = sockaddr_in6 {
                sin6_family: libc::AF_INET6 as sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: see above.
            unsafe { std::ptr::write((&mut storage as *mut sockaddr_storage).cast(), raw) };
            size_of::<sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

/// Decodes a kernel socket address; `None` for families other than IPv4 and IPv6.
pub(crate) fn raw_to_socket_addr(storage: &sockaddr_storage, len: socklen_t) -> Option<SocketAddr> {
    let len = len as usize;

    match storage.ss_family as c_int {
        libc::AF_INET if len >= size_of::<sockaddr_in>() => {
            // SAFETY: the family tag says the storage holds a sockaddr_in.
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<sockaddr_in>() };
            let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
        }
        libc::AF_INET6 if len >= size_of::<sockaddr_in6>() => {
            // SAFETY: the family tag says the storage holds a sockaddr_in6.
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(raw.sin6_addr.s6_addr),
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Creates a socket and records it, which switches it to OS non-blocking mode.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = cvt(backend().socket(domain, ty, protocol))?;

    if is_hook_enabled() {
        FdTable::global().get(fd, true);
    }

    Ok(fd)
}

/// Connects with the default timeout from the `tcp.connect.timeout` tunable.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout())
}

/// Connects, parking the fiber until the handshake completes or `timeout_ms` elapses.
///
/// Descriptors missing from the [`FdTable`] are forwarded unmodified to a plain,
/// possibly blocking `connect`, the same rule the read and write calls follow. Only a
/// descriptor recorded and then closed is refused with `EBADF`.
///
/// # Arguments
/// * `fd` - Socket to connect
/// * `addr` - Peer address
/// * `timeout_ms` - Upper bound on the wait, `None` for unbounded
///
/// # Errors
/// `ETIMEDOUT` when the timeout fires first, otherwise the socket's pending error.
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: Option<u64>) -> io::Result<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    let raw_connect = || cvt(backend().connect(fd, &storage, len)).map(drop);

    if !is_hook_enabled() {
        return raw_connect();
    }

    let Some(context) = FdTable::global().get(fd, false) else {
        return raw_connect();
    };

    if context.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }

    if !context.is_socket() || context.user_nonblock() {
        return raw_connect();
    }

    if backend().connect(fd, &storage, len) == 0 {
        return Ok(());
    }

    let error = io::Error::last_os_error();
    if errno() != libc::EINPROGRESS {
        return Err(error);
    }

    let Some(io) = IoManager::current() else {
        return Err(error);
    };

    log::debug!("connect: fd {fd} to {addr} in progress, timeout {timeout_ms:?}");
    match wait_for(&io, fd, Event::WRITE, timeout_ms, "connect") {
        Err(error) if error.raw_os_error() == Some(libc::ETIMEDOUT) => return Err(error),
        Err(error) => log::error!("connect: waiting on fd {fd} failed: {error}"),
        Ok(()) => {}
    }

    match getsockopt_error(fd)? {
        0 => Ok(()),
        pending => Err(io::Error::from_raw_os_error(pending)),
    }
}

/// Accepts a connection and records the new socket.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    // SAFETY: sockaddr_storage is plain old data.
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;

    let accepted = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        len = size_of::<sockaddr_storage>() as socklen_t;
        backend().accept(fd, &mut storage, &mut len) as isize
    })?;

    let client = accepted as RawFd;
    if is_hook_enabled() {
        FdTable::global().get(client, true);
    }

    Ok((client, raw_to_socket_addr(&storage, len)))
}

/// Closes `fd`, first waking every fiber parked on it, and forgets its metadata.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(context) = FdTable::global().get(fd, false) {
        context.set_closed(true);
        if is_hook_enabled()
            && let Some(io) = IoManager::current()
        {
            io.cancel_all(fd);
        }
        FdTable::global().remove(fd);
    }

    cvt(backend().close(fd)).map(drop)
}

/// `fcntl(F_GETFL)` reporting the blocking mode the user asked for.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<c_int> {
    let flags = cvt(backend().fcntl(fd, libc::F_GETFL, 0))?;

    match FdTable::global().get(fd, false) {
        Some(context) if !context.is_closed() && context.is_socket() => {
            if context.user_nonblock() {
                Ok(flags | libc::O_NONBLOCK)
            } else {
                Ok(flags & !libc::O_NONBLOCK)
            }
        }
        _ => Ok(flags),
    }
}

/// `fcntl(F_SETFL)` recording the user's `O_NONBLOCK` while keeping tracked sockets
/// non-blocking at the OS level.
pub fn fcntl_setfl(fd: RawFd, flags: c_int) -> io::Result<()> {
    let mut flags = flags;

    if let Some(context) = FdTable::global().get(fd, false)
        && !context.is_closed()
        && context.is_socket()
    {
        context.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
        if context.sys_nonblock() {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }
    }

    cvt(backend().fcntl(fd, libc::F_SETFL, flags)).map(drop)
}

/// `ioctl(FIONBIO)` with the same bookkeeping as [`fcntl_setfl`].
pub fn ioctl_fionbio(fd: RawFd, nonblock: bool) -> io::Result<()> {
    let mut value = c_int::from(nonblock);

    if let Some(context) = FdTable::global().get(fd, false)
        && !context.is_closed()
        && context.is_socket()
    {
        context.set_user_nonblock(nonblock);
        value = c_int::from(nonblock || context.sys_nonblock());
    }

    cvt(backend().ioctl_fionbio(fd, &mut value)).map(drop)
}

/// Sets `SO_RCVTIMEO` or `SO_SNDTIMEO`, which also bounds how long intercepted calls
/// park. `None` clears the timeout.
pub fn setsockopt_timeout(fd: RawFd, kind: TimeoutKind, timeout: Option<Duration>) -> io::Result<()> {
    if let Some(context) = FdTable::global().get(fd, false) {
        let ms = timeout.map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        context.set_timeout(kind, ms);
    }

    let timeout = timeout.unwrap_or(Duration::ZERO);
    let value = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };

    cvt(backend().setsockopt_timeval(fd, libc::SOL_SOCKET, optname, &value)).map(drop)
}

/// Reads and clears the socket's pending error (`SO_ERROR`).
pub fn getsockopt_error(fd: RawFd) -> io::Result<c_int> {
    let mut value: c_int = 0;
    cvt(backend().getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut value))?;
    Ok(value)
}
