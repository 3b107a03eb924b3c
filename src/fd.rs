//! Per-descriptor metadata consulted by the interception layer.
//!
//! The table remembers, for every descriptor the runtime has seen, whether it is a
//! socket, whether the user asked for non-blocking semantics, whether it was closed and
//! which send/receive timeouts apply. Sockets are switched to non-blocking mode at the
//! OS level the first time they are recorded; the user-visible blocking flag is tracked
//! separately so `fcntl(F_GETFL)` keeps reporting what the user set.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::fd::{FdTable, TimeoutKind};
//!
//! let context = FdTable::global().get(socket, true).unwrap();
//! context.set_timeout(TimeoutKind::Recv, Some(250));
//! assert!(context.is_socket());
//! ```

use crate::hook::backend;

use parking_lot::RwLock;
use std::fmt;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const INITIAL_SIZE: usize = 64;

/// Stored in a timeout slot to mean "wait forever".
const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: reads, receives and accepts.
    Recv,
    /// `SO_SNDTIMEO`: writes and sends.
    Send,
}

impl TimeoutKind {
    /// Maps a socket option name to a timeout kind.
    pub fn from_sockopt(optname: i32) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// What the runtime knows about one descriptor.
pub struct FdContext {
    fd: RawFd,
    initialized: bool,
    socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdContext {
    /// Probes `fd`; a socket is put in OS non-blocking mode.
    pub fn new(fd: RawFd) -> FdContext {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fstat only writes into the provided buffer.
        let probed = unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == 0;

        let socket = probed && {
            // SAFETY: fstat succeeded and filled the buffer.
            let mode = unsafe { stat.assume_init() }.st_mode;
            mode & libc::S_IFMT == libc::S_IFSOCK
        };

        let mut sys_nonblock = false;
        if socket {
            let backend = backend::backend();
            let flags = backend.fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                backend.fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            sys_nonblock = true;
        }

        FdContext {
            fd,
            initialized: probed,
            socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether `fstat` succeeded when the context was created.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.socket
    }

    /// Whether the runtime put the descriptor in OS non-blocking mode.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// Whether the user asked for non-blocking semantics.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` for unbounded.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let value = self.slot(kind).load(Ordering::Acquire);
        (value != NO_TIMEOUT).then_some(value)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout_ms: Option<u64>) {
        self.slot(kind)
            .store(timeout_ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }
}

impl fmt::Debug for FdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd)
            .field("socket", &self.socket)
            .field("sys_nonblock", &self.sys_nonblock)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .field("recv_timeout", &self.timeout(TimeoutKind::Recv))
            .field("send_timeout", &self.timeout(TimeoutKind::Send))
            .finish()
    }
}

/// Descriptor-indexed table of [`FdContext`]s.
pub struct FdTable {
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            contexts: RwLock::new(vec![None; INITIAL_SIZE]),
        }
    }

    /// The process-wide table used by the interception layer.
    pub fn global() -> &'static FdTable {
        static TABLE: OnceLock<FdTable> = OnceLock::new();
        TABLE.get_or_init(FdTable::new)
    }

    /// Returns the context of `fd`, creating it when `auto_create` is set.
    ///
    /// # Arguments
    /// * `fd` - Descriptor number; negative values never match
    /// * `auto_create` - Probe and record the descriptor if it is unknown
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;

        {
            let contexts = self.contexts.read();
            match contexts.get(index) {
                Some(Some(context)) => return Some(context.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut contexts = self.contexts.write();
        if index >= contexts.len() {
            let len = (index + 1).max(contexts.len() * 3 / 2);
            contexts.resize(len, None);
        }

        if let Some(context) = &contexts[index] {
            return Some(context.clone());
        }

        let context = Arc::new(FdContext::new(fd));
        log::trace!("recorded fd {fd}: {context:?}");
        contexts[index] = Some(context.clone());
        Some(context)
    }

    /// Forgets `fd`.
    pub fn remove(&self, fd: RawFd) {
        let Ok(index) = usize::try_from(fd) else {
            return;
        };

        if let Some(slot) = self.contexts.write().get_mut(index) {
            *slot = None;
        }
    }

    /// Current table size.
    pub fn capacity(&self) -> usize {
        self.contexts.read().len()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
