use fiberio::{FdTable, TimeoutKind};

use std::os::unix::io::AsRawFd;

#[test]
fn test_regular_file_is_not_a_socket() {
    let file = tempfile::tempfile().unwrap();
    let table = FdTable::new();

    let context = table.get(file.as_raw_fd(), true).unwrap();
    assert!(context.is_initialized());
    assert!(!context.is_socket());
    assert!(!context.sys_nonblock());

    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    assert_eq!(flags & libc::O_NONBLOCK, 0);
}

#[test]
fn test_socket_is_switched_to_nonblocking() {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let table = FdTable::new();

    let context = table.get(socket.as_raw_fd(), true).unwrap();
    assert!(context.is_socket());
    assert!(context.sys_nonblock());
    assert!(!context.user_nonblock());

    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);
}

#[test]
fn test_lookup_without_auto_create() {
    let file = tempfile::tempfile().unwrap();
    let table = FdTable::new();

    assert!(table.get(file.as_raw_fd(), false).is_none());
    let created = table.get(file.as_raw_fd(), true).unwrap();
    let found = table.get(file.as_raw_fd(), false).unwrap();
    assert!(std::sync::Arc::ptr_eq(&created, &found));

    table.remove(file.as_raw_fd());
    assert!(table.get(file.as_raw_fd(), false).is_none());
    assert!(table.get(-1, true).is_none());
}

#[test]
fn test_table_grows_by_half_or_to_fit() {
    let table = FdTable::new();
    assert_eq!(table.capacity(), 64);

    // Unknown descriptors are recorded as uninitialized entries.
    let context = table.get(90, true).unwrap();
    assert!(!context.is_initialized());
    assert_eq!(table.capacity(), 96);

    table.get(500, true).unwrap();
    assert_eq!(table.capacity(), 501);

    table.remove(10_000);
    assert_eq!(table.capacity(), 501);
}

#[test]
fn test_timeouts_default_to_unbounded() {
    let file = tempfile::tempfile().unwrap();
    let table = FdTable::new();
    let context = table.get(file.as_raw_fd(), true).unwrap();

    assert_eq!(context.timeout(TimeoutKind::Recv), None);
    context.set_timeout(TimeoutKind::Recv, Some(250));
    assert_eq!(context.timeout(TimeoutKind::Recv), Some(250));
    assert_eq!(context.timeout(TimeoutKind::Send), None);

    assert_eq!(TimeoutKind::from_sockopt(libc::SO_SNDTIMEO), Some(TimeoutKind::Send));
    assert_eq!(TimeoutKind::from_sockopt(libc::SO_KEEPALIVE), None);
}
