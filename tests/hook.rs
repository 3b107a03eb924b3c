use fiberio::config;
use fiberio::hook;
use fiberio::{Driver, FdTable, IoManager, Task, TimeoutKind};

use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(res, 0, "socketpair() failed");
    (fds[0], fds[1])
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn run_in_fiber<T, F>(name: &str, function: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let io = IoManager::new(1, false, name).unwrap();
    let result = Arc::new(Mutex::new(None));

    let slot = result.clone();
    io.schedule(Task::call(move || {
        *slot.lock() = Some(function());
    }));

    io.stop();
    let value = result.lock().take();
    value.expect("task did not run")
}

#[test]
fn test_hook_is_disabled_outside_workers() {
    assert!(!hook::is_hook_enabled());
    assert!(run_in_fiber("enabled", hook::is_hook_enabled));
    assert!(!hook::is_hook_enabled());
}

#[test]
fn test_sleeping_fibers_share_one_worker() {
    let io = IoManager::new(1, false, "sleepers").unwrap();
    let start = Instant::now();
    let finished = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let finished = finished.clone();
        io.schedule(Task::call(move || {
            hook::usleep(300_000).unwrap();
            finished.lock().push(start.elapsed());
        }));
    }

    io.stop();

    let finished = finished.lock();
    assert_eq!(finished.len(), 2);
    for elapsed in finished.iter() {
        assert!(*elapsed >= Duration::from_millis(290), "woke at {elapsed:?}");
        assert!(*elapsed < Duration::from_millis(550), "woke at {elapsed:?}");
    }
}

#[test]
fn test_sleep_outside_a_worker_blocks_the_thread() {
    let start = Instant::now();
    hook::nanosleep(Duration::from_millis(20)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_read_times_out() {
    let (fd, peer) = socketpair();

    let (result, elapsed) = run_in_fiber("read-timeout", move || {
        FdTable::global().get(fd, true).unwrap();
        hook::setsockopt_timeout(fd, TimeoutKind::Recv, Some(Duration::from_millis(200))).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 16];
        let result = hook::read(fd, &mut buf).map_err(|error| error.kind());
        (result, start.elapsed())
    });

    assert_eq!(result, Err(ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(190), "timed out after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "timed out after {elapsed:?}");

    hook::close(fd).unwrap();
    hook::close(peer).unwrap();
}

#[test]
fn test_read_resumes_when_peer_writes() {
    let (fd, peer) = socketpair();
    let io = IoManager::new(1, false, "read-wake").unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    io.schedule(Task::call(move || {
        FdTable::global().get(fd, true).unwrap();
        let mut buf = [0u8; 16];
        let n = hook::read(fd, &mut buf).unwrap();
        sink.lock().extend_from_slice(&buf[..n]);
    }));

    io.schedule(Task::call(move || {
        hook::usleep(50_000).unwrap();
        assert_eq!(hook::write(peer, b"hello").unwrap(), 5);
    }));

    io.stop();
    assert_eq!(received.lock().as_slice(), b"hello");

    hook::close(fd).unwrap();
    hook::close(peer).unwrap();
}

#[test]
fn test_connect_and_talk_to_local_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(b"pong").unwrap();
        buf
    });

    let reply = run_in_fiber("client", move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(FdTable::global().get(fd, false).unwrap().is_socket());

        hook::connect(fd, &addr).unwrap();
        assert_eq!(hook::send(fd, b"ping", 0).unwrap(), 4);

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += hook::recv(fd, &mut buf[read..], 0).unwrap();
        }

        hook::close(fd).unwrap();
        assert!(FdTable::global().get(fd, false).is_none());
        buf
    });

    assert_eq!(&server.join().unwrap(), b"ping");
    assert_eq!(&reply, b"pong");
}

#[test]
fn test_connect_to_filtered_address_times_out() {
    config::tcp_connect_timeout().set_value(500);
    let target: SocketAddr = "10.255.255.1:80".parse().unwrap();

    let (result, elapsed) = run_in_fiber("connect-timeout", move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let start = Instant::now();
        let result = hook::connect(fd, &target).map_err(|error| error.kind());
        let elapsed = start.elapsed();
        hook::close(fd).unwrap();
        (result, elapsed)
    });

    config::tcp_connect_timeout().set_value(5000);

    match result {
        Err(ErrorKind::TimedOut) => {
            assert!(elapsed >= Duration::from_millis(480), "timed out after {elapsed:?}");
            assert!(elapsed < Duration::from_millis(2000), "timed out after {elapsed:?}");
        }
        // Sandboxes without a route fail fast instead.
        Err(_) => assert!(elapsed < Duration::from_millis(2000)),
        Ok(()) => panic!("connected to a filtered address"),
    }
}

#[test]
fn test_nonblocking_flag_is_tracked_per_user() {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(fd >= 0);

    let context = FdTable::global().get(fd, true).unwrap();
    assert!(context.is_socket());
    assert!(context.sys_nonblock());

    let raw = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert_ne!(raw & libc::O_NONBLOCK, 0);
    assert_eq!(hook::fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK, 0);

    let flags = hook::fcntl_getfl(fd).unwrap();
    hook::fcntl_setfl(fd, flags | libc::O_NONBLOCK).unwrap();
    assert!(context.user_nonblock());
    assert_ne!(hook::fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK, 0);

    hook::fcntl_setfl(fd, flags & !libc::O_NONBLOCK).unwrap();
    assert!(!context.user_nonblock());
    let raw = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert_ne!(raw & libc::O_NONBLOCK, 0);

    hook::ioctl_fionbio(fd, true).unwrap();
    assert!(context.user_nonblock());
    hook::ioctl_fionbio(fd, false).unwrap();
    assert!(!context.user_nonblock());
    let raw = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert_ne!(raw & libc::O_NONBLOCK, 0);

    hook::close(fd).unwrap();
    assert!(context.is_closed());
    assert!(FdTable::global().get(fd, false).is_none());
}

#[test]
fn test_socket_timeouts_are_recorded() {
    let (fd, peer) = socketpair();
    let context = FdTable::global().get(fd, true).unwrap();

    hook::setsockopt_timeout(fd, TimeoutKind::Send, Some(Duration::from_millis(1500))).unwrap();
    assert_eq!(context.timeout(TimeoutKind::Send), Some(1500));
    assert_eq!(context.timeout(TimeoutKind::Recv), None);

    hook::setsockopt_timeout(fd, TimeoutKind::Send, None).unwrap();
    assert_eq!(context.timeout(TimeoutKind::Send), None);
    assert_eq!(hook::getsockopt_error(fd).unwrap(), 0);

    hook::close(fd).unwrap();
    hook::close(peer).unwrap();
}

#[test]
fn test_vectored_io_between_fibers() {
    let (fd, peer) = socketpair();

    let received = run_in_fiber("vectored", move || {
        FdTable::global().get(fd, true).unwrap();
        FdTable::global().get(peer, true).unwrap();

        let parts = [std::io::IoSlice::new(b"ab"), std::io::IoSlice::new(b"cd")];
        assert_eq!(hook::writev(peer, &parts).unwrap(), 4);

        let mut first = [0u8; 1];
        let mut rest = [0u8; 3];
        let mut bufs = [std::io::IoSliceMut::new(&mut first), std::io::IoSliceMut::new(&mut rest)];
        let n = hook::readv(fd, &mut bufs).unwrap();
        assert_eq!(n, 4);
        [first[0], rest[0], rest[1], rest[2]]
    });

    assert_eq!(&received, b"abcd");
    hook::close(fd).unwrap();
    hook::close(peer).unwrap();
}

#[test]
fn test_zero_timeouts_wake_every_reader_on_many_workers() {
    const READERS: usize = 100;
    let io = IoManager::new(4, false, "zero-timeouts").unwrap();
    let timed_out = Arc::new(AtomicUsize::new(0));

    for _ in 0..READERS {
        let timed_out = timed_out.clone();
        io.schedule(Task::call(move || {
            let (fd, peer) = socketpair();
            FdTable::global().get(fd, true).unwrap();
            hook::setsockopt_timeout(fd, TimeoutKind::Recv, Some(Duration::ZERO)).unwrap();

            let mut buf = [0u8; 4];
            let result = hook::read(fd, &mut buf).map_err(|error| error.kind());

            hook::close(fd).unwrap();
            hook::close(peer).unwrap();
            if result == Err(ErrorKind::TimedOut) {
                timed_out.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    let finished = wait_until(Duration::from_secs(5), || {
        timed_out.load(Ordering::SeqCst) == READERS
    });
    assert!(
        finished,
        "{} of {READERS} reads returned, {} events still registered",
        timed_out.load(Ordering::SeqCst),
        io.pending_events()
    );
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn test_msghdr_calls_pass_a_descriptor() {
    let (fd, peer) = socketpair();
    let mut pipe = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
    let (pipe_read, pipe_write) = (pipe[0], pipe[1]);

    let io = IoManager::new(1, false, "msghdr").unwrap();
    let received = Arc::new(Mutex::new(None));

    let slot = received.clone();
    io.schedule(Task::call(move || {
        FdTable::global().get(fd, true).unwrap();

        let mut data = [0u8; 8];
        let mut control = [0u64; 8];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = size_of_val(&control) as _;

        // Parks until the sender below runs.
        let n = unsafe { hook::recvmsg(fd, &mut msg, 0) }.unwrap();

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        assert!(!cmsg.is_null());
        assert_eq!(unsafe { (*cmsg).cmsg_type }, libc::SCM_RIGHTS);
        let passed = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<i32>()) };

        *slot.lock() = Some((data[..n].to_vec(), passed));
    }));

    io.schedule(Task::call(move || {
        FdTable::global().get(peer, true).unwrap();
        hook::usleep(50_000).unwrap();

        let mut payload = *b"fd";
        let mut control = [0u64; 8];
        let space = unsafe { libc::CMSG_SPACE(size_of::<i32>() as u32) } as usize;
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<i32>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<i32>(), pipe_read);
        }

        assert_eq!(unsafe { hook::sendmsg(peer, &msg, 0) }.unwrap(), 2);
    }));

    io.stop();

    let (data, passed) = received.lock().take().expect("receiver did not run");
    assert_eq!(data, b"fd");
    assert_ne!(passed, pipe_read);

    assert_eq!(unsafe { libc::write(pipe_write, b"x".as_ptr().cast(), 1) }, 1);
    let mut byte = [0u8; 1];
    assert_eq!(unsafe { libc::read(passed, byte.as_mut_ptr().cast(), 1) }, 1);
    assert_eq!(&byte, b"x");

    for raw in [passed, pipe_read, pipe_write] {
        unsafe { libc::close(raw) };
    }
    hook::close(fd).unwrap();
    hook::close(peer).unwrap();
}

#[test]
fn test_connect_forwards_untracked_descriptors() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let (untracked, closed) = run_in_fiber("untracked-connect", move || {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(raw >= 0);
        FdTable::global().remove(raw);
        let untracked = hook::connect(raw, &addr).map_err(|error| error.raw_os_error());
        unsafe { libc::close(raw) };

        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        FdTable::global().get(fd, false).unwrap().set_closed(true);
        let closed = hook::connect(fd, &addr).map_err(|error| error.raw_os_error());
        hook::close(fd).unwrap();

        (untracked, closed)
    });

    assert_eq!(untracked, Ok(()));
    assert_eq!(closed, Err(Some(libc::EBADF)));
}
