use fiberio::{Driver, Error, Event, Fiber, IoManager, SchedulerBuilder, Task};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(res, 0, "pipe2() failed");
    (fds[0], fds[1])
}

fn close(fd: i32) {
    unsafe {
        libc::close(fd);
    }
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

#[test]
fn test_read_and_write_combine_and_cancel_fires_once() {
    let io = IoManager::new(1, false, "mask").unwrap();
    let (rfd, wfd) = pipe();

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let on_read = reads.clone();
    io.add_event(
        rfd,
        Event::READ,
        Some(Box::new(move || {
            on_read.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    // The read end of a pipe never becomes writable.
    let on_write = writes.clone();
    io.add_event(
        rfd,
        Event::WRITE,
        Some(Box::new(move || {
            on_write.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert_eq!(io.registered(rfd), Event::READ | Event::WRITE);
    assert_eq!(io.pending_events(), 2);

    let again = io.add_event(rfd, Event::READ, Some(Box::new(|| {})));
    assert!(matches!(again, Err(Error::EventExists { .. })));

    assert!(io.cancel_event(rfd, Event::READ));
    assert_eq!(io.registered(rfd), Event::WRITE);
    assert!(wait_until(Duration::from_secs(2), || reads.load(Ordering::SeqCst) == 1));
    assert!(!io.cancel_event(rfd, Event::READ));

    assert!(io.del_event(rfd, Event::WRITE));
    assert_eq!(io.registered(rfd), Event::NONE);
    assert_eq!(io.pending_events(), 0);

    io.stop();
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 0);

    close(rfd);
    close(wfd);
}

#[test]
fn test_readiness_runs_callback() {
    let io = IoManager::new(1, false, "ready").unwrap();
    let (rfd, wfd) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let on_read = fired.clone();
    io.add_event(
        rfd,
        Event::READ,
        Some(Box::new(move || {
            on_read.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    let wrote = unsafe { libc::write(wfd, b"x".as_ptr().cast(), 1) };
    assert_eq!(wrote, 1);

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(io.registered(rfd), Event::NONE);

    io.stop();
    close(rfd);
    close(wfd);
}

#[test]
fn test_only_the_fiber_waiting_on_the_ready_fd_resumes() {
    let io = IoManager::new(2, false, "two-fds").unwrap();
    let (read_a, write_a) = pipe();
    let (read_b, write_b) = pipe();
    let woken = Arc::new(Mutex::new(Vec::new()));

    for (name, fd) in [("a", read_a), ("b", read_b)] {
        let woken = woken.clone();
        io.schedule(Task::call(move || {
            let io = IoManager::current().unwrap();
            io.add_event(fd, Event::READ, None).unwrap();
            Fiber::yield_to_hold();
            woken.lock().push(name);
        }));
    }

    assert!(wait_until(Duration::from_secs(2), || io.pending_events() == 2));

    unsafe { libc::write(write_a, b"a".as_ptr().cast(), 1) };
    assert!(wait_until(Duration::from_secs(2), || woken.lock().len() == 1));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*woken.lock(), vec!["a"]);

    unsafe { libc::write(write_b, b"b".as_ptr().cast(), 1) };
    assert!(wait_until(Duration::from_secs(2), || woken.lock().len() == 2));
    assert_eq!(*woken.lock(), vec!["a", "b"]);

    io.stop();
    for fd in [read_a, write_a, read_b, write_b] {
        close(fd);
    }
}

#[test]
fn test_cancel_all_wakes_parked_fiber() {
    let io = IoManager::new(1, false, "cancel-all").unwrap();
    let (rfd, wfd) = pipe();
    let resumed = Arc::new(AtomicUsize::new(0));

    let flag = resumed.clone();
    io.schedule(Task::call(move || {
        let io = IoManager::current().unwrap();
        io.add_event(rfd, Event::READ, None).unwrap();
        Fiber::yield_to_hold();
        flag.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(wait_until(Duration::from_secs(2), || io.pending_events() == 1));
    assert!(io.cancel_all(rfd));
    assert!(!io.cancel_all(rfd));

    assert!(wait_until(Duration::from_secs(2), || resumed.load(Ordering::SeqCst) == 1));

    io.stop();
    close(rfd);
    close(wfd);
}

#[test]
fn test_add_event_without_callback_needs_a_fiber() {
    let io = IoManager::new(1, false, "no-fiber").unwrap();
    let (rfd, wfd) = pipe();

    assert!(matches!(io.add_event(rfd, Event::READ, None), Err(Error::NotInScheduler)));
    assert!(matches!(
        io.add_event(-1, Event::READ, Some(Box::new(|| {}))),
        Err(Error::InvalidFd(-1))
    ));

    io.stop();
    close(rfd);
    close(wfd);
}

#[test]
fn test_recurring_timer_fires_every_period() {
    let io = SchedulerBuilder::new()
        .threads(1)
        .use_caller(false)
        .name("recurring")
        .build_io()
        .unwrap();

    let start = Instant::now();
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let record = fired_at.clone();
    let timer = io.add_timer(1000, move || record.lock().push(start.elapsed()), true);

    assert!(wait_until(Duration::from_secs(6), || fired_at.lock().len() >= 3));
    timer.cancel();
    io.stop();

    let fired_at = fired_at.lock();
    for (index, elapsed) in fired_at.iter().take(3).enumerate() {
        let expected = Duration::from_millis(1000 * (index as u64 + 1));
        assert!(*elapsed >= expected - Duration::from_millis(20), "fire {index} at {elapsed:?}");
        assert!(*elapsed < expected + Duration::from_millis(500), "fire {index} at {elapsed:?}");
    }
}

#[test]
fn test_stop_waits_for_pending_timers() {
    let io = IoManager::new(2, false, "drain").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let hit = fired.clone();
    io.add_timer(
        100,
        move || {
            hit.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!io.timers().has_timer());
}

#[test]
fn test_caller_mode_io_manager_drains_on_stop() {
    let io = IoManager::new(1, true, "caller-io").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let hits = hits.clone();
        io.schedule(Task::call(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }

    assert!(IoManager::current().is_some());
    io.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn test_stop_wakes_every_blocked_worker() {
    let io = IoManager::new(4, false, "wake-all").unwrap();
    assert!(wait_until(Duration::from_secs(2), || io.scheduler().idle_threads() == 4));
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    io.stop();
    let elapsed = start.elapsed();

    // Far below the 3000 ms `reactor.max_wait_ms` bound on a single wait.
    assert!(elapsed < Duration::from_millis(1000), "stop took {elapsed:?}");
}
