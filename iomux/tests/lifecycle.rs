//! Integration tests: manager bring-up and tear-down.
//!
//! Each test owns a fresh manager, drives it through start/stop with real
//! OS threads, and asserts the lifecycle invariants.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iomux::{IoDevice, IoInterface, IoManager, IoThread, MgrState, ThreadRegex};

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ── S1: bring-up / tear-down ────────────────────────────────────────

#[test]
fn start_stop_four_workers() {
    let mgr = IoManager::new();
    mgr.start(4, false, None, None).expect("start failed");
    assert_eq!(mgr.get_state(), MgrState::Running);

    // Exactly four worker reactors answer a synchronous broadcast.
    let fanout = mgr.run_on(ThreadRegex::AllWorker, |_addr| {}, true);
    assert_eq!(fanout, 4);

    mgr.stop();
    assert_eq!(mgr.get_state(), MgrState::Stopped);

    // All workers are gone: nothing left to deliver to.
    let fanout = mgr.run_on(ThreadRegex::AllWorker, |_addr| {}, true);
    assert_eq!(fanout, 0);
    assert!(mgr.default_drive_interface().is_none());
    assert!(mgr.generic_interface().is_none());
}

#[test]
fn start_is_idempotent_when_running() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");
    // Second start is a warned no-op.
    mgr.start(8, false, None, None).expect("restart should no-op");
    assert_eq!(mgr.run_on(ThreadRegex::AllWorker, |_addr| {}, true), 2);
    mgr.stop();
}

#[test]
fn waiter_blocks_until_running() {
    let mgr = IoManager::new();
    let waiter_mgr = Arc::clone(&mgr);
    let reached = Arc::new(AtomicUsize::new(0));
    let reached2 = Arc::clone(&reached);
    let waiter = thread::spawn(move || {
        waiter_mgr.wait_for_state(MgrState::Running);
        reached2.store(1, Ordering::Release);
    });

    thread::sleep(Duration::from_millis(50));
    assert_eq!(reached.load(Ordering::Acquire), 0, "woke before start");

    mgr.start(2, false, None, None).expect("start failed");
    waiter.join().unwrap();
    assert_eq!(reached.load(Ordering::Acquire), 1);
    mgr.stop();
}

#[test]
fn thread_state_notifier_sees_every_worker() {
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let (s1, s2) = (Arc::clone(&started), Arc::clone(&stopped));

    let mgr = IoManager::new();
    mgr.start(
        3,
        false,
        Some(Arc::new(move |_thread: &Arc<IoThread>, up: bool| {
            if up {
                s1.fetch_add(1, Ordering::Relaxed);
            } else {
                s2.fetch_add(1, Ordering::Relaxed);
            }
        })),
        None,
    )
    .expect("start failed");

    // The started broadcast is asynchronous.
    assert!(wait_until(
        || started.load(Ordering::Relaxed) == 3,
        Duration::from_secs(5)
    ));

    mgr.stop();
    assert_eq!(stopped.load(Ordering::Relaxed), 3);
}

// ── S6: interface registration ordering ─────────────────────────────

struct CountingInterface {
    starts: Mutex<Vec<u32>>,
    stops: AtomicUsize,
}

impl CountingInterface {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }
}

impl IoInterface for CountingInterface {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn on_io_thread_start(&self, thread: &Arc<IoThread>) {
        self.starts.lock().unwrap().push(thread.thread_idx);
    }

    fn on_io_thread_stop(&self, _thread: &Arc<IoThread>) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_event(&self, _device: &Arc<IoDevice>, _events: u32) {}
}

#[test]
fn add_interface_initialises_every_live_thread_once() {
    let mgr = IoManager::new();
    mgr.start(3, false, None, None).expect("start failed");

    let iface = CountingInterface::new();
    mgr.add_interface(Arc::clone(&iface) as Arc<dyn IoInterface>);

    // add_interface is synchronous: by the time it returns, every live
    // thread has run on_io_thread_start exactly once.
    let starts = iface.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    let unique: HashSet<u32> = starts.iter().copied().collect();
    assert_eq!(unique.len(), 3, "duplicate initialisation: {starts:?}");

    mgr.stop();
    assert_eq!(iface.stops.load(Ordering::Relaxed), 3);
}

#[test]
fn interface_adder_replaces_default_drive() {
    let adder_ran = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&adder_ran);
    let mgr = IoManager::new();
    mgr.start(
        2,
        false,
        None,
        Some(Box::new(move |_mgr: &Arc<IoManager>| {
            flag.store(1, Ordering::Release);
        })),
    )
    .expect("start failed");

    assert_eq!(adder_ran.load(Ordering::Acquire), 1);
    assert!(
        mgr.default_drive_interface().is_none(),
        "custom adder must suppress the built-in drive interface"
    );
    mgr.stop();
}

#[test]
fn default_drive_interface_present_between_start_and_stop() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");
    let drive = mgr.default_drive_interface().expect("no default drive");
    assert_eq!(drive.name(), "aio-drive");
    mgr.stop();
    assert!(mgr.default_drive_interface().is_none());
}

// ── User reactors ───────────────────────────────────────────────────

#[test]
fn user_reactor_attaches_and_relinquishes_on_stop() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");

    let user_mgr = Arc::clone(&mgr);
    let user = thread::spawn(move || user_mgr.run_user_loop(None, None));

    assert!(wait_until(
        || mgr.run_on(ThreadRegex::AllUser, |_addr| {}, true) == 1,
        Duration::from_secs(5)
    ));
    // Workers are unaffected by the user attach.
    assert_eq!(mgr.run_on(ThreadRegex::AllWorker, |_addr| {}, true), 2);

    mgr.stop();
    user.join().unwrap().expect("user loop failed");
}

// ── Polled mode ─────────────────────────────────────────────────────

#[test]
fn polled_start_stop() {
    let mgr = IoManager::new();
    mgr.start(2, true, None, None).expect("polled start failed");
    assert_eq!(mgr.get_state(), MgrState::Running);
    assert!(mgr.is_polled());

    let drive = mgr.default_drive_interface().expect("no default drive");
    assert_eq!(drive.name(), "polled-drive");

    assert_eq!(mgr.run_on(ThreadRegex::AllWorker, |_addr| {}, true), 2);
    mgr.stop();
    assert_eq!(mgr.get_state(), MgrState::Stopped);
}

// ── Aligned buffers ─────────────────────────────────────────────────

#[test]
fn iobuf_round_trip() {
    let mgr = IoManager::new();
    let buf = mgr.iobuf_alloc(512, 100);
    assert!(!buf.is_null());
    assert_eq!(buf as usize % 512, 0);
    let grown = mgr.iobuf_realloc(buf, 512, 4096);
    assert!(!grown.is_null());
    assert_eq!(grown as usize % 512, 0);
    mgr.iobuf_free(grown);
}
