//! Integration tests: per-thread and global timers over live reactors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iomux::{IoManager, ThreadRegex, TimerCookie, TimerHandle};

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

#[test]
fn thread_timer_fires_once() {
    let mgr = IoManager::new();
    mgr.start(1, false, None, None).expect("start failed");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);
    let sched = Arc::clone(&mgr);
    mgr.run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            let flag = Arc::clone(&flag);
            let handle = sched.schedule_thread_timer(
                Duration::from_millis(20),
                false,
                None,
                Box::new(move |_cookie| {
                    flag.fetch_add(1, Ordering::Relaxed);
                }),
            );
            assert!(!handle.is_null());
        },
        true,
    );

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) == 1,
        Duration::from_secs(5)
    ));
    // One-shot: give it room to misfire again.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::Relaxed), 1);

    mgr.stop();
}

#[test]
fn recurring_thread_timer_repeats_until_cancelled() {
    let mgr = IoManager::new();
    mgr.start(1, false, None, None).expect("start failed");

    let fired = Arc::new(AtomicUsize::new(0));
    let handle_slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

    let flag = Arc::clone(&fired);
    let slot = Arc::clone(&handle_slot);
    let sched = Arc::clone(&mgr);
    mgr.run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            let flag = Arc::clone(&flag);
            let handle = sched.schedule_thread_timer(
                Duration::from_millis(10),
                true,
                None,
                Box::new(move |_cookie| {
                    flag.fetch_add(1, Ordering::Relaxed);
                }),
            );
            *slot.lock().unwrap() = Some(handle);
        },
        true,
    );

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) >= 3,
        Duration::from_secs(5)
    ));

    // Cancellation happens on the owning thread.
    let slot = Arc::clone(&handle_slot);
    let cancel = Arc::clone(&mgr);
    mgr.run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            if let Some(handle) = *slot.lock().unwrap() {
                cancel.cancel_thread_timer(handle);
            }
        },
        true,
    );

    // Best-effort cancel: at most one in-flight fire may still land.
    let after_cancel = fired.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(100));
    assert!(fired.load(Ordering::Relaxed) <= after_cancel + 1);

    mgr.stop();
}

#[test]
fn global_worker_timer_delivers_cookie() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cookie: TimerCookie = Arc::new(42u32);
    let handle = mgr.schedule_global_timer(
        Duration::from_millis(20),
        false,
        Some(cookie),
        ThreadRegex::AllWorker,
        Box::new(move |cookie| {
            let value = cookie
                .and_then(|c| c.downcast_ref::<u32>())
                .copied()
                .unwrap_or(0);
            sink.lock().unwrap().push(value);
        }),
    );
    assert!(!handle.is_null());

    assert!(wait_until(
        || !seen.lock().unwrap().is_empty(),
        Duration::from_secs(5)
    ));
    assert_eq!(seen.lock().unwrap().clone(), vec![42]);

    mgr.stop();
}

#[test]
fn global_timer_cancel_prevents_fire() {
    let mgr = IoManager::new();
    mgr.start(1, false, None, None).expect("start failed");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);
    let handle = mgr.schedule_global_timer(
        Duration::from_millis(150),
        false,
        None,
        ThreadRegex::AllWorker,
        Box::new(move |_cookie| {
            flag.fetch_add(1, Ordering::Relaxed);
        }),
    );
    assert!(!handle.is_null());
    mgr.cancel_global_timer(ThreadRegex::AllWorker, handle);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    mgr.stop();
}

#[test]
fn recurring_global_timer() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);
    let handle = mgr.schedule_global_timer(
        Duration::from_millis(10),
        true,
        None,
        ThreadRegex::AllWorker,
        Box::new(move |_cookie| {
            flag.fetch_add(1, Ordering::Relaxed);
        }),
    );
    assert!(!handle.is_null());

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) >= 3,
        Duration::from_secs(5)
    ));
    mgr.cancel_global_timer(ThreadRegex::AllWorker, handle);

    mgr.stop();
}

#[test]
fn polled_global_timer_fires_via_poller() {
    let mgr = IoManager::new();
    mgr.start(1, true, None, None).expect("polled start failed");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);
    let handle = mgr.schedule_global_timer(
        Duration::from_millis(20),
        false,
        None,
        ThreadRegex::AllWorker,
        Box::new(move |_cookie| {
            flag.fetch_add(1, Ordering::Relaxed);
        }),
    );
    assert!(!handle.is_null());

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) == 1,
        Duration::from_secs(5)
    ));

    mgr.stop();
}
