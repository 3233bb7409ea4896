//! Polled-thread runtime seam.
//!
//! Tight-loop reactors delegate their thread hosting to an external
//! user-space I/O runtime. The core only depends on the small contract in
//! [`PolledRuntime`]: initialise, create a thread, deliver a job into its
//! mailbox, and poll it. [`LoopbackRuntime`] is the in-process
//! implementation used when no external runtime is wired in; it backs the
//! polled reactor with plain channels and a periodic-poller list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::alloc::AlignedAlloc;
use crate::error::Error;

/// A job delivered into a polled thread's mailbox.
pub type PolledJob = Box<dyn FnOnce() + Send>;

/// Callback of a periodic poller registered on a polled thread.
pub type PollerFn = Box<dyn FnMut() + Send>;

struct PollerEntry {
    id: u64,
    period: Duration,
    next_due: Instant,
    /// One-shot pollers are dropped after their first fire.
    once: bool,
    cb: PollerFn,
}

/// Handle to one polled thread: a mailbox plus its periodic pollers.
///
/// Cloneable and shareable; delivery through the handle does not take any
/// reactor-table lock.
#[derive(Clone)]
pub struct PolledThreadHandle {
    name: Arc<str>,
    tx: Sender<PolledJob>,
    rx: Receiver<PolledJob>,
    pollers: Arc<Mutex<Vec<PollerEntry>>>,
    next_poller_id: Arc<AtomicU64>,
}

impl PolledThreadHandle {
    fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name: Arc::from(name),
            tx,
            rx,
            pollers: Arc::new(Mutex::new(Vec::new())),
            next_poller_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Name the thread was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver a job into the mailbox. Returns false if the thread is gone.
    pub fn send(&self, job: PolledJob) -> bool {
        self.tx.send(job).is_ok()
    }

    /// Register a periodic poller. `once` pollers unregister themselves
    /// after the first fire.
    pub fn register_poller(&self, period: Duration, once: bool, cb: PollerFn) -> u64 {
        let id = self.next_poller_id.fetch_add(1, Ordering::Relaxed);
        let mut pollers = self.pollers.lock().unwrap();
        pollers.push(PollerEntry {
            id,
            period,
            next_due: Instant::now() + period,
            once,
            cb,
        });
        id
    }

    /// Remove a poller. Best-effort: an in-flight fire may still complete.
    pub fn unregister_poller(&self, id: u64) {
        let mut pollers = self.pollers.lock().unwrap();
        pollers.retain(|p| p.id != id);
    }

    /// Drain the mailbox and fire due pollers. Must be called from the
    /// thread that owns the poll loop. Returns the amount of work done.
    pub(crate) fn run_pending(&self) -> usize {
        let mut worked = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            worked += 1;
        }

        let now = Instant::now();
        // Take due pollers out so their callbacks run without the lock held
        // (a callback may register or unregister pollers).
        let mut due = Vec::new();
        {
            let mut pollers = self.pollers.lock().unwrap();
            let mut i = 0;
            while i < pollers.len() {
                if pollers[i].next_due <= now {
                    due.push(pollers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for mut entry in due {
            (entry.cb)();
            worked += 1;
            if !entry.once {
                entry.next_due = Instant::now() + entry.period;
                self.pollers.lock().unwrap().push(entry);
            }
        }
        worked
    }
}

/// Contract of the external polled-thread library.
pub trait PolledRuntime: Send + Sync {
    /// Initialise the runtime. Idempotent; failure aborts manager start.
    fn init(&self) -> Result<(), Error>;

    /// Create one polled thread and return its handle.
    fn create_thread(&self, name: &str) -> Result<PolledThreadHandle, Error>;

    /// Run pending mailbox jobs and due pollers on the given thread.
    /// Called from the hosting reactor's tight loop.
    fn poll(&self, thread: &PolledThreadHandle) -> usize;

    /// Aligned allocator supplied by the runtime, swapped into the
    /// process-wide slot when polled mode activates.
    fn aligned_allocator(&self) -> Option<Box<dyn AlignedAlloc>> {
        None
    }

    /// Initialise the block-device subsystem; `on_done` runs on the calling
    /// thread once initialisation completes.
    fn init_block_subsystem(&self, on_done: Box<dyn FnOnce() + Send>) {
        on_done();
    }
}

/// In-process polled runtime: channel mailboxes, no device back-end.
#[derive(Default)]
pub struct LoopbackRuntime;

impl PolledRuntime for LoopbackRuntime {
    fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    fn create_thread(&self, name: &str) -> Result<PolledThreadHandle, Error> {
        Ok(PolledThreadHandle::new(name))
    }

    fn poll(&self, thread: &PolledThreadHandle) -> usize {
        thread.run_pending()
    }

    fn aligned_allocator(&self) -> Option<Box<dyn AlignedAlloc>> {
        Some(Box::new(crate::alloc::LibcAlloc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn mailbox_runs_in_submission_order() {
        let rt = LoopbackRuntime;
        let th = rt.create_thread("t0").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            th.send(Box::new(move || order.lock().unwrap().push(i)));
        }
        rt.poll(&th);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn once_poller_fires_once() {
        let rt = LoopbackRuntime;
        let th = rt.create_thread("t0").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        th.register_poller(
            Duration::from_millis(0),
            true,
            Box::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        rt.poll(&th);
        rt.poll(&th);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_stops_poller() {
        let rt = LoopbackRuntime;
        let th = rt.create_thread("t0").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = th.register_poller(
            Duration::from_millis(1),
            false,
            Box::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }),
        );
        th.unregister_poller(id);
        std::thread::sleep(Duration::from_millis(5));
        rt.poll(&th);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
