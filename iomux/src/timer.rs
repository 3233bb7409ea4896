//! Timer services.
//!
//! One contract, two implementations: [`EpollTimer`] drives a min-heap of
//! deadlines from a single non-blocking timer descriptor woken by the
//! reactor's readiness loop; [`PolledTimer`] delegates to the polled
//! runtime's periodic poller. Latency is bounded only by "the next loop
//! iteration after the deadline"; recurring timers re-arm after the
//! callback returns. Cancellation is lazy and best-effort against an
//! in-flight fire.

use std::any::Any;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::metrics::TIMERS_FIRED;
use crate::polled::PolledThreadHandle;

/// Opaque cookie passed back to timer callbacks.
pub type TimerCookie = Arc<dyn Any + Send + Sync>;

/// Timer callback; receives the cookie the timer was scheduled with.
pub type TimerCallback = Box<dyn FnMut(Option<&TimerCookie>) + Send>;

/// Handle for cancelling a scheduled timer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle {
    pub(crate) id: u64,
}

impl TimerHandle {
    /// Sentinel returned when scheduling fails.
    pub const NULL: TimerHandle = TimerHandle { id: u64::MAX };

    /// Whether this is the failed-schedule sentinel.
    pub fn is_null(&self) -> bool {
        self.id == u64::MAX
    }
}

/// Common timer contract shared by both variants.
pub trait Timer: Send + Sync {
    /// Schedule `cb` to fire `after` from now, optionally recurring with
    /// the same period. Returns [`TimerHandle::NULL`] on failure.
    fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        cb: TimerCallback,
    ) -> TimerHandle;

    /// Cancel a pending timer. Best-effort: a concurrent fire may still
    /// run the callback once.
    fn cancel(&self, handle: TimerHandle);
}

// ── Deadline heap ────────────────────────────────────────────────

struct TimerEntry {
    id: u64,
    deadline: Instant,
    /// Recurrence period; `None` for one-shot entries.
    period: Option<Duration>,
    cookie: Option<TimerCookie>,
    cb: TimerCallback,
}

struct HeapSlot(TimerEntry);

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap, tie-broken by id for determinism.
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

/// Min-heap of deadlines with lazy cancellation.
struct TimerHeap {
    heap: BinaryHeap<HeapSlot>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl TimerHeap {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 1,
        }
    }

    fn insert(
        &mut self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        cb: TimerCallback,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(HeapSlot(TimerEntry {
            id,
            deadline: Instant::now() + after,
            period: recurring.then_some(after),
            cookie,
            cb,
        }));
        id
    }

    fn cancel(&mut self, id: u64) {
        self.cancelled.insert(id);
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
    }

    /// Pop every entry due at `now`, dropping cancelled ones.
    fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap().0;
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(entry);
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        due
    }

    fn requeue(&mut self, mut entry: TimerEntry, period: Duration) {
        if self.cancelled.remove(&entry.id) {
            return;
        }
        entry.deadline = Instant::now() + period;
        self.heap.push(HeapSlot(entry));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|slot| slot.0.deadline)
    }
}

// ── Readiness-notified variant ───────────────────────────────────

/// Timer backed by a non-blocking `timerfd` and a deadline heap.
///
/// The descriptor is registered with the hosting reactor's readiness loop
/// (directly for per-thread timers, as a scoped global device for manager
/// timers); [`fire_due`](Self::fire_due) runs on whichever reactor observes
/// it readable.
pub struct EpollTimer {
    fd: RawFd,
    inner: Mutex<TimerHeap>,
}

impl EpollTimer {
    pub fn new() -> Result<Arc<Self>, Error> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Arc::new(Self {
            fd,
            inner: Mutex::new(TimerHeap::new()),
        }))
    }

    /// The timer descriptor, for readiness registration.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drain the descriptor and run every due callback. Recurring entries
    /// re-queue after their callback returns.
    pub fn fire_due(&self) {
        // One epoll set per matching reactor may share this fd; the
        // non-blocking read decides which reactor fires this round.
        let mut expirations: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            return;
        }

        let now = Instant::now();
        let due = self.inner.lock().unwrap().pop_due(now);
        for mut entry in due {
            (entry.cb)(entry.cookie.as_ref());
            TIMERS_FIRED.increment();
            if let Some(period) = entry.period {
                self.inner.lock().unwrap().requeue(entry, period);
            }
        }
        self.rearm();
    }

    fn rearm(&self) {
        let next = self.inner.lock().unwrap().next_deadline();
        let value = match next {
            Some(deadline) => {
                let delay = deadline.saturating_duration_since(Instant::now());
                let mut value = libc::timespec {
                    tv_sec: delay.as_secs() as libc::time_t,
                    tv_nsec: delay.subsec_nanos() as libc::c_long,
                };
                // A zero it_value disarms; an already due deadline still
                // needs to fire.
                if value.tv_sec == 0 && value.tv_nsec == 0 {
                    value.tv_nsec = 1;
                }
                value
            }
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        unsafe {
            libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut());
        }
    }
}

impl Timer for EpollTimer {
    fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        cb: TimerCallback,
    ) -> TimerHandle {
        let id = self
            .inner
            .lock()
            .unwrap()
            .insert(after, recurring, cookie, cb);
        self.rearm();
        TimerHandle { id }
    }

    fn cancel(&self, handle: TimerHandle) {
        if handle.is_null() {
            return;
        }
        self.inner.lock().unwrap().cancel(handle.id);
    }
}

impl Drop for EpollTimer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ── Polled variant ───────────────────────────────────────────────

/// Timer delegated to a polled thread's periodic poller.
pub struct PolledTimer {
    target: PolledThreadHandle,
    pollers: Mutex<HashMap<u64, u64>>,
    next_id: AtomicU64,
}

impl PolledTimer {
    pub fn new(target: PolledThreadHandle) -> Arc<Self> {
        Arc::new(Self {
            target,
            pollers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }
}

impl Timer for PolledTimer {
    fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        mut cb: TimerCallback,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let poller = self.target.register_poller(
            after,
            !recurring,
            Box::new(move || {
                cb(cookie.as_ref());
                TIMERS_FIRED.increment();
            }),
        );
        self.pollers.lock().unwrap().insert(id, poller);
        TimerHandle { id }
    }

    fn cancel(&self, handle: TimerHandle) {
        if handle.is_null() {
            return;
        }
        if let Some(poller) = self.pollers.lock().unwrap().remove(&handle.id) {
            self.target.unregister_poller(poller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn heap_pops_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let slow = heap.insert(Duration::from_millis(50), false, None, noop());
        let fast = heap.insert(Duration::from_millis(1), false, None, noop());
        let due = heap.pop_due(Instant::now() + Duration::from_millis(100));
        assert_eq!(
            due.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![fast, slow]
        );
    }

    #[test]
    fn pop_due_respects_now() {
        let mut heap = TimerHeap::new();
        heap.insert(Duration::from_millis(1), false, None, noop());
        heap.insert(Duration::from_secs(3600), false, None, noop());
        let due = heap.pop_due(Instant::now() + Duration::from_millis(10));
        assert_eq!(due.len(), 1);
        assert!(heap.next_deadline().is_some());
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut heap = TimerHeap::new();
        let keep = heap.insert(Duration::from_millis(1), false, None, noop());
        let drop_ = heap.insert(Duration::from_millis(1), false, None, noop());
        heap.cancel(drop_);
        let due = heap.pop_due(Instant::now() + Duration::from_millis(10));
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![keep]);
    }

    #[test]
    fn recurring_requeues_unless_cancelled() {
        let mut heap = TimerHeap::new();
        let id = heap.insert(Duration::from_millis(1), true, None, noop());
        let mut due = heap.pop_due(Instant::now() + Duration::from_millis(10));
        let entry = due.pop().unwrap();
        heap.requeue(entry, Duration::from_millis(1));
        assert!(heap.next_deadline().is_some());

        heap.cancel(id);
        let mut due = heap.pop_due(Instant::now() + Duration::from_millis(10));
        assert!(due.pop().is_none());
    }

    #[test]
    fn epoll_timer_creates_descriptor() {
        let timer = EpollTimer::new().unwrap();
        assert!(timer.fd() >= 0);
        let handle = timer.schedule(Duration::from_secs(60), false, None, noop());
        assert!(!handle.is_null());
        timer.cancel(handle);
    }
}
