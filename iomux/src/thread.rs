//! Logical I/O thread identity.
//!
//! A reactor hosts one or more logical I/O threads. Each carries a dense
//! process-wide [`ThreadIdx`] (used to index per-device context arenas) and
//! a [`ThreadAddr`] naming its hosting reactor and slot within it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::polled::PolledThreadHandle;

/// Observer invoked when a logical I/O thread starts (`true`) or stops
/// (`false`).
pub type ThreadStateNotifier = Arc<dyn Fn(&Arc<IoThread>, bool) + Send + Sync>;

/// Dense process-wide index of a logical I/O thread, unique while held.
pub type ThreadIdx = u32;

/// Index of a reactor in the manager's reactor table.
pub type ReactorIdx = usize;

/// Address of one logical I/O thread: hosting reactor plus local slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadAddr {
    /// Index of the hosting reactor.
    pub reactor: ReactorIdx,
    /// Slot of the thread within that reactor.
    pub slot: u32,
}

/// Predicate selecting a set of logical I/O threads for broadcast and
/// load-balanced delivery.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadRegex {
    /// Every logical I/O thread.
    AllIo,
    /// Every manager-owned worker thread.
    AllWorker,
    /// Every externally-attached user thread.
    AllUser,
    /// The single I/O thread with the smallest `outstanding_ops`.
    LeastBusyIo,
    /// The single worker thread with the smallest `outstanding_ops`.
    LeastBusyWorker,
    /// The single user thread with the smallest `outstanding_ops`.
    LeastBusyUser,
    /// One uniformly-chosen worker thread.
    RandomWorker,
}

impl ThreadRegex {
    /// Whether this predicate resolves to a single least-busy thread.
    pub fn is_least_busy(&self) -> bool {
        matches!(
            self,
            ThreadRegex::LeastBusyIo | ThreadRegex::LeastBusyWorker | ThreadRegex::LeastBusyUser
        )
    }

    /// Whether a thread of the given role matches this predicate.
    pub(crate) fn matches(&self, is_worker: bool) -> bool {
        match self {
            ThreadRegex::AllIo | ThreadRegex::LeastBusyIo => true,
            ThreadRegex::AllWorker | ThreadRegex::LeastBusyWorker | ThreadRegex::RandomWorker => {
                is_worker
            }
            ThreadRegex::AllUser | ThreadRegex::LeastBusyUser => !is_worker,
        }
    }
}

/// How messages reach the thread: through its reactor's inbox, or directly
/// into a polled-runtime mailbox (no reactor-table lock on that path).
#[derive(Clone)]
pub(crate) enum ThreadImpl {
    Reactor(ReactorIdx),
    Polled(PolledThreadHandle),
}

/// One logical I/O thread hosted by a reactor.
pub struct IoThread {
    /// Address of this thread (hosting reactor + slot).
    pub addr: ThreadAddr,
    /// Dense process-wide index, reserved from the manager's pool.
    pub thread_idx: ThreadIdx,
    pub(crate) imp: ThreadImpl,
    is_worker: bool,
    outstanding_ops: AtomicI64,
}

impl IoThread {
    pub(crate) fn new(addr: ThreadAddr, thread_idx: ThreadIdx, imp: ThreadImpl, is_worker: bool) -> Self {
        Self {
            addr,
            thread_idx,
            imp,
            is_worker,
            outstanding_ops: AtomicI64::new(0),
        }
    }

    /// Whether this thread is hosted by a manager-owned worker reactor.
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    /// Current in-flight operation count, sampled for least-busy selection.
    pub fn outstanding_ops(&self) -> i64 {
        self.outstanding_ops.load(Ordering::Relaxed)
    }

    /// Adjust the in-flight gauge. Must be called from the owning thread
    /// only; other threads may sample but never write.
    pub fn add_outstanding_ops(&self, delta: i64) {
        let prev = self.outstanding_ops.fetch_add(delta, Ordering::Relaxed);
        debug_assert!(prev + delta >= 0, "outstanding_ops went negative");
    }

    /// Overwrite the in-flight gauge. Owning thread only.
    pub fn set_outstanding_ops(&self, value: i64) {
        debug_assert!(value >= 0);
        self.outstanding_ops.store(value, Ordering::Relaxed);
    }
}

/// Bounded pool issuing the smallest free index in `[0, capacity)`.
///
/// Backs [`ThreadIdx`] reservation. One u64 word per 64 indices, scanned in
/// order so freed indices are reused smallest-first.
pub(crate) struct ThreadIdxPool {
    words: Mutex<Vec<u64>>,
    capacity: usize,
}

impl ThreadIdxPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let nwords = capacity.div_ceil(64);
        Self {
            words: Mutex::new(vec![0u64; nwords]),
            capacity,
        }
    }

    /// Reserve the smallest free index, or fail when saturated.
    pub(crate) fn reserve(&self) -> Result<ThreadIdx, Error> {
        let mut words = self.words.lock().unwrap();
        for (wi, word) in words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let idx = wi * 64 + bit;
                if idx >= self.capacity {
                    break;
                }
                *word |= 1u64 << bit;
                return Ok(idx as ThreadIdx);
            }
        }
        Err(Error::ThreadsExhausted)
    }

    /// Release a previously reserved index. Idempotent.
    pub(crate) fn release(&self, idx: ThreadIdx) {
        let idx = idx as usize;
        if idx >= self.capacity {
            return;
        }
        let mut words = self.words.lock().unwrap();
        words[idx / 64] &= !(1u64 << (idx % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_smallest_first() {
        let pool = ThreadIdxPool::new(8);
        assert_eq!(pool.reserve().unwrap(), 0);
        assert_eq!(pool.reserve().unwrap(), 1);
        assert_eq!(pool.reserve().unwrap(), 2);
    }

    #[test]
    fn reuses_released_index() {
        let pool = ThreadIdxPool::new(8);
        for _ in 0..4 {
            pool.reserve().unwrap();
        }
        pool.release(1);
        assert_eq!(pool.reserve().unwrap(), 1);
    }

    #[test]
    fn exhaustion() {
        let pool = ThreadIdxPool::new(3);
        for want in 0..3 {
            assert_eq!(pool.reserve().unwrap(), want);
        }
        assert!(matches!(pool.reserve(), Err(Error::ThreadsExhausted)));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = ThreadIdxPool::new(65);
        let idx = pool.reserve().unwrap();
        pool.release(idx);
        pool.release(idx);
        assert_eq!(pool.reserve().unwrap(), idx);
    }

    #[test]
    fn spans_word_boundary() {
        let pool = ThreadIdxPool::new(130);
        for want in 0..130 {
            assert_eq!(pool.reserve().unwrap(), want);
        }
        assert!(pool.reserve().is_err());
        pool.release(129);
        pool.release(64);
        assert_eq!(pool.reserve().unwrap(), 64);
        assert_eq!(pool.reserve().unwrap(), 129);
    }

    #[test]
    fn regex_matching() {
        assert!(ThreadRegex::AllIo.matches(true));
        assert!(ThreadRegex::AllIo.matches(false));
        assert!(ThreadRegex::AllWorker.matches(true));
        assert!(!ThreadRegex::AllWorker.matches(false));
        assert!(!ThreadRegex::LeastBusyUser.matches(true));
        assert!(ThreadRegex::LeastBusyUser.matches(false));
        assert!(ThreadRegex::RandomWorker.matches(true));
    }
}
