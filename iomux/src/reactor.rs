//! Reactor core.
//!
//! A reactor owns one OS thread and hosts 1..N logical I/O threads. It is
//! split into a shared [`ReactorHandle`] (what other threads see: role,
//! liveness, hosted threads, the delivery path) and loop-owned state that
//! only the reactor's own thread touches. The running loop is reachable
//! through a thread-local slot, installed on loop entry and cleared on
//! exit; manager APIs that say "the current thread" resolve through it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::device::{IoDevSelector, IoDevice};
use crate::error::Error;
use crate::manager::IoManager;
use crate::metrics::{REACTORS_ACTIVE, REACTORS_STARTED, REACTORS_STOPPED};
use crate::msg::Msg;
use crate::polled::PolledThreadHandle;
use crate::reactor_epoll::EpollState;
use crate::reactor_polled::PolledState;
use crate::thread::{IoThread, ReactorIdx, ThreadAddr, ThreadStateNotifier};
use crate::timer::Timer;

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Delivery path of a reactor, as seen from other threads.
pub(crate) enum HandleKind {
    /// Message queue drained on eventfd wake-ups.
    Epoll { tx: Sender<Msg>, evfd: std::os::fd::RawFd },
    /// Direct mailbox of the hosted polled thread.
    Polled { thread: PolledThreadHandle },
}

/// Shared face of one reactor.
pub struct ReactorHandle {
    idx: ReactorIdx,
    is_worker: bool,
    pub(crate) worker_slot: Option<usize>,
    pub(crate) kind: HandleKind,
    state: AtomicU8,
    threads: RwLock<Vec<Option<Arc<IoThread>>>>,
}

impl ReactorHandle {
    pub(crate) fn new(
        idx: ReactorIdx,
        is_worker: bool,
        worker_slot: Option<usize>,
        kind: HandleKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            idx,
            is_worker,
            worker_slot,
            kind,
            state: AtomicU8::new(STATE_INIT),
            threads: RwLock::new(Vec::new()),
        })
    }

    /// Index of this reactor in the manager's table.
    pub fn idx(&self) -> ReactorIdx {
        self.idx
    }

    /// Whether this reactor was created by the manager on `start`.
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    /// Whether this reactor busy-polls instead of blocking on readiness.
    pub fn is_tight_loop_reactor(&self) -> bool {
        matches!(self.kind, HandleKind::Polled { .. })
    }

    /// Whether this reactor currently hosts at least one I/O thread and is
    /// accepting deliveries.
    pub fn is_io_reactor(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
            && self.threads.read().unwrap().iter().any(Option::is_some)
    }

    pub(crate) fn set_running(&self) {
        self.state.store(STATE_RUNNING, Ordering::Release);
    }

    pub(crate) fn set_stopped(&self) {
        self.state.store(STATE_STOPPED, Ordering::Release);
    }

    /// All logical I/O threads currently hosted, in slot order.
    pub fn io_threads(&self) -> Vec<Arc<IoThread>> {
        self.threads
            .read()
            .unwrap()
            .iter()
            .filter_map(|t| t.clone())
            .collect()
    }

    /// Resolve a thread address to its hosted thread.
    pub fn addr_to_thread(&self, addr: ThreadAddr) -> Option<Arc<IoThread>> {
        if addr.reactor != self.idx {
            return None;
        }
        self.threads
            .read()
            .unwrap()
            .get(addr.slot as usize)
            .and_then(|t| t.clone())
    }

    /// The reactor's default hosted thread (first live slot).
    pub fn select_thread(&self) -> Option<Arc<IoThread>> {
        self.threads
            .read()
            .unwrap()
            .iter()
            .find_map(|t| t.clone())
    }

    pub(crate) fn install_thread(&self, thread: Arc<IoThread>) {
        let mut threads = self.threads.write().unwrap();
        let slot = thread.addr.slot as usize;
        if threads.len() <= slot {
            threads.resize_with(slot + 1, || None);
        }
        threads[slot] = Some(thread);
    }

    pub(crate) fn next_free_slot(&self) -> u32 {
        let threads = self.threads.read().unwrap();
        threads
            .iter()
            .position(Option::is_none)
            .unwrap_or(threads.len()) as u32
    }

    /// Remove a hosted thread; true when it was the last one.
    pub(crate) fn remove_thread(&self, slot: u32) -> bool {
        let mut threads = self.threads.write().unwrap();
        if let Some(entry) = threads.get_mut(slot as usize) {
            *entry = None;
        }
        !threads.iter().any(Option::is_some)
    }

    /// Enqueue a message for one hosted thread. Fails when the reactor is
    /// not an I/O reactor or the destination has relinquished.
    pub(crate) fn deliver_msg(&self, addr: ThreadAddr, msg: Msg, mgr: &Arc<IoManager>) -> bool {
        if !self.is_io_reactor() || self.addr_to_thread(addr).is_none() {
            return false;
        }
        let msg = msg.with_dest(addr);
        match &self.kind {
            HandleKind::Epoll { tx, evfd } => {
                if tx.send(msg).is_err() {
                    return false;
                }
                let val: u64 = 1;
                unsafe {
                    libc::write(*evfd, &val as *const u64 as *const libc::c_void, 8);
                }
                true
            }
            HandleKind::Polled { thread } => {
                let mgr = Arc::clone(mgr);
                thread.send(Box::new(move || dispatch_msg(&mgr, &msg)))
            }
        }
    }
}

/// Loop-owned reactor state. Lives in the thread-local slot while the loop
/// runs; only the owning thread touches it.
pub(crate) struct ReactorLoop {
    pub(crate) handle: Arc<ReactorHandle>,
    pub(crate) mgr: Arc<IoManager>,
    pub(crate) backend: Backend,
    pub(crate) thread_timer: Arc<dyn Timer>,
    pub(crate) iodev_selector: Option<IoDevSelector>,
    pub(crate) notifier: Option<ThreadStateNotifier>,
    pub(crate) exit: bool,
    pub(crate) current_slot: Option<u32>,
}

pub(crate) enum Backend {
    Epoll(EpollState),
    Polled(PolledState),
}

thread_local! {
    static CURRENT: RefCell<Option<ReactorLoop>> = const { RefCell::new(None) };
}

/// Run `f` against the reactor loop owned by the calling thread, if any.
/// The borrow must not be held across handler invocations; callers take
/// what they need out and release.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut ReactorLoop) -> R) -> Option<R> {
    CURRENT.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// The logical I/O thread the calling reactor thread is executing for:
/// the dispatch destination while a handler runs, the default hosted
/// thread otherwise. `None` off reactor threads.
pub fn iothread_self() -> Option<Arc<IoThread>> {
    let (handle, slot) = with_current(|r| (Arc::clone(&r.handle), r.current_slot))?;
    match slot {
        Some(slot) => handle.addr_to_thread(ThreadAddr {
            reactor: handle.idx(),
            slot,
        }),
        None => handle.select_thread(),
    }
}

/// Timer scoped to the calling reactor thread.
pub(crate) fn current_thread_timer() -> Option<Arc<dyn Timer>> {
    with_current(|r| Arc::clone(&r.thread_timer))
}

/// Add a device to the calling reactor's readiness set, subject to the
/// reactor's device selector. Non-fd devices are a no-op on epoll
/// reactors; polled reactors track nothing here.
pub(crate) fn attach_device_local(dev: &Arc<IoDevice>) -> bool {
    with_current(|r| {
        if let Some(selector) = &r.iodev_selector {
            if !selector(dev) {
                return false;
            }
        }
        match &mut r.backend {
            Backend::Epoll(e) => e.attach_device(dev),
            Backend::Polled(_) => true,
        }
    })
    .unwrap_or(false)
}

/// Remove a device from the calling reactor's readiness set.
pub(crate) fn detach_device_local(dev: &Arc<IoDevice>) {
    with_current(|r| {
        if let Backend::Epoll(e) = &mut r.backend {
            e.detach_device(dev);
        }
    });
}

/// Dispatch one message to its module handler on the calling reactor
/// thread. The destination slot is published as "current" for the duration
/// of the handler.
pub(crate) fn dispatch_msg(mgr: &Arc<IoManager>, msg: &Msg) {
    with_current(|r| r.current_slot = msg.dest().map(|a| a.slot));
    match mgr.get_msg_module(msg.module()) {
        Some(handler) => handler(msg),
        None => warn!("message for unregistered module {}", msg.module()),
    }
    with_current(|r| r.current_slot = None);
}

/// Notify thread-state observers (manager-wide and per-reactor) for one
/// thread of the calling reactor.
pub(crate) fn notify_thread_state_one(thread: &Arc<IoThread>, started: bool) {
    let parts = with_current(|r| (Arc::clone(&r.mgr), r.notifier.clone()));
    if let Some((mgr, own)) = parts {
        if let Some(n) = mgr.thread_state_notifier() {
            n(thread, started);
        }
        if let Some(n) = own {
            n(thread, started);
        }
    }
}

/// Notify observers for every thread hosted by the calling reactor.
pub fn notify_thread_state(started: bool) {
    let threads = with_current(|r| r.handle.io_threads()).unwrap_or_default();
    for thread in threads {
        notify_thread_state_one(&thread, started);
    }
}

/// Relinquish the I/O-thread status of the current dispatch destination
/// (or the default hosted thread). Exits the loop when it was the last.
pub(crate) fn relinquish_current_thread() {
    let parts = with_current(|r| {
        (
            Arc::clone(&r.mgr),
            Arc::clone(&r.handle),
            r.current_slot.unwrap_or(0),
        )
    });
    let Some((mgr, handle, slot)) = parts else {
        return;
    };
    let addr = ThreadAddr {
        reactor: handle.idx(),
        slot,
    };
    let Some(thread) = handle.addr_to_thread(addr) else {
        return;
    };

    mgr.foreach_interface(|iface| iface.on_io_thread_stop(&thread));
    notify_thread_state_one(&thread, false);

    let last = handle.remove_thread(slot);
    mgr.release_thread_idx(thread.thread_idx);
    if last {
        handle.set_stopped();
        with_current(|r| r.exit = true);
    }
}

/// Arguments for entering a reactor loop on the calling OS thread.
pub(crate) struct ReactorArgs {
    pub mgr: Arc<IoManager>,
    pub is_worker: bool,
    pub worker_slot: Option<usize>,
    pub is_polled: bool,
    pub iodev_selector: Option<IoDevSelector>,
    pub notifier: Option<ThreadStateNotifier>,
}

/// Enter a reactor loop on the calling OS thread. Blocks until the last
/// hosted thread relinquishes.
pub(crate) fn run_io_loop(args: ReactorArgs) -> Result<(), Error> {
    let mgr = Arc::clone(&args.mgr);
    let idx = mgr.alloc_reactor_idx();

    let built = if args.is_polled {
        crate::reactor_polled::build(&mgr, idx)
    } else {
        crate::reactor_epoll::build()
    };
    let (backend, kind, thread_timer) = match built {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("reactor {idx} setup failed: {e}");
            mgr.reactor_setup_failed(args.is_worker);
            return Err(e);
        }
    };

    let handle = ReactorHandle::new(idx, args.is_worker, args.worker_slot, kind);
    mgr.install_reactor(Arc::clone(&handle));

    let thread = match mgr.make_io_thread(&handle) {
        Ok(thread) => thread,
        Err(e) => {
            log::error!("reactor {idx} could not reserve an io thread: {e}");
            mgr.remove_reactor(idx);
            mgr.reactor_setup_failed(args.is_worker);
            return Err(e);
        }
    };

    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(ReactorLoop {
            handle: Arc::clone(&handle),
            mgr: Arc::clone(&mgr),
            backend,
            thread_timer,
            iodev_selector: args.iodev_selector,
            notifier: args.notifier,
            exit: false,
            current_slot: None,
        });
    });

    // Initialise already-registered interfaces and flip visibility in one
    // critical section against add_interface's write lock, so every
    // interface reaches this thread exactly once.
    mgr.attach_new_thread(&handle, &thread);
    mgr.reactor_started(&handle);

    REACTORS_STARTED.increment();
    REACTORS_ACTIVE.increment();
    info!(
        "reactor {idx} up ({} loop, {}), io thread {}",
        if handle.is_tight_loop_reactor() { "polled" } else { "epoll" },
        if handle.is_worker() { "worker" } else { "user" },
        thread.thread_idx
    );

    let result = if args.is_polled {
        crate::reactor_polled::drive(&mgr)
    } else {
        crate::reactor_epoll::drive(&mgr)
    };

    let state = CURRENT.with(|slot| slot.borrow_mut().take());
    if let Some(state) = state {
        // Error exits can leave threads attached; release their indices so
        // the pool invariant holds.
        for thread in state.handle.io_threads() {
            mgr.release_thread_idx(thread.thread_idx);
            state.handle.remove_thread(thread.addr.slot);
        }
        state.handle.set_stopped();
        if let Backend::Epoll(e) = state.backend {
            e.close();
        }
    }

    mgr.remove_reactor(idx);
    mgr.reactor_stopped();
    REACTORS_STOPPED.increment();
    REACTORS_ACTIVE.decrement();
    info!("reactor {idx} down");
    result
}
