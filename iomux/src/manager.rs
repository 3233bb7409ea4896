//! The process-wide I/O manager.
//!
//! Owns the reactor pool, the interface registries, the message-module
//! table, and the global timers, and sequences bring-up and tear-down
//! through a monotonic state machine. The messaging fabric lives here:
//! addressed unicast, predicate broadcast with least-busy deferral, and
//! synchronous fan-out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::alloc;
use crate::config::Config;
use crate::device::{DeviceHandle, DeviceScope, IoDevSelector, IoDevice};
use crate::error::Error;
use crate::interface::{
    AioDriveInterface, DriveInterface, GenericInterface, IoInterface, PolledDriveInterface,
};
use crate::metrics::{MSGS_BROADCAST, MSGS_DROPPED, MSGS_SENT};
use crate::msg::{Msg, MsgHandler, MsgModuleId, MsgPayload, MsgType, SyncMsg};
use crate::polled::{LoopbackRuntime, PolledRuntime};
use crate::reactor::{self, HandleKind, ReactorArgs, ReactorHandle};
use crate::thread::{
    IoThread, ReactorIdx, ThreadAddr, ThreadIdx, ThreadIdxPool, ThreadImpl, ThreadRegex,
    ThreadStateNotifier,
};
use crate::timer::{EpollTimer, PolledTimer, Timer, TimerCallback, TimerCookie, TimerHandle};

/// Lifecycle states, strictly increasing on success paths.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum MgrState {
    Uninitialized,
    InterfaceInit,
    ReactorInit,
    SysInit,
    Running,
    Stopping,
    Stopped,
}

/// Caller-supplied hook that registers interfaces during `start`, replacing
/// the default drive interface.
pub type InterfaceAdder = Box<dyn FnOnce(&Arc<IoManager>) + Send>;

struct WorkerSlot {
    join: Option<thread::JoinHandle<Result<(), Error>>>,
    handle: Option<Arc<ReactorHandle>>,
}

/// A manager-owned timer plus the device that wires its descriptor into
/// matching reactors (epoll variant only).
struct GlobalTimer {
    timer: Arc<dyn Timer>,
    iodev: Option<Arc<IoDevice>>,
}

/// The process-wide I/O manager facade.
pub struct IoManager {
    cfg: Config,
    state: Mutex<MgrState>,
    state_cv: Condvar,
    is_polled: AtomicBool,
    polled: Mutex<Option<Arc<dyn PolledRuntime>>>,

    next_reactor_idx: AtomicUsize,
    reactors: RwLock<Vec<Option<Arc<ReactorHandle>>>>,
    workers: Mutex<Vec<WorkerSlot>>,

    iface_list: RwLock<Vec<Arc<dyn IoInterface>>>,
    drive_ifaces: RwLock<Vec<Arc<dyn DriveInterface>>>,
    default_drive: Mutex<Option<Arc<dyn DriveInterface>>>,
    generic: Mutex<Option<Arc<GenericInterface>>>,

    msg_modules: Box<[OnceLock<MsgHandler>]>,
    msg_module_count: Mutex<usize>,
    internal_module: OnceLock<MsgModuleId>,

    idx_pool: ThreadIdxPool,
    yet_to_start: AtomicUsize,
    yet_to_stop: AtomicUsize,
    notifier: Mutex<Option<ThreadStateNotifier>>,

    worker_timer: Mutex<Option<GlobalTimer>>,
    user_timer: Mutex<Option<GlobalTimer>>,
}

impl IoManager {
    /// A manager with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    /// A manager with the given configuration. Invalid values surface from
    /// [`start`](Self::start).
    pub fn with_config(cfg: Config) -> Arc<Self> {
        let msg_modules = (0..cfg.max_msg_modules)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let idx_pool = ThreadIdxPool::new(cfg.max_io_threads);
        Arc::new(Self {
            cfg,
            state: Mutex::new(MgrState::Uninitialized),
            state_cv: Condvar::new(),
            is_polled: AtomicBool::new(false),
            polled: Mutex::new(None),
            next_reactor_idx: AtomicUsize::new(0),
            reactors: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            iface_list: RwLock::new(Vec::new()),
            drive_ifaces: RwLock::new(Vec::new()),
            default_drive: Mutex::new(None),
            generic: Mutex::new(None),
            msg_modules,
            msg_module_count: Mutex::new(0),
            internal_module: OnceLock::new(),
            idx_pool,
            yet_to_start: AtomicUsize::new(0),
            yet_to_stop: AtomicUsize::new(0),
            notifier: Mutex::new(None),
            worker_timer: Mutex::new(None),
            user_timer: Mutex::new(None),
        })
    }

    /// Static configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Wire in an external polled runtime before `start`. Without this,
    /// polled mode falls back to the in-process loopback runtime.
    pub fn set_polled_runtime(&self, rt: Arc<dyn PolledRuntime>) {
        *self.polled.lock().unwrap() = Some(rt);
    }

    pub(crate) fn polled_runtime(&self) -> Option<Arc<dyn PolledRuntime>> {
        self.polled.lock().unwrap().clone()
    }

    /// Whether polled mode was selected at start.
    pub fn is_polled(&self) -> bool {
        self.is_polled.load(Ordering::Acquire)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Bring the manager up: interfaces, `num_threads` worker reactors,
    /// global timers. Blocks until the state machine reaches `running`.
    /// A no-op when already running.
    pub fn start(
        self: &Arc<Self>,
        num_threads: usize,
        is_polled: bool,
        notifier: Option<ThreadStateNotifier>,
        iface_adder: Option<InterfaceAdder>,
    ) -> Result<(), Error> {
        if self.get_state() == MgrState::Running {
            warn!("io manager asked to start but already running, ignoring");
            return Ok(());
        }
        self.cfg.validate()?;

        info!("starting io manager with {num_threads} threads (polled: {is_polled})");
        self.is_polled.store(is_polled, Ordering::Release);
        self.yet_to_start.store(num_threads, Ordering::Release);
        *self.notifier.lock().unwrap() = notifier;

        // The internal module handles RunMethod, Reschedule and relinquish
        // for every reactor; register it before anything can broadcast.
        if self.internal_module.get().is_none() {
            let weak = Arc::downgrade(self);
            let id = self.register_msg_module(move |msg| {
                if let Some(mgr) = weak.upgrade() {
                    mgr.handle_internal_msg(msg);
                }
            })?;
            let _ = self.internal_module.set(id);
        }

        if is_polled {
            self.start_polled()?;
        }

        self.set_state(MgrState::InterfaceInit);
        let generic = GenericInterface::new();
        *self.generic.lock().unwrap() = Some(Arc::clone(&generic));
        self.add_interface(generic);
        match iface_adder {
            Some(adder) => adder(self),
            None => {
                if is_polled {
                    self.add_drive_interface(PolledDriveInterface::new(), true);
                } else {
                    self.add_drive_interface(AioDriveInterface::new(), true);
                }
            }
        }

        self.set_state(MgrState::ReactorInit);
        {
            let mut workers = self.workers.lock().unwrap();
            for i in 0..num_threads {
                let mgr = Arc::clone(self);
                let join = thread::Builder::new()
                    .name(format!("{}-{i}", self.cfg.thread_name_prefix))
                    .spawn(move || {
                        reactor::run_io_loop(ReactorArgs {
                            mgr: Arc::clone(&mgr),
                            is_worker: true,
                            worker_slot: Some(i),
                            is_polled,
                            iodev_selector: None,
                            notifier: None,
                        })
                    })
                    .map_err(Error::Io)?;
                workers.push(WorkerSlot {
                    join: Some(join),
                    handle: None,
                });
            }
        }
        if num_threads == 0 {
            self.set_state(MgrState::SysInit);
        }
        self.wait_for_state(MgrState::SysInit);

        self.create_global_timers(is_polled)?;

        if is_polled {
            let weak = Arc::downgrade(self);
            let sent = self.run_on(
                ThreadRegex::LeastBusyWorker,
                move |_addr| {
                    let Some(mgr) = weak.upgrade() else { return };
                    let Some(rt) = mgr.polled_runtime() else { return };
                    info!("initialising block-device subsystem");
                    let done = Arc::downgrade(&mgr);
                    rt.init_block_subsystem(Box::new(move || {
                        if let Some(mgr) = done.upgrade() {
                            mgr.set_state(MgrState::Running);
                        }
                    }));
                },
                false,
            );
            if sent == 0 {
                self.set_state(MgrState::Running);
            }
            self.wait_for_state(MgrState::Running);
        } else {
            self.set_state(MgrState::Running);
        }

        // Reactors are free to announce their threads now.
        self.run_on(
            ThreadRegex::AllIo,
            |_addr| reactor::notify_thread_state(true),
            false,
        );
        Ok(())
    }

    fn start_polled(&self) -> Result<(), Error> {
        let rt = {
            let mut slot = self.polled.lock().unwrap();
            if slot.is_none() {
                *slot = Some(Arc::new(LoopbackRuntime));
            }
            match slot.as_ref() {
                Some(rt) => Arc::clone(rt),
                None => unreachable!(),
            }
        };
        rt.init()?;
        // Swap the aligned allocator before any worker allocates.
        if let Some(allocator) = rt.aligned_allocator() {
            alloc::set_allocator(allocator);
        }
        Ok(())
    }

    /// Tear everything down: global timers, every I/O thread, worker
    /// joins, interface lists. The state machine always reaches `stopped`,
    /// even when a reactor loop panicked.
    pub fn stop(self: &Arc<Self>) {
        info!("stopping io manager");
        self.set_state(MgrState::Stopping);

        // Hold one artificial reactor reference while the broadcast is in
        // flight, closing the race when no I/O threads ever started.
        self.yet_to_stop.fetch_add(1, Ordering::AcqRel);

        self.destroy_global_timers();

        self.multicast_msg(
            ThreadRegex::AllIo,
            Msg::new(MsgType::RelinquishIoThread, self.internal_msg_module()),
        );

        if self.yet_to_stop.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(MgrState::Stopped);
        } else {
            self.wait_for_state(MgrState::Stopped);
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for (i, ws) in workers.iter_mut().enumerate() {
            if let Some(join) = ws.join.take() {
                match join.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("worker reactor {i} exited with error: {e}"),
                    Err(_) => error!("worker reactor {i} panicked during io loop"),
                }
            }
        }

        self.drive_ifaces.write().unwrap().clear();
        self.iface_list.write().unwrap().clear();
        *self.default_drive.lock().unwrap() = None;
        *self.generic.lock().unwrap() = None;
        self.yet_to_start.store(0, Ordering::Release);

        debug_assert_eq!(self.get_state(), MgrState::Stopped);
        info!("io manager stopped, all io threads relinquished");
    }

    /// Current lifecycle state.
    pub fn get_state(&self) -> MgrState {
        *self.state.lock().unwrap()
    }

    /// Block until the manager reaches `target` or a later state.
    pub fn wait_for_state(&self, target: MgrState) {
        let mut state = self.state.lock().unwrap();
        while *state < target {
            state = self.state_cv.wait(state).unwrap();
        }
    }

    pub(crate) fn set_state(&self, next: MgrState) {
        let mut state = self.state.lock().unwrap();
        if next > *state {
            debug!("io manager state {:?} -> {next:?}", *state);
            *state = next;
            self.state_cv.notify_all();
        }
    }

    // ── Reactor plumbing ─────────────────────────────────────────

    pub(crate) fn alloc_reactor_idx(&self) -> ReactorIdx {
        self.next_reactor_idx.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn install_reactor(&self, handle: Arc<ReactorHandle>) {
        let mut table = self.reactors.write().unwrap();
        let idx = handle.idx();
        if table.len() <= idx {
            table.resize_with(idx + 1, || None);
        }
        table[idx] = Some(handle);
    }

    pub(crate) fn remove_reactor(&self, idx: ReactorIdx) {
        let mut table = self.reactors.write().unwrap();
        if let Some(entry) = table.get_mut(idx) {
            *entry = None;
        }
    }

    /// Create a logical I/O thread on `handle`, reserving its dense index.
    pub(crate) fn make_io_thread(&self, handle: &Arc<ReactorHandle>) -> Result<Arc<IoThread>, Error> {
        let thread_idx = self.idx_pool.reserve()?;
        let slot = handle.next_free_slot();
        let imp = match &handle.kind {
            HandleKind::Polled { thread } => ThreadImpl::Polled(thread.clone()),
            HandleKind::Epoll { .. } => ThreadImpl::Reactor(handle.idx()),
        };
        let thread = Arc::new(IoThread::new(
            ThreadAddr {
                reactor: handle.idx(),
                slot,
            },
            thread_idx,
            imp,
            handle.is_worker(),
        ));
        handle.install_thread(Arc::clone(&thread));
        Ok(thread)
    }

    pub(crate) fn release_thread_idx(&self, idx: ThreadIdx) {
        self.idx_pool.release(idx);
    }

    /// Initialise registered interfaces on a newly hosted thread and flip
    /// the reactor visible, atomically against `add_interface`'s write
    /// lock so every interface reaches the thread exactly once.
    pub(crate) fn attach_new_thread(&self, handle: &Arc<ReactorHandle>, thread: &Arc<IoThread>) {
        let ifaces = self.iface_list.read().unwrap();
        for iface in ifaces.iter() {
            iface.on_io_thread_start(thread);
        }
        handle.set_running();
    }

    pub(crate) fn reactor_started(&self, handle: &Arc<ReactorHandle>) {
        self.yet_to_stop.fetch_add(1, Ordering::AcqRel);
        if handle.is_worker() {
            if let Some(slot) = handle.worker_slot {
                let mut workers = self.workers.lock().unwrap();
                if let Some(ws) = workers.get_mut(slot) {
                    ws.handle = Some(Arc::clone(handle));
                }
            }
            if self.yet_to_start.fetch_sub(1, Ordering::AcqRel) == 1 {
                info!("all worker reactors started, moving io manager to sys_init");
                self.set_state(MgrState::SysInit);
            }
        }
    }

    /// A reactor thread aborted before hosting any I/O thread; keep the
    /// bring-up counter moving so `start` does not wait forever.
    pub(crate) fn reactor_setup_failed(&self, is_worker: bool) {
        if is_worker && self.yet_to_start.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(MgrState::SysInit);
        }
    }

    pub(crate) fn reactor_stopped(&self) {
        if self.yet_to_stop.fetch_sub(1, Ordering::AcqRel) == 1
            && self.get_state() >= MgrState::Stopping
        {
            self.set_state(MgrState::Stopped);
        }
    }

    pub(crate) fn thread_state_notifier(&self) -> Option<ThreadStateNotifier> {
        self.notifier.lock().unwrap().clone()
    }

    /// Attach the calling externally-created thread as a user reactor,
    /// optionally filtering which devices it accepts. Blocks until
    /// `stop()` relinquishes it.
    pub fn run_user_loop(
        self: &Arc<Self>,
        iodev_selector: Option<IoDevSelector>,
        notifier: Option<ThreadStateNotifier>,
    ) -> Result<(), Error> {
        reactor::run_io_loop(ReactorArgs {
            mgr: Arc::clone(self),
            is_worker: false,
            worker_slot: None,
            is_polled: self.is_polled(),
            iodev_selector,
            notifier,
        })
    }

    // ── Interfaces ───────────────────────────────────────────────

    /// Register an interface. Every live I/O thread runs
    /// `on_io_thread_start` for it, synchronously, before the interface is
    /// published in the list; no reactor observes it uninitialised.
    pub fn add_interface(self: &Arc<Self>, iface: Arc<dyn IoInterface>) {
        let mut list = self.iface_list.write().unwrap();
        let setup = Arc::clone(&iface);
        self.run_on(
            ThreadRegex::AllIo,
            move |_addr| {
                if let Some(thread) = reactor::iothread_self() {
                    setup.on_io_thread_start(&thread);
                }
            },
            true,
        );
        info!("io interface {} registered", iface.name());
        list.push(iface);
    }

    /// Register a drive interface, optionally making it the default drive.
    pub fn add_drive_interface(self: &Arc<Self>, iface: Arc<dyn DriveInterface>, is_default: bool) {
        let as_io: Arc<dyn IoInterface> = iface.clone();
        self.add_interface(as_io);
        self.drive_ifaces.write().unwrap().push(Arc::clone(&iface));
        if is_default {
            *self.default_drive.lock().unwrap() = Some(iface);
        }
    }

    /// Visit every registered interface under the list's read lock.
    pub fn foreach_interface(&self, mut cb: impl FnMut(&Arc<dyn IoInterface>)) {
        let list = self.iface_list.read().unwrap();
        for iface in list.iter() {
            cb(iface);
        }
    }

    /// The default drive interface, when one was registered.
    pub fn default_drive_interface(&self) -> Option<Arc<dyn DriveInterface>> {
        self.default_drive.lock().unwrap().clone()
    }

    /// The built-in generic interface, live between `start` and `stop`.
    pub fn generic_interface(&self) -> Option<Arc<GenericInterface>> {
        self.generic.lock().unwrap().clone()
    }

    // ── Message modules ──────────────────────────────────────────

    /// Register a message-module handler. Modules are never unregistered,
    /// which keeps lookups lock-free.
    pub fn register_msg_module(
        &self,
        handler: impl Fn(&Msg) + Send + Sync + 'static,
    ) -> Result<MsgModuleId, Error> {
        let mut count = self.msg_module_count.lock().unwrap();
        if *count >= self.msg_modules.len() {
            return Err(Error::MsgModulesExhausted);
        }
        let id = *count as MsgModuleId;
        let _ = self.msg_modules[*count].set(Arc::new(handler));
        *count += 1;
        Ok(id)
    }

    pub(crate) fn get_msg_module(&self, id: MsgModuleId) -> Option<MsgHandler> {
        self.msg_modules
            .get(id as usize)
            .and_then(|slot| slot.get().cloned())
    }

    pub(crate) fn internal_msg_module(&self) -> MsgModuleId {
        self.internal_module.get().copied().unwrap_or(0)
    }

    fn handle_internal_msg(self: &Arc<Self>, msg: &Msg) {
        match msg.msg_type() {
            MsgType::RunMethod => {
                if let (MsgPayload::RunMethod(f), Some(addr)) = (msg.payload(), msg.dest()) {
                    f(addr);
                }
                msg.ack();
            }
            MsgType::RelinquishIoThread => {
                reactor::relinquish_current_thread();
                msg.ack();
            }
            MsgType::Reschedule => {
                if let MsgPayload::Reschedule { device, events } = msg.payload() {
                    if let Some(iface) = device.interface() {
                        iface.handle_event(device, *events);
                    }
                }
                msg.ack();
            }
            MsgType::User(code) => {
                warn!("user message code {code} addressed to the internal module");
            }
        }
    }

    // ── Messaging fabric ─────────────────────────────────────────

    /// Addressed unicast. Polled destinations short-circuit into the
    /// polled runtime without touching the reactor table. On failure the
    /// message is released; false is returned.
    pub fn send_msg(self: &Arc<Self>, thread: &Arc<IoThread>, msg: Msg) -> bool {
        let ok = match &thread.imp {
            ThreadImpl::Polled(handle) => {
                let msg = msg.with_dest(thread.addr);
                let mgr = Arc::clone(self);
                handle.send(Box::new(move || reactor::dispatch_msg(&mgr, &msg)))
            }
            ThreadImpl::Reactor(ridx) => {
                let reactor = self
                    .reactors
                    .read()
                    .unwrap()
                    .get(*ridx)
                    .and_then(|r| r.clone());
                match reactor {
                    Some(r) => r.deliver_msg(thread.addr, msg, self),
                    None => false,
                }
            }
        };
        if ok {
            MSGS_SENT.increment();
        } else {
            MSGS_DROPPED.increment();
        }
        ok
    }

    /// Unicast plus a blocking wait for the handler's acknowledgement.
    pub fn send_msg_and_wait(self: &Arc<Self>, thread: &Arc<IoThread>, smsg: &SyncMsg) -> bool {
        let sent = self.send_msg(thread, smsg.msg());
        if sent {
            smsg.wait(1);
        }
        sent
    }

    /// Deliver one message to every thread matching `regex`; returns the
    /// number of successful submissions.
    ///
    /// `least_busy_*` scans all matching threads first and delivers the
    /// original message (no clone) to the minimum; ties go to the first
    /// thread in reactor-index order. `random_worker` delivers once to a
    /// uniformly-chosen worker. Everything else clones per recipient; the
    /// original reference drops when the scan ends.
    pub fn multicast_msg(self: &Arc<Self>, regex: ThreadRegex, msg: Msg) -> usize {
        MSGS_BROADCAST.increment();
        let mut sent = 0usize;

        if regex == ThreadRegex::RandomWorker {
            let workers = self.worker_handles();
            if workers.is_empty() {
                MSGS_DROPPED.increment();
                return 0;
            }
            let pick = rand::random::<u32>() as usize % workers.len();
            let reactor = &workers[pick];
            if let Some(thread) = reactor.select_thread() {
                if reactor.deliver_msg(thread.addr, msg, self) {
                    sent = 1;
                    MSGS_SENT.increment();
                } else {
                    MSGS_DROPPED.increment();
                }
            }
            return sent;
        }

        let reactors = if matches!(regex, ThreadRegex::AllWorker | ThreadRegex::LeastBusyWorker) {
            self.worker_handles()
        } else {
            self.all_handles()
        };

        let mut min: Option<(i64, ThreadAddr, Arc<ReactorHandle>)> = None;
        for reactor in &reactors {
            if !reactor.is_io_reactor() {
                continue;
            }
            for thread in reactor.io_threads() {
                if !regex.matches(thread.is_worker()) {
                    continue;
                }
                if regex.is_least_busy() {
                    let ops = thread.outstanding_ops();
                    // Strict less-than: on ties the first thread in
                    // reactor-index order wins.
                    if min.as_ref().is_none_or(|(best, _, _)| ops < *best) {
                        min = Some((ops, thread.addr, Arc::clone(reactor)));
                    }
                } else {
                    if reactor.deliver_msg(thread.addr, msg.clone(), self) {
                        sent += 1;
                        MSGS_SENT.increment();
                    } else {
                        MSGS_DROPPED.increment();
                    }
                }
            }
        }

        // After the last reactor has been visited: the least-busy winner
        // gets the original message, not a clone.
        if let Some((_, addr, target)) = min {
            if target.deliver_msg(addr, msg, self) {
                sent += 1;
                MSGS_SENT.increment();
            } else {
                MSGS_DROPPED.increment();
            }
        }
        // Otherwise the original drops here, releasing the broadcast
        // reference; zero fan-out is a valid outcome.
        sent
    }

    /// Broadcast plus a blocking wait for every recipient's ack.
    pub fn multicast_msg_and_wait(self: &Arc<Self>, regex: ThreadRegex, smsg: &SyncMsg) -> usize {
        let sent = self.multicast_msg(regex, smsg.msg());
        if sent != 0 {
            smsg.wait(sent);
        }
        sent
    }

    /// Run a closure on every thread matching `regex`, optionally waiting
    /// for all executions to finish. Returns the fan-out count.
    pub fn run_on(
        self: &Arc<Self>,
        regex: ThreadRegex,
        f: impl Fn(ThreadAddr) + Send + Sync + 'static,
        wait: bool,
    ) -> usize {
        let module = self.internal_msg_module();
        if wait {
            let smsg = SyncMsg::run_method(module, f);
            self.multicast_msg_and_wait(regex, &smsg)
        } else {
            self.multicast_msg(regex, Msg::run_method(module, f))
        }
    }

    /// Run a closure on one specific thread. Returns false when it could
    /// not be delivered.
    pub fn run_on_thread(
        self: &Arc<Self>,
        thread: &Arc<IoThread>,
        f: impl Fn(ThreadAddr) + Send + Sync + 'static,
    ) -> bool {
        self.send_msg(thread, Msg::run_method(self.internal_msg_module(), f))
    }

    /// Forward a device readiness event to the least-busy worker.
    pub fn device_reschedule(self: &Arc<Self>, device: &Arc<IoDevice>, events: u32) {
        self.multicast_msg(
            ThreadRegex::LeastBusyWorker,
            Msg::reschedule(self.internal_msg_module(), Arc::clone(device), events),
        );
    }

    /// Worker reactor handles in reactor-index order, the order broadcast
    /// scans visit them in.
    fn worker_handles(&self) -> Vec<Arc<ReactorHandle>> {
        let mut handles: Vec<Arc<ReactorHandle>> = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter_map(|ws| ws.handle.clone())
            .collect();
        handles.sort_by_key(|h| h.idx());
        handles
    }

    fn all_handles(&self) -> Vec<Arc<ReactorHandle>> {
        self.reactors
            .read()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    // ── Thread lookups ───────────────────────────────────────────

    /// The logical I/O thread of the calling reactor thread, if any.
    pub fn iothread_self(&self) -> Option<Arc<IoThread>> {
        reactor::iothread_self()
    }

    /// Resolve an address to its live thread.
    pub fn addr_to_thread(&self, addr: ThreadAddr) -> Option<Arc<IoThread>> {
        self.reactors
            .read()
            .unwrap()
            .get(addr.reactor)
            .and_then(|r| r.clone())
            .and_then(|r| r.addr_to_thread(addr))
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Schedule a timer on the calling reactor's per-thread timer.
    /// Returns the null handle when called off a reactor thread.
    pub fn schedule_thread_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        cb: TimerCallback,
    ) -> TimerHandle {
        match reactor::current_thread_timer() {
            Some(timer) => timer.schedule(after, recurring, cookie, cb),
            None => {
                debug_assert!(false, "thread timer scheduled off a reactor thread");
                TimerHandle::NULL
            }
        }
    }

    /// Cancel a per-thread timer of the calling reactor.
    pub fn cancel_thread_timer(&self, handle: TimerHandle) {
        if let Some(timer) = reactor::current_thread_timer() {
            timer.cancel(handle);
        }
    }

    /// Schedule on the global timer scoped to a thread class. Only
    /// `AllWorker` and `AllUser` are valid scopes; anything else asserts
    /// in debug and returns the null handle.
    pub fn schedule_global_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: Option<TimerCookie>,
        scope: ThreadRegex,
        cb: TimerCallback,
    ) -> TimerHandle {
        let Some(slot) = self.global_timer_slot(scope) else {
            debug_assert!(false, "invalid global timer scope {scope:?}");
            error!("invalid global timer scope {scope:?}");
            return TimerHandle::NULL;
        };
        match slot.lock().unwrap().as_ref() {
            Some(gt) => gt.timer.schedule(after, recurring, cookie, cb),
            None => TimerHandle::NULL,
        }
    }

    /// Cancel a global timer scheduled with the given scope.
    pub fn cancel_global_timer(&self, scope: ThreadRegex, handle: TimerHandle) {
        if let Some(slot) = self.global_timer_slot(scope) {
            if let Some(gt) = slot.lock().unwrap().as_ref() {
                gt.timer.cancel(handle);
            }
        }
    }

    fn global_timer_slot(&self, scope: ThreadRegex) -> Option<&Mutex<Option<GlobalTimer>>> {
        match scope {
            ThreadRegex::AllWorker => Some(&self.worker_timer),
            ThreadRegex::AllUser => Some(&self.user_timer),
            _ => None,
        }
    }

    fn create_global_timers(self: &Arc<Self>, is_polled: bool) -> Result<(), Error> {
        let user = self.make_global_timer(ThreadRegex::AllUser, false)?;
        *self.user_timer.lock().unwrap() = Some(user);
        let worker = self.make_global_timer(ThreadRegex::AllWorker, is_polled)?;
        *self.worker_timer.lock().unwrap() = Some(worker);
        Ok(())
    }

    fn make_global_timer(self: &Arc<Self>, scope: ThreadRegex, polled: bool) -> Result<GlobalTimer, Error> {
        if polled {
            let thread = self
                .worker_handles()
                .iter()
                .find_map(|h| match &h.kind {
                    HandleKind::Polled { thread } => Some(thread.clone()),
                    HandleKind::Epoll { .. } => None,
                })
                .ok_or_else(|| Error::PolledInit("no polled worker for global timer".into()))?;
            Ok(GlobalTimer {
                timer: PolledTimer::new(thread),
                iodev: None,
            })
        } else {
            let timer = EpollTimer::new()?;
            let Some(generic) = self.generic_interface() else {
                return Err(Error::NotRunning);
            };
            let fire = Arc::clone(&timer);
            let as_io: Arc<dyn IoInterface> = Arc::clone(&generic) as Arc<dyn IoInterface>;
            let dev = IoDevice::new(
                DeviceHandle::Fd(timer.fd()),
                libc::EPOLLIN as u32,
                DeviceScope::Global,
                &as_io,
                Some(Arc::new(move |_dev, _events| fire.fire_due())),
                None,
            );
            generic.add_device_on(Arc::clone(&dev), self, scope);
            Ok(GlobalTimer {
                timer,
                iodev: Some(dev),
            })
        }
    }

    fn destroy_global_timers(self: &Arc<Self>) {
        for slot in [&self.user_timer, &self.worker_timer] {
            let taken = slot.lock().unwrap().take();
            if let Some(gt) = taken {
                if let (Some(dev), Some(generic)) = (&gt.iodev, self.generic_interface()) {
                    generic.remove_device(dev, self);
                }
            }
        }
    }

    // ── Aligned I/O buffers ──────────────────────────────────────

    /// Allocate an aligned I/O buffer; the size is rounded up to the
    /// alignment. Routed through the process-wide allocator, which polled
    /// mode may have swapped.
    pub fn iobuf_alloc(&self, align: usize, size: usize) -> *mut u8 {
        let align = align.max(1);
        let size = size.div_ceil(align) * align;
        alloc::allocator().alloc(align, size)
    }

    /// Release a buffer from [`iobuf_alloc`](Self::iobuf_alloc).
    pub fn iobuf_free(&self, buf: *mut u8) {
        alloc::allocator().free(buf);
    }

    /// Resize a buffer, preserving contents.
    pub fn iobuf_realloc(&self, buf: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        alloc::allocator().realloc(buf, align, new_size)
    }
}
