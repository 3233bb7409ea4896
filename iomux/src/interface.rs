//! I/O interfaces: families of devices sharing a back-end.
//!
//! An interface is notified when a logical I/O thread starts or stops so it
//! can attach or detach per-thread state, and receives readiness events for
//! its devices. The registration protocol in
//! [`IoManager::add_interface`](crate::IoManager::add_interface) guarantees
//! no reactor observes an interface before the interface has been
//! initialised on every thread that reactor hosts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::device::{DeviceScope, IoDevice};
use crate::manager::IoManager;
use crate::msg::Msg;
use crate::reactor;
use crate::thread::{IoThread, ThreadIdx, ThreadRegex};

/// Capability set of an I/O interface.
pub trait IoInterface: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Called on a reactor thread when a logical I/O thread it hosts comes
    /// up. Per-thread device state is attached here.
    fn on_io_thread_start(&self, thread: &Arc<IoThread>);

    /// Called on a reactor thread when a hosted logical I/O thread
    /// relinquishes.
    fn on_io_thread_stop(&self, thread: &Arc<IoThread>);

    /// Readiness event for one of this interface's devices, delivered on
    /// the reactor that observed it.
    fn handle_event(&self, device: &Arc<IoDevice>, events: u32);
}

/// Marker contract for drive back-ends layered over [`IoInterface`].
pub trait DriveInterface: IoInterface {}

/// Catch-all interface for descriptor devices without a drive back-end.
///
/// Fd devices registered here are added to the epoll set of every matching
/// reactor; their readiness events route to the per-device callback.
pub struct GenericInterface {
    /// Registered devices with the thread-class their attachment targets;
    /// late-starting threads consult the class on attach.
    devices: Mutex<Vec<(Arc<IoDevice>, ThreadRegex)>>,
}

impl GenericInterface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Register a device and attach it to the reactors its scope selects.
    /// Blocks until every selected reactor has attached it.
    pub fn add_device(&self, dev: Arc<IoDevice>, mgr: &Arc<IoManager>) -> usize {
        self.add_device_on(dev, mgr, ThreadRegex::AllIo)
    }

    /// Register a device on the reactors hosting threads of one class.
    /// Used for class-scoped global devices such as timer descriptors.
    pub fn add_device_on(&self, dev: Arc<IoDevice>, mgr: &Arc<IoManager>, scope: ThreadRegex) -> usize {
        self.devices.lock().unwrap().push((Arc::clone(&dev), scope));
        self.fanout_attach(&dev, mgr, scope)
    }

    /// Deregister a device, detaching it from every reactor it was
    /// attached to. Blocks until detach completes.
    pub fn remove_device(&self, dev: &Arc<IoDevice>, mgr: &Arc<IoManager>) {
        self.devices
            .lock()
            .unwrap()
            .retain(|(d, _)| !Arc::ptr_eq(d, dev));
        let target = Arc::clone(dev);
        match dev.scope() {
            DeviceScope::Global => {
                mgr.run_on(
                    ThreadRegex::AllIo,
                    move |_addr| {
                        reactor::detach_device_local(&target);
                    },
                    true,
                );
            }
            DeviceScope::Thread(addr) => {
                if let Some(thread) = mgr.addr_to_thread(addr) {
                    let msg = Msg::run_method(mgr.internal_msg_module(), move |_| {
                        reactor::detach_device_local(&target);
                    });
                    mgr.send_msg(&thread, msg);
                }
            }
        }
    }

    fn fanout_attach(&self, dev: &Arc<IoDevice>, mgr: &Arc<IoManager>, scope: ThreadRegex) -> usize {
        match dev.scope() {
            DeviceScope::Global => {
                let target = Arc::clone(dev);
                mgr.run_on(
                    scope,
                    move |_addr| {
                        reactor::attach_device_local(&target);
                        if let Some(thread) = reactor::iothread_self() {
                            target.set_thread_ctx(thread.thread_idx, Box::new(()));
                        }
                    },
                    true,
                )
            }
            DeviceScope::Thread(addr) => {
                let Some(thread) = mgr.addr_to_thread(addr) else {
                    return 0;
                };
                let target = Arc::clone(dev);
                let msg = Msg::run_method(mgr.internal_msg_module(), move |_| {
                    reactor::attach_device_local(&target);
                    if let Some(thread) = reactor::iothread_self() {
                        target.set_thread_ctx(thread.thread_idx, Box::new(()));
                    }
                });
                mgr.send_msg(&thread, msg) as usize
            }
        }
    }
}

impl IoInterface for GenericInterface {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn on_io_thread_start(&self, thread: &Arc<IoThread>) {
        // A thread coming up after registration attaches every global
        // device of its class itself, keeping the per-thread population
        // invariant.
        let devices = self.devices.lock().unwrap().clone();
        for (dev, scope) in devices {
            if dev.is_global() && scope.matches(thread.is_worker()) {
                reactor::attach_device_local(&dev);
                dev.set_thread_ctx(thread.thread_idx, Box::new(()));
            }
        }
    }

    fn on_io_thread_stop(&self, thread: &Arc<IoThread>) {
        let devices = self.devices.lock().unwrap().clone();
        for (dev, scope) in devices {
            if dev.is_global() && scope.matches(thread.is_worker()) {
                reactor::detach_device_local(&dev);
                dev.take_thread_ctx(thread.thread_idx);
            }
        }
    }

    fn handle_event(&self, device: &Arc<IoDevice>, events: u32) {
        match device.callback() {
            Some(cb) => cb(device, events),
            None => trace!("generic device {} event {events:#x} unhandled", device.dev_id()),
        }
    }
}

/// Per-thread bookkeeping shared by the in-tree drive interfaces. Real
/// submission paths live in external back-ends.
struct DriveThreadState {
    attached: Mutex<HashSet<ThreadIdx>>,
}

impl DriveThreadState {
    fn new() -> Self {
        Self {
            attached: Mutex::new(HashSet::new()),
        }
    }

    fn attach(&self, idx: ThreadIdx) {
        self.attached.lock().unwrap().insert(idx);
    }

    fn detach(&self, idx: ThreadIdx) {
        self.attached.lock().unwrap().remove(&idx);
    }

    fn count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

/// Drive interface backed by kernel asynchronous I/O.
pub struct AioDriveInterface {
    state: DriveThreadState,
}

impl AioDriveInterface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: DriveThreadState::new(),
        })
    }

    /// Number of I/O threads currently attached.
    pub fn attached_threads(&self) -> usize {
        self.state.count()
    }
}

impl IoInterface for AioDriveInterface {
    fn name(&self) -> &'static str {
        "aio-drive"
    }

    fn on_io_thread_start(&self, thread: &Arc<IoThread>) {
        debug!("aio-drive attaching to io thread {}", thread.thread_idx);
        self.state.attach(thread.thread_idx);
    }

    fn on_io_thread_stop(&self, thread: &Arc<IoThread>) {
        self.state.detach(thread.thread_idx);
    }

    fn handle_event(&self, device: &Arc<IoDevice>, events: u32) {
        trace!("aio-drive event {events:#x} on {}", device.dev_id());
    }
}

impl DriveInterface for AioDriveInterface {}

/// Drive interface backed by the polled user-space NVMe runtime.
pub struct PolledDriveInterface {
    state: DriveThreadState,
}

impl PolledDriveInterface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: DriveThreadState::new(),
        })
    }

    /// Number of I/O threads currently attached.
    pub fn attached_threads(&self) -> usize {
        self.state.count()
    }
}

impl IoInterface for PolledDriveInterface {
    fn name(&self) -> &'static str {
        "polled-drive"
    }

    fn on_io_thread_start(&self, thread: &Arc<IoThread>) {
        debug!("polled-drive attaching to io thread {}", thread.thread_idx);
        self.state.attach(thread.thread_idx);
    }

    fn on_io_thread_stop(&self, thread: &Arc<IoThread>) {
        self.state.detach(thread.thread_idx);
    }

    fn handle_event(&self, device: &Arc<IoDevice>, events: u32) {
        trace!("polled-drive event {events:#x} on {}", device.dev_id());
    }
}

impl DriveInterface for PolledDriveInterface {}
