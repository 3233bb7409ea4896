//! Registered I/O devices.
//!
//! A device is a variant handle (raw descriptor, block device, or queue
//! pair) owned by exactly one interface, with either global scope (attached
//! to every reactor) or a pin to one logical I/O thread. Per-thread device
//! context lives in an arena indexed by the owning thread's dense index.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::interface::IoInterface;
use crate::thread::{ThreadAddr, ThreadIdx};

/// Variant device handle.
#[derive(Clone, Debug)]
pub enum DeviceHandle {
    /// Kernel file descriptor, registered with epoll reactors.
    Fd(RawFd),
    /// User-space block device.
    Bdev(BdevHandle),
    /// NVMe-fabric queue pair.
    QPair(QPairHandle),
}

/// Opaque block-device descriptor from the polled back-end.
#[derive(Clone, Debug)]
pub struct BdevHandle {
    /// Back-end name of the device.
    pub name: String,
}

/// Opaque queue-pair descriptor from the polled back-end.
#[derive(Clone, Copy, Debug)]
pub struct QPairHandle {
    /// Back-end identifier of the queue pair.
    pub id: u64,
}

/// Where a device is attached.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceScope {
    /// Registered with every live reactor.
    Global,
    /// Pinned to a single logical I/O thread.
    Thread(ThreadAddr),
}

/// Per-device readiness callback, invoked by the owning interface.
pub type DeviceCallback = Arc<dyn Fn(&Arc<IoDevice>, u32) + Send + Sync>;

/// Per-reactor device filter: a reactor with a selector attaches only the
/// devices the selector accepts.
pub type IoDevSelector = Arc<dyn Fn(&Arc<IoDevice>) -> bool + Send + Sync>;

/// A registered I/O device.
pub struct IoDevice {
    /// The underlying variant handle.
    pub dev: DeviceHandle,
    /// Readiness interest mask (`EPOLLIN` and friends) for fd devices.
    pub events: u32,
    scope: DeviceScope,
    interface: Weak<dyn IoInterface>,
    callback: Option<DeviceCallback>,
    /// Opaque client cookie carried alongside the device.
    pub cookie: Option<Box<dyn Any + Send + Sync>>,
    thread_ctx: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

impl IoDevice {
    /// Create a device owned by `interface`.
    pub fn new(
        dev: DeviceHandle,
        events: u32,
        scope: DeviceScope,
        interface: &Arc<dyn IoInterface>,
        callback: Option<DeviceCallback>,
        cookie: Option<Box<dyn Any + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dev,
            events,
            scope,
            interface: Arc::downgrade(interface),
            callback,
            cookie,
            thread_ctx: Mutex::new(Vec::new()),
        })
    }

    /// Raw descriptor, if this is an fd device.
    pub fn fd(&self) -> Option<RawFd> {
        match self.dev {
            DeviceHandle::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    /// Printable identity of the variant handle.
    pub fn dev_id(&self) -> String {
        match &self.dev {
            DeviceHandle::Fd(fd) => fd.to_string(),
            DeviceHandle::Bdev(b) => b.name.clone(),
            DeviceHandle::QPair(q) => format!("qpair-{}", q.id),
        }
    }

    /// Whether the device is attached to every reactor.
    pub fn is_global(&self) -> bool {
        matches!(self.scope, DeviceScope::Global)
    }

    /// Attachment scope.
    pub fn scope(&self) -> DeviceScope {
        self.scope
    }

    /// Owning interface, unless it has been dropped.
    pub fn interface(&self) -> Option<Arc<dyn IoInterface>> {
        self.interface.upgrade()
    }

    pub(crate) fn callback(&self) -> Option<&DeviceCallback> {
        self.callback.as_ref()
    }

    /// Install per-thread context for the thread with dense index `idx`.
    pub fn set_thread_ctx(&self, idx: ThreadIdx, ctx: Box<dyn Any + Send>) {
        let mut slots = self.thread_ctx.lock().unwrap();
        let idx = idx as usize;
        if slots.len() <= idx {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(ctx);
    }

    /// Remove and return the per-thread context for `idx`.
    pub fn take_thread_ctx(&self, idx: ThreadIdx) -> Option<Box<dyn Any + Send>> {
        let mut slots = self.thread_ctx.lock().unwrap();
        slots.get_mut(idx as usize).and_then(|s| s.take())
    }

    /// Whether per-thread context exists for `idx`.
    pub fn has_thread_ctx(&self, idx: ThreadIdx) -> bool {
        let slots = self.thread_ctx.lock().unwrap();
        matches!(slots.get(idx as usize), Some(Some(_)))
    }
}

impl std::fmt::Debug for IoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDevice")
            .field("dev", &self.dev)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::GenericInterface;

    fn test_iface() -> Arc<dyn IoInterface> {
        GenericInterface::new()
    }

    #[test]
    fn dev_id_variants() {
        let iface = test_iface();
        let fd_dev = IoDevice::new(DeviceHandle::Fd(7), 0, DeviceScope::Global, &iface, None, None);
        assert_eq!(fd_dev.dev_id(), "7");

        let bdev = IoDevice::new(
            DeviceHandle::Bdev(BdevHandle { name: "nvme0n1".into() }),
            0,
            DeviceScope::Global,
            &iface,
            None,
            None,
        );
        assert_eq!(bdev.dev_id(), "nvme0n1");

        let qp = IoDevice::new(
            DeviceHandle::QPair(QPairHandle { id: 4 }),
            0,
            DeviceScope::Global,
            &iface,
            None,
            None,
        );
        assert_eq!(qp.dev_id(), "qpair-4");
    }

    #[test]
    fn thread_ctx_roundtrip() {
        let iface = test_iface();
        let dev = IoDevice::new(DeviceHandle::Fd(1), 0, DeviceScope::Global, &iface, None, None);
        assert!(!dev.has_thread_ctx(3));
        dev.set_thread_ctx(3, Box::new(42u64));
        assert!(dev.has_thread_ctx(3));
        let ctx = dev.take_thread_ctx(3).unwrap();
        assert_eq!(*ctx.downcast::<u64>().unwrap(), 42);
        assert!(!dev.has_thread_ctx(3));
    }
}
