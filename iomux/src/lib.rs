//! iomux — reactor-pool I/O manager for Linux.
//!
//! iomux multiplexes asynchronous device I/O across a pool of reactor
//! threads. Two reactor models coexist: epoll-driven reactors blocking on
//! kernel readiness notification, and tight-loop polled reactors hosting a
//! user-space storage runtime. The manager owns reactor lifecycle, device
//! and interface registration, per-thread and global timers, and a typed
//! inter-thread messaging fabric with predicate broadcast and synchronous
//! fan-out.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use iomux::{IoManager, Msg, ThreadRegex};
//!
//! fn main() -> Result<(), iomux::Error> {
//!     let mgr = IoManager::new();
//!     mgr.start(4, false, None, None)?;
//!
//!     // Run a closure on every worker and wait for completion.
//!     let hits = Arc::new(AtomicUsize::new(0));
//!     let counter = hits.clone();
//!     mgr.run_on(
//!         ThreadRegex::AllWorker,
//!         move |_addr| {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!         },
//!         true,
//!     );
//!     assert_eq!(hits.load(Ordering::Relaxed), 4);
//!
//!     mgr.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Epoll reactors use `epoll`, `eventfd`, and `timerfd`
//! directly; polled reactors need a [`PolledRuntime`] implementation (the
//! in-process [`LoopbackRuntime`] is the default).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;
pub(crate) mod reactor_epoll;
pub(crate) mod reactor_polled;

// ── Public modules ──────────────────────────────────────────────────────
pub mod alloc;
pub mod config;
pub mod device;
pub mod error;
pub mod interface;
pub mod manager;
pub mod msg;
pub mod polled;
pub mod reactor;
pub mod thread;
pub mod timer;

// ── Re-exports: Manager ─────────────────────────────────────────────────

/// Static manager tunables.
pub use config::Config;
/// Runtime errors.
pub use error::Error;
/// Hook replacing the default drive interface during `start`.
pub use manager::InterfaceAdder;
/// The process-wide I/O manager facade.
pub use manager::IoManager;
/// Lifecycle states of the manager.
pub use manager::MgrState;

// ── Re-exports: Messaging ───────────────────────────────────────────────

/// A typed message addressed to one logical I/O thread.
pub use msg::Msg;
/// Module handler invoked on the destination thread.
pub use msg::MsgHandler;
/// Identifier of a registered message module.
pub use msg::MsgModuleId;
/// Inline message payload.
pub use msg::MsgPayload;
/// Message discriminator with an open user range.
pub use msg::MsgType;
/// Message plus completion latch for synchronous fan-out.
pub use msg::SyncMsg;

// ── Re-exports: Threads ─────────────────────────────────────────────────

/// One logical I/O thread hosted by a reactor.
pub use thread::IoThread;
/// Index of a reactor in the manager's table.
pub use thread::ReactorIdx;
/// Address of a logical I/O thread (reactor + slot).
pub use thread::ThreadAddr;
/// Dense process-wide index of a logical I/O thread.
pub use thread::ThreadIdx;
/// Broadcast predicate over logical I/O threads.
pub use thread::ThreadRegex;
/// Observer of thread start/stop events.
pub use thread::ThreadStateNotifier;
/// The logical I/O thread of the calling reactor thread.
pub use reactor::iothread_self;
/// Shared face of one reactor.
pub use reactor::ReactorHandle;

// ── Re-exports: Devices and interfaces ──────────────────────────────────

/// Opaque block-device descriptor.
pub use device::BdevHandle;
/// Per-device readiness callback.
pub use device::DeviceCallback;
/// Variant device handle (fd, block device, queue pair).
pub use device::DeviceHandle;
/// Device attachment scope.
pub use device::DeviceScope;
/// Per-reactor device filter.
pub use device::IoDevSelector;
/// A registered I/O device.
pub use device::IoDevice;
/// Opaque queue-pair descriptor.
pub use device::QPairHandle;
/// Kernel-AIO drive interface (attach/detach contract).
pub use interface::AioDriveInterface;
/// Marker contract for drive back-ends.
pub use interface::DriveInterface;
/// Catch-all interface for descriptor devices.
pub use interface::GenericInterface;
/// Capability set of an I/O interface.
pub use interface::IoInterface;
/// Polled-NVMe drive interface (attach/detach contract).
pub use interface::PolledDriveInterface;

// ── Re-exports: Timers ──────────────────────────────────────────────────

/// Readiness-notified timer (timerfd + deadline heap).
pub use timer::EpollTimer;
/// Poller-delegated timer for polled reactors.
pub use timer::PolledTimer;
/// Common timer contract.
pub use timer::Timer;
/// Timer callback type.
pub use timer::TimerCallback;
/// Opaque cookie passed back to timer callbacks.
pub use timer::TimerCookie;
/// Handle for cancelling a scheduled timer.
pub use timer::TimerHandle;

// ── Re-exports: Polled runtime seam ─────────────────────────────────────

/// In-process polled runtime used when none is wired in.
pub use polled::LoopbackRuntime;
/// Job delivered into a polled thread's mailbox.
pub use polled::PolledJob;
/// Contract of the external polled-thread library.
pub use polled::PolledRuntime;
/// Handle to one polled thread.
pub use polled::PolledThreadHandle;

// ── Re-exports: Aligned buffers ─────────────────────────────────────────

/// Aligned allocation contract.
pub use alloc::AlignedAlloc;
/// `posix_memalign`-backed default allocator.
pub use alloc::LibcAlloc;
