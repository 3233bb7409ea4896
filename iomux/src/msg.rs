//! Inter-thread messages.
//!
//! A [`Msg`] is a per-copy destination plus a shared, immutable body
//! (type tag, destination module, payload). `clone()` bumps the body's
//! reference count, so a broadcast delivers one logical payload to many
//! reactors without copying it; dropping the last copy reclaims it.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device::IoDevice;
use crate::thread::ThreadAddr;

/// Identifier of a registered message module (handler).
pub type MsgModuleId = u32;

/// A registered module handler, invoked on the destination thread.
pub type MsgHandler = Arc<dyn Fn(&Msg) + Send + Sync>;

/// A closure executed on the destination thread by the internal module.
/// Shared across broadcast recipients, so it must be `Fn`.
pub type ThreadMethod = Arc<dyn Fn(ThreadAddr) + Send + Sync>;

/// Message discriminator. `User` codes form an open range for client
/// modules.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgType {
    /// Move a device readiness event to another thread.
    Reschedule,
    /// Ask the destination thread to give up its I/O thread status.
    RelinquishIoThread,
    /// Execute a carried closure on the destination thread.
    RunMethod,
    /// Client-defined message code.
    User(u32),
}

/// Inline message payload.
#[derive(Clone)]
pub enum MsgPayload {
    /// No payload.
    None,
    /// Device handle plus readiness event mask.
    Reschedule { device: Arc<IoDevice>, events: u32 },
    /// Closure to run on the destination thread.
    RunMethod(ThreadMethod),
    /// Opaque client payload.
    User(Arc<dyn Any + Send + Sync>),
}

struct MsgBody {
    typ: MsgType,
    module: MsgModuleId,
    payload: MsgPayload,
    latch: Option<Arc<SyncLatch>>,
}

/// A typed message addressed to one logical I/O thread.
pub struct Msg {
    pub(crate) dest: Option<ThreadAddr>,
    body: Arc<MsgBody>,
}

impl Clone for Msg {
    fn clone(&self) -> Self {
        Self {
            dest: self.dest,
            body: Arc::clone(&self.body),
        }
    }
}

impl Msg {
    fn from_parts(typ: MsgType, module: MsgModuleId, payload: MsgPayload) -> Self {
        Self {
            dest: None,
            body: Arc::new(MsgBody {
                typ,
                module,
                payload,
                latch: None,
            }),
        }
    }

    /// A payload-less message of the given type.
    pub fn new(typ: MsgType, module: MsgModuleId) -> Self {
        Self::from_parts(typ, module, MsgPayload::None)
    }

    /// A `Reschedule` message carrying a device and its event mask.
    pub fn reschedule(module: MsgModuleId, device: Arc<IoDevice>, events: u32) -> Self {
        Self::from_parts(
            MsgType::Reschedule,
            module,
            MsgPayload::Reschedule { device, events },
        )
    }

    /// A `RunMethod` message carrying a closure to execute on the
    /// destination thread.
    pub fn run_method(module: MsgModuleId, f: impl Fn(ThreadAddr) + Send + Sync + 'static) -> Self {
        Self::from_parts(MsgType::RunMethod, module, MsgPayload::RunMethod(Arc::new(f)))
    }

    /// A client message with an open-range code and opaque payload.
    pub fn user(module: MsgModuleId, code: u32, data: Arc<dyn Any + Send + Sync>) -> Self {
        Self::from_parts(MsgType::User(code), module, MsgPayload::User(data))
    }

    /// Message type tag.
    pub fn msg_type(&self) -> MsgType {
        self.body.typ
    }

    /// Destination module id.
    pub fn module(&self) -> MsgModuleId {
        self.body.module
    }

    /// Destination thread, set on delivery.
    pub fn dest(&self) -> Option<ThreadAddr> {
        self.dest
    }

    /// Payload view.
    pub fn payload(&self) -> &MsgPayload {
        &self.body.payload
    }

    /// Acknowledge a synchronous sender. Handlers must acknowledge exactly
    /// once per received copy; a no-op for plain messages.
    pub fn ack(&self) {
        if let Some(latch) = &self.body.latch {
            latch.ack();
        }
    }

    /// Whether a synchronous sender is waiting on this message.
    pub fn is_sync(&self) -> bool {
        self.body.latch.is_some()
    }

    pub(crate) fn with_dest(mut self, addr: ThreadAddr) -> Self {
        self.dest = Some(addr);
        self
    }
}

/// One-shot countdown latch coupling a sync sender with its recipients.
pub(crate) struct SyncLatch {
    done: Mutex<usize>,
    cv: Condvar,
}

impl SyncLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn ack(&self) {
        let mut done = self.done.lock().unwrap();
        *done += 1;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self, target: usize) {
        let mut done = self.done.lock().unwrap();
        while *done < target {
            done = self.cv.wait(done).unwrap();
        }
    }

    pub(crate) fn wait_deadline(&self, target: usize, deadline: Instant) -> bool {
        let mut done = self.done.lock().unwrap();
        while *done < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        true
    }
}

/// A message paired with a completion latch for synchronous fan-out.
///
/// Recipient handlers call [`Msg::ack`]; the sender blocks in
/// [`wait`](Self::wait) until every recipient has acknowledged.
pub struct SyncMsg {
    msg: Msg,
    latch: Arc<SyncLatch>,
}

impl SyncMsg {
    /// Wrap a message with a fresh latch. The latch rides in the shared
    /// body, so broadcast clones all acknowledge the same sender.
    pub fn new(msg: Msg) -> Self {
        let latch = Arc::new(SyncLatch::new());
        let msg = Msg {
            dest: msg.dest,
            body: Arc::new(MsgBody {
                typ: msg.body.typ,
                module: msg.body.module,
                payload: msg.body.payload.clone(),
                latch: Some(Arc::clone(&latch)),
            }),
        };
        Self { msg, latch }
    }

    /// A synchronous `RunMethod` message.
    pub fn run_method(
        module: MsgModuleId,
        f: impl Fn(ThreadAddr) + Send + Sync + 'static,
    ) -> Self {
        Self::new(Msg::run_method(module, f))
    }

    /// The sendable message. Clones share the latch.
    pub fn msg(&self) -> Msg {
        self.msg.clone()
    }

    /// Block until `fanout` acknowledgements have arrived.
    pub fn wait(&self, fanout: usize) {
        self.latch.wait(fanout);
    }

    /// Deadline-bounded wait; false on timeout.
    pub fn wait_timeout(&self, fanout: usize, timeout: Duration) -> bool {
        self.latch.wait_deadline(fanout, Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::thread;

    #[test]
    fn clone_shares_payload() {
        let data: Arc<dyn Any + Send + Sync> = Arc::new(7u32);
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&data);
        let msg = Msg::user(3, 100, data);
        let copy = msg.clone();
        drop(msg);
        assert!(weak.upgrade().is_some());
        drop(copy);
        assert!(weak.upgrade().is_none(), "payload must die with last copy");
    }

    #[test]
    fn dest_is_per_copy() {
        let msg = Msg::new(MsgType::RelinquishIoThread, 0);
        let addressed = msg.clone().with_dest(ThreadAddr { reactor: 2, slot: 0 });
        assert_eq!(msg.dest(), None);
        assert_eq!(
            addressed.dest(),
            Some(ThreadAddr { reactor: 2, slot: 0 })
        );
    }

    #[test]
    fn sync_latch_counts_acks() {
        let smsg = SyncMsg::run_method(0, |_| {});
        let m1 = smsg.msg();
        let m2 = smsg.msg();
        let t = thread::spawn(move || {
            m1.ack();
            m2.ack();
        });
        smsg.wait(2);
        t.join().unwrap();
    }

    #[test]
    fn sync_wait_timeout_reports_missing_ack() {
        let smsg = SyncMsg::run_method(0, |_| {});
        let m = smsg.msg();
        m.ack();
        assert!(!smsg.wait_timeout(2, Duration::from_millis(20)));
        assert!(smsg.wait_timeout(1, Duration::from_millis(20)));
    }
}
