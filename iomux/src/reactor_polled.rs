//! Tight-loop polled reactor backend.
//!
//! Delegates thread hosting to the polled runtime: delivery goes straight
//! into the polled thread's mailbox (no eventfd), and the loop repeatedly
//! polls the runtime. The only suspension point is a cooperative yield
//! between polls; a short sleep backs off when a poll finds no work.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::manager::IoManager;
use crate::polled::{PolledRuntime, PolledThreadHandle};
use crate::reactor::{Backend, HandleKind, with_current};
use crate::thread::ReactorIdx;
use crate::timer::{PolledTimer, Timer};

const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// Loop-owned state of a polled reactor.
pub(crate) struct PolledState {
    runtime: Arc<dyn PolledRuntime>,
    thread: PolledThreadHandle,
}

/// Create the polled thread and its poller-backed timer.
pub(crate) fn build(
    mgr: &Arc<IoManager>,
    idx: ReactorIdx,
) -> Result<(Backend, HandleKind, Arc<dyn Timer>), Error> {
    let runtime = mgr
        .polled_runtime()
        .ok_or_else(|| Error::PolledInit("polled runtime not initialised".into()))?;
    let thread = runtime.create_thread(&format!("iomux-polled-{idx}"))?;
    let timer: Arc<dyn Timer> = PolledTimer::new(thread.clone());
    let state = PolledState {
        runtime,
        thread: thread.clone(),
    };
    Ok((Backend::Polled(state), HandleKind::Polled { thread }, timer))
}

/// Drive the tight loop until the last hosted thread relinquishes.
pub(crate) fn drive(_mgr: &Arc<IoManager>) -> Result<(), Error> {
    let parts = with_current(|r| match &r.backend {
        Backend::Polled(p) => Some((Arc::clone(&p.runtime), p.thread.clone())),
        Backend::Epoll(_) => None,
    })
    .flatten();
    let Some((runtime, thread)) = parts else {
        return Err(Error::NotReactorThread);
    };

    loop {
        let worked = runtime.poll(&thread);
        if with_current(|r| r.exit).unwrap_or(true) {
            return Ok(());
        }
        if worked == 0 {
            std::thread::sleep(IDLE_BACKOFF);
        } else {
            std::thread::yield_now();
        }
    }
}
