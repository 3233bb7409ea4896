//! Epoll-driven reactor backend.
//!
//! The loop blocks in `epoll_wait` on three sources: the message eventfd
//! (drain the inbox and dispatch), the per-thread timer descriptor, and
//! registered fd devices (route to the owning interface). Message delivery
//! from other threads pushes onto the inbox channel and writes the eventfd.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::warn;

use crate::device::IoDevice;
use crate::error::Error;
use crate::manager::IoManager;
use crate::msg::Msg;
use crate::reactor::{Backend, HandleKind, dispatch_msg, with_current};
use crate::timer::{EpollTimer, Timer};

/// Loop-owned state of an epoll reactor.
pub(crate) struct EpollState {
    epfd: RawFd,
    evfd: RawFd,
    rx: Receiver<Msg>,
    timer: Arc<EpollTimer>,
    devices: HashMap<RawFd, Arc<IoDevice>>,
}

impl EpollState {
    /// Register a device's descriptor with the epoll set. Non-fd devices
    /// have nothing to watch here.
    pub(crate) fn attach_device(&mut self, dev: &Arc<IoDevice>) -> bool {
        let Some(fd) = dev.fd() else {
            return true;
        };
        if self.devices.contains_key(&fd) {
            return true;
        }
        let events = if dev.events != 0 {
            dev.events
        } else {
            libc::EPOLLIN as u32
        };
        if epoll_add(self.epfd, fd, events).is_err() {
            warn!("epoll add failed for device {}", dev.dev_id());
            return false;
        }
        self.devices.insert(fd, Arc::clone(dev));
        true
    }

    pub(crate) fn detach_device(&mut self, dev: &Arc<IoDevice>) {
        if let Some(fd) = dev.fd() {
            if self.devices.remove(&fd).is_some() {
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            }
        }
    }

    pub(crate) fn close(self) {
        unsafe {
            libc::close(self.evfd);
            libc::close(self.epfd);
        }
        // The timer fd closes with the EpollTimer drop.
    }
}

fn epoll_add(epfd: RawFd, fd: RawFd, events: u32) -> Result<(), Error> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Create the epoll set, message eventfd, inbox, and thread timer.
pub(crate) fn build() -> Result<(Backend, HandleKind, Arc<dyn Timer>), Error> {
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let evfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if evfd < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(epfd);
        }
        return Err(Error::Io(err));
    }

    let timer = EpollTimer::new().inspect_err(|_| unsafe {
        libc::close(evfd);
        libc::close(epfd);
    })?;

    epoll_add(epfd, evfd, libc::EPOLLIN as u32)
        .and_then(|_| epoll_add(epfd, timer.fd(), libc::EPOLLIN as u32))
        .inspect_err(|_| unsafe {
            libc::close(evfd);
            libc::close(epfd);
        })?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let state = EpollState {
        epfd,
        evfd,
        rx,
        timer: Arc::clone(&timer),
        devices: HashMap::new(),
    };
    Ok((
        Backend::Epoll(state),
        HandleKind::Epoll { tx, evfd },
        timer,
    ))
}

enum Ready {
    Inbox,
    ThreadTimer(Arc<EpollTimer>),
    Device(Arc<IoDevice>),
    Unknown,
}

/// Drive the epoll loop until the last hosted thread relinquishes.
pub(crate) fn drive(mgr: &Arc<IoManager>) -> Result<(), Error> {
    let batch = mgr.config().epoll_batch;
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; batch];

    loop {
        let fds = with_current(|r| match &r.backend {
            Backend::Epoll(e) => Some((e.epfd, e.evfd, e.timer.fd())),
            Backend::Polled(_) => None,
        })
        .flatten();
        let Some((epfd, evfd, tfd)) = fds else {
            return Err(Error::NotReactorThread);
        };

        let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), batch as i32, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let mask = ev.events;
            let ready = classify(fd, evfd, tfd);
            match ready {
                Ready::Inbox => {
                    let mut val: u64 = 0;
                    unsafe {
                        libc::read(evfd, &mut val as *mut u64 as *mut libc::c_void, 8);
                    }
                    drain_inbox(mgr);
                }
                Ready::ThreadTimer(timer) => timer.fire_due(),
                Ready::Device(dev) => {
                    if let Some(iface) = dev.interface() {
                        iface.handle_event(&dev, mask);
                    }
                }
                Ready::Unknown => {}
            }
        }

        if with_current(|r| r.exit).unwrap_or(true) {
            return Ok(());
        }
    }
}

fn classify(fd: RawFd, evfd: RawFd, tfd: RawFd) -> Ready {
    if fd == evfd {
        return Ready::Inbox;
    }
    with_current(|r| match &r.backend {
        Backend::Epoll(e) => {
            if fd == tfd {
                Ready::ThreadTimer(Arc::clone(&e.timer))
            } else if let Some(dev) = e.devices.get(&fd) {
                Ready::Device(Arc::clone(dev))
            } else {
                Ready::Unknown
            }
        }
        Backend::Polled(_) => Ready::Unknown,
    })
    .unwrap_or(Ready::Unknown)
}

/// Drain queued messages and dispatch each on this thread. Delivery order
/// per sender is the channel's FIFO order.
fn drain_inbox(mgr: &Arc<IoManager>) {
    loop {
        let msg = with_current(|r| match &r.backend {
            Backend::Epoll(e) => e.rx.try_recv().ok(),
            Backend::Polled(_) => None,
        })
        .flatten();
        match msg {
            Some(msg) => dispatch_msg(mgr, &msg),
            None => break,
        }
    }
}
