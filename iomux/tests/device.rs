//! Integration tests: device registration and readiness dispatch.
//!
//! Uses UDP sockets as fd devices: registration fans the descriptor out to
//! reactor epoll sets, and a datagram arrival drives the interface's event
//! path.

use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iomux::{
    DeviceCallback, DeviceHandle, DeviceScope, IoDevice, IoInterface, IoManager, ThreadIdx,
    ThreadRegex,
};

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A nonblocking UDP socket plus a callback that drains it on readiness.
fn udp_device_parts(fired: Arc<AtomicUsize>) -> (UdpSocket, std::net::SocketAddr, DeviceCallback) {
    let sock = UdpSocket::bind("127.0.0.1:0").expect("bind failed");
    sock.set_nonblocking(true).expect("nonblocking failed");
    let addr = sock.local_addr().expect("no local addr");
    let drain = sock.try_clone().expect("clone failed");
    let cb: DeviceCallback = Arc::new(move |_dev, _events| {
        // Drain so the level-triggered readiness clears.
        let mut buf = [0u8; 64];
        while drain.recv_from(&mut buf).is_ok() {}
        fired.fetch_add(1, Ordering::Relaxed);
    });
    (sock, addr, cb)
}

#[test]
fn global_device_attaches_everywhere_and_dispatches() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");
    let generic = mgr.generic_interface().expect("no generic interface");

    let fired = Arc::new(AtomicUsize::new(0));
    let (sock, addr, cb) = udp_device_parts(Arc::clone(&fired));

    let iface: Arc<dyn IoInterface> = generic.clone();
    let dev = IoDevice::new(
        DeviceHandle::Fd(sock.as_raw_fd()),
        0,
        DeviceScope::Global,
        &iface,
        Some(cb),
        None,
    );
    let attached = generic.add_device(Arc::clone(&dev), &mgr);
    assert_eq!(attached, 2, "global device must reach every reactor");

    // Global scope populates per-thread context on every live I/O thread.
    let idxs = Arc::new(Mutex::new(Vec::<ThreadIdx>::new()));
    let sink = Arc::clone(&idxs);
    mgr.run_on(
        ThreadRegex::AllIo,
        move |_addr| {
            if let Some(thread) = iomux::iothread_self() {
                sink.lock().unwrap().push(thread.thread_idx);
            }
        },
        true,
    );
    for idx in idxs.lock().unwrap().iter() {
        assert!(dev.has_thread_ctx(*idx), "missing per-thread ctx for {idx}");
    }

    let sender = UdpSocket::bind("127.0.0.1:0").expect("bind failed");
    sender.send_to(b"ping", addr).expect("send failed");
    assert!(wait_until(
        || fired.load(Ordering::Relaxed) >= 1,
        Duration::from_secs(5)
    ));

    // After deregistration no further events are delivered.
    generic.remove_device(&dev, &mgr);
    let before = fired.load(Ordering::Relaxed);
    sender.send_to(b"ping", addr).expect("send failed");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::Relaxed), before);

    mgr.stop();
}

#[test]
fn per_thread_device_attaches_to_one_reactor() {
    let mgr = IoManager::new();
    mgr.start(3, false, None, None).expect("start failed");
    let generic = mgr.generic_interface().expect("no generic interface");

    // Pin the device to one worker thread.
    let addrs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&addrs);
    mgr.run_on(
        ThreadRegex::AllWorker,
        move |addr| {
            sink.lock().unwrap().push(addr);
        },
        true,
    );
    let pin = addrs.lock().unwrap()[0];

    let fired = Arc::new(AtomicUsize::new(0));
    let (sock, addr, cb) = udp_device_parts(Arc::clone(&fired));
    let iface: Arc<dyn IoInterface> = generic.clone();
    let dev = IoDevice::new(
        DeviceHandle::Fd(sock.as_raw_fd()),
        0,
        DeviceScope::Thread(pin),
        &iface,
        Some(cb),
        None,
    );
    let attached = generic.add_device(Arc::clone(&dev), &mgr);
    assert_eq!(attached, 1, "per-thread device targets a single thread");

    let sender = UdpSocket::bind("127.0.0.1:0").expect("bind failed");
    sender.send_to(b"ping", addr).expect("send failed");
    assert!(wait_until(
        || fired.load(Ordering::Relaxed) >= 1,
        Duration::from_secs(5)
    ));

    generic.remove_device(&dev, &mgr);
    mgr.stop();
}

#[test]
fn reschedule_routes_event_to_interface() {
    let mgr = IoManager::new();
    mgr.start(2, false, None, None).expect("start failed");
    let generic = mgr.generic_interface().expect("no generic interface");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);
    let cb: DeviceCallback = Arc::new(move |_dev, events| {
        assert_eq!(events, 0x1);
        flag.fetch_add(1, Ordering::Relaxed);
    });
    let iface: Arc<dyn IoInterface> = generic.clone();
    // A block device has no descriptor; reschedule is the only event path.
    let dev = IoDevice::new(
        DeviceHandle::Bdev(iomux::BdevHandle { name: "vol0".into() }),
        0,
        DeviceScope::Global,
        &iface,
        Some(cb),
        None,
    );
    let attached = generic.add_device(Arc::clone(&dev), &mgr);
    assert_eq!(attached, 2);

    mgr.device_reschedule(&dev, 0x1);
    assert!(wait_until(
        || fired.load(Ordering::Relaxed) == 1,
        Duration::from_secs(5)
    ));

    generic.remove_device(&dev, &mgr);
    mgr.stop();
}
