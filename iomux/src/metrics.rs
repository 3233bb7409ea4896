//! iomux runtime metrics.
//!
//! Counters for messaging-fabric activity and reactor lifecycle events.
//! Exposed through the metriken registry; the per-thread `outstanding_ops`
//! gauge used for least-busy selection lives on
//! [`IoThread`](crate::IoThread) instead, since it is owner-written.

use metriken::{Counter, Gauge, metric};

// ── Messaging fabric ─────────────────────────────────────────────

#[metric(
    name = "iomux/msgs/sent",
    description = "Messages successfully submitted to a reactor queue"
)]
pub static MSGS_SENT: Counter = Counter::new();

#[metric(
    name = "iomux/msgs/dropped",
    description = "Messages released because no recipient could accept them"
)]
pub static MSGS_DROPPED: Counter = Counter::new();

#[metric(
    name = "iomux/msgs/broadcast",
    description = "multicast_msg invocations"
)]
pub static MSGS_BROADCAST: Counter = Counter::new();

// ── Reactor lifecycle ────────────────────────────────────────────

#[metric(
    name = "iomux/reactors/started",
    description = "Reactor loops entered"
)]
pub static REACTORS_STARTED: Counter = Counter::new();

#[metric(
    name = "iomux/reactors/stopped",
    description = "Reactor loops exited"
)]
pub static REACTORS_STOPPED: Counter = Counter::new();

#[metric(
    name = "iomux/reactors/active",
    description = "Currently live reactor loops"
)]
pub static REACTORS_ACTIVE: Gauge = Gauge::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(
    name = "iomux/timers/fired",
    description = "Timer callbacks executed"
)]
pub static TIMERS_FIRED: Counter = Counter::new();
