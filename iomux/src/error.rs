use std::io;

use thiserror::Error;

/// Errors returned by the iomux manager and its reactors.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall (epoll, eventfd, timerfd, ...) failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// The dense thread-index pool is saturated.
    #[error("io thread limit reached")]
    ThreadsExhausted,
    /// The fixed-capacity message-module registry is full.
    #[error("message module registry full")]
    MsgModulesExhausted,
    /// Polled runtime initialisation failed.
    #[error("polled runtime init: {0}")]
    PolledInit(String),
    /// The calling thread is not running a reactor loop.
    #[error("not an io reactor thread")]
    NotReactorThread,
    /// Operation requires the manager to be running.
    #[error("manager is not running")]
    NotRunning,
}
