use crate::error::Error;

/// Static tunables for an [`IoManager`](crate::IoManager).
///
/// Worker count and polled mode are runtime arguments to
/// [`IoManager::start`](crate::IoManager::start); everything here is fixed
/// for the lifetime of the manager.
#[derive(Clone)]
pub struct Config {
    /// Upper bound on concurrently live logical I/O threads. Bounds the
    /// dense thread-index pool and per-device context arenas.
    pub max_io_threads: usize,
    /// Capacity of the message-module registry. Modules are never
    /// unregistered, so lookups stay lock-free; registration fails past
    /// this bound.
    pub max_msg_modules: usize,
    /// Number of readiness events fetched per `epoll_wait` call.
    pub epoll_batch: usize,
    /// Name prefix for manager-owned worker threads. The slot number is
    /// appended (`iomux-worker-0`, ...).
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_io_threads: 1024,
            max_msg_modules: 64,
            epoll_batch: 256,
            thread_name_prefix: "iomux-worker".to_string(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_io_threads == 0 || self.max_io_threads > (1 << 20) {
            return Err(Error::Config(
                "max_io_threads must be > 0 and <= 2^20".into(),
            ));
        }
        if self.max_msg_modules == 0 {
            return Err(Error::Config("max_msg_modules must be > 0".into()));
        }
        if self.epoll_batch == 0 || self.epoll_batch > 4096 {
            return Err(Error::Config("epoll_batch must be in 1..=4096".into()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::Config("thread_name_prefix must be non-empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_threads() {
        let mut config = Config::default();
        config.max_io_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_batch() {
        let mut config = Config::default();
        config.epoll_batch = 65536;
        assert!(config.validate().is_err());
    }
}
