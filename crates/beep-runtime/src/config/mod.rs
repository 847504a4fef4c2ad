//! Context configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the returned value
//! 2. `BEEP_*` environment variables
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use beep_runtime::config::ContextConfig;
//!
//! let config = ContextConfig::from_env()
//!     .worker_threads(8)
//!     .window_size(16 * 1024);
//! ```

pub mod defaults;
pub mod env;

use std::time::Duration;

use beep_core::constants::{DEFAULT_WINDOW_SIZE, MAX_BUFFER_SIZE, MAX_CHANNEL_NO};
use thiserror::Error;

use crate::io::IoWaitType;
use env::{env_get, env_get_bool, env_get_opt};

/// Per-context configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Threads in the worker pool
    pub worker_threads: usize,
    /// I/O multiplexing backend used by the reader
    pub io_backend: IoWaitType,
    /// Upper bound on one multiplexing wait
    pub wait_timeout: Duration,
    /// How long `Context::exit` waits for the reader to acknowledge
    pub stop_timeout: Duration,
    /// TCP connect plus greeting exchange
    pub connect_timeout: Duration,
    /// Wait for channel 0 replies (start/close)
    pub reply_timeout: Duration,
    /// Wait for a non-blocking socket to become writable
    pub write_timeout: Duration,
    /// Incoming window advertised on new channels
    pub window_size: u32,
    /// Largest payload put in one outgoing frame
    pub max_frame_size: u32,
    /// Join fragments before delivery on new channels
    pub complete_flag: bool,
    /// Prefix outgoing payloads with a MIME header block
    pub automatic_mime: bool,
    /// Idle handler threshold, `None` disables the check
    pub idle_timeout: Option<Duration>,
    pub max_no_data_reads: u32,
    /// `serverName` sent on channel start requests
    pub server_name: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ContextConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `BEEP_WORKER_THREADS`
    /// - `BEEP_IO_BACKEND` - `poll` or `epoll`
    /// - `BEEP_WAIT_TIMEOUT_MS`, `BEEP_STOP_TIMEOUT_MS`, `BEEP_CONNECT_TIMEOUT_MS`,
    ///   `BEEP_REPLY_TIMEOUT_MS`, `BEEP_WRITE_TIMEOUT_MS`
    /// - `BEEP_WINDOW_SIZE`, `BEEP_MAX_FRAME_SIZE`
    /// - `BEEP_COMPLETE_FLAG`, `BEEP_AUTOMATIC_MIME` (0/1)
    /// - `BEEP_IDLE_TIMEOUT_MS` - 0 disables
    /// - `BEEP_MAX_NO_DATA_READS`
    /// - `BEEP_SERVER_NAME`
    pub fn from_env() -> Self {
        let backend: String = env_get("BEEP_IO_BACKEND", defaults::IO_BACKEND.to_string());
        let idle_ms: u64 = env_get("BEEP_IDLE_TIMEOUT_MS", defaults::IDLE_TIMEOUT_MS);
        Self {
            worker_threads: env_get("BEEP_WORKER_THREADS", defaults::WORKER_THREADS),
            io_backend: backend.parse().unwrap_or_default(),
            wait_timeout: Duration::from_millis(env_get("BEEP_WAIT_TIMEOUT_MS", defaults::WAIT_TIMEOUT_MS)),
            stop_timeout: Duration::from_millis(env_get("BEEP_STOP_TIMEOUT_MS", defaults::STOP_TIMEOUT_MS)),
            connect_timeout: Duration::from_millis(env_get(
                "BEEP_CONNECT_TIMEOUT_MS",
                defaults::CONNECT_TIMEOUT_MS,
            )),
            reply_timeout: Duration::from_millis(env_get("BEEP_REPLY_TIMEOUT_MS", defaults::REPLY_TIMEOUT_MS)),
            write_timeout: Duration::from_millis(env_get("BEEP_WRITE_TIMEOUT_MS", defaults::WRITE_TIMEOUT_MS)),
            window_size: env_get("BEEP_WINDOW_SIZE", defaults::WINDOW_SIZE),
            max_frame_size: env_get("BEEP_MAX_FRAME_SIZE", defaults::MAX_FRAME_SIZE),
            complete_flag: env_get_bool("BEEP_COMPLETE_FLAG", defaults::COMPLETE_FLAG),
            automatic_mime: env_get_bool("BEEP_AUTOMATIC_MIME", defaults::AUTOMATIC_MIME),
            idle_timeout: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
            max_no_data_reads: env_get("BEEP_MAX_NO_DATA_READS", defaults::MAX_NO_DATA_READS),
            server_name: env_get_opt("BEEP_SERVER_NAME"),
        }
    }

    /// Library defaults only, no environment lookups.
    pub fn new() -> Self {
        Self {
            worker_threads: defaults::WORKER_THREADS,
            io_backend: defaults::IO_BACKEND.parse().unwrap_or_default(),
            wait_timeout: Duration::from_millis(defaults::WAIT_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(defaults::STOP_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            reply_timeout: Duration::from_millis(defaults::REPLY_TIMEOUT_MS),
            write_timeout: Duration::from_millis(defaults::WRITE_TIMEOUT_MS),
            window_size: defaults::WINDOW_SIZE,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            complete_flag: defaults::COMPLETE_FLAG,
            automatic_mime: defaults::AUTOMATIC_MIME,
            idle_timeout: None,
            max_no_data_reads: defaults::MAX_NO_DATA_READS,
            server_name: None,
        }
    }

    // Builder methods

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn io_backend(mut self, backend: IoWaitType) -> Self {
        self.io_backend = backend;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn stop_timeout(mut self, d: Duration) -> Self {
        self.stop_timeout = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn reply_timeout(mut self, d: Duration) -> Self {
        self.reply_timeout = d;
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn complete_flag(mut self, on: bool) -> Self {
        self.complete_flag = on;
        self
    }

    pub fn automatic_mime(mut self, on: bool) -> Self {
        self.automatic_mime = on;
        self
    }

    pub fn idle_timeout(mut self, d: Option<Duration>) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn max_no_data_reads(mut self, n: u32) -> Self {
        self.max_no_data_reads = n;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue("worker_threads must be > 0"));
        }
        if self.worker_threads > 256 {
            return Err(ConfigError::InvalidValue("worker_threads must be <= 256"));
        }
        if self.wait_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("wait_timeout must be > 0"));
        }
        if self.window_size < DEFAULT_WINDOW_SIZE || self.window_size as usize > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue("window_size must be in 4096..=131072"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_CHANNEL_NO {
            return Err(ConfigError::InvalidValue("max_frame_size must be > 0"));
        }
        if self.max_no_data_reads == 0 {
            return Err(ConfigError::InvalidValue("max_no_data_reads must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("BEEP Context Configuration:");
        eprintln!("  worker_threads:     {}", self.worker_threads);
        eprintln!("  io_backend:         {}", self.io_backend);
        eprintln!("  wait_timeout:       {:?}", self.wait_timeout);
        eprintln!("  stop_timeout:       {:?}", self.stop_timeout);
        eprintln!("  connect_timeout:    {:?}", self.connect_timeout);
        eprintln!("  reply_timeout:      {:?}", self.reply_timeout);
        eprintln!("  write_timeout:      {:?}", self.write_timeout);
        eprintln!("  window_size:        {}", self.window_size);
        eprintln!("  max_frame_size:     {}", self.max_frame_size);
        eprintln!("  complete_flag:      {}", self.complete_flag);
        eprintln!("  automatic_mime:     {}", self.automatic_mime);
        eprintln!("  idle_timeout:       {:?}", self.idle_timeout);
        eprintln!("  max_no_data_reads:  {}", self.max_no_data_reads);
        eprintln!("  server_name:        {:?}", self.server_name);
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ContextConfig::new();
        assert_eq!(config.worker_threads, defaults::WORKER_THREADS);
        assert_eq!(config.window_size, 4096);
        assert!(config.idle_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ContextConfig::new()
            .worker_threads(2)
            .io_backend(IoWaitType::Poll)
            .window_size(8192)
            .idle_timeout(Some(Duration::from_secs(3)))
            .server_name("example.org");
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.io_backend, IoWaitType::Poll);
        assert_eq!(config.window_size, 8192);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.server_name.as_deref(), Some("example.org"));
    }

    #[test]
    fn test_validation() {
        assert!(ContextConfig::new().worker_threads(0).validate().is_err());
        assert!(ContextConfig::new().worker_threads(1000).validate().is_err());
        assert!(ContextConfig::new().window_size(1).validate().is_err());
        assert!(ContextConfig::new().window_size(1 << 20).validate().is_err());
        assert!(ContextConfig::new().max_frame_size(0).validate().is_err());
    }

    #[test]
    fn test_from_env_is_valid() {
        let config = ContextConfig::from_env();
        assert!(config.worker_threads >= 1);
    }
}
