//! Library defaults used when no `BEEP_*` override is present.

use beep_core::constants::DEFAULT_WINDOW_SIZE;

pub const WORKER_THREADS: usize = 5;
pub const WAIT_TIMEOUT_MS: u64 = 500;
pub const STOP_TIMEOUT_MS: u64 = 60_000;
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const REPLY_TIMEOUT_MS: u64 = 30_000;
pub const WRITE_TIMEOUT_MS: u64 = 10_000;
pub const WINDOW_SIZE: u32 = DEFAULT_WINDOW_SIZE;
pub const MAX_FRAME_SIZE: u32 = 4096;
pub const COMPLETE_FLAG: bool = true;
pub const AUTOMATIC_MIME: bool = true;
/// 0 disables idle detection
pub const IDLE_TIMEOUT_MS: u64 = 0;
/// Readiness events without data before a connection is dropped
pub const MAX_NO_DATA_READS: u32 = 25;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub const IO_BACKEND: &str = "epoll";
    } else {
        pub const IO_BACKEND: &str = "poll";
    }
}
