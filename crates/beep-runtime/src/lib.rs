//! # beep-runtime
//!
//! Threads, sockets and session machinery for the BEEP engine.
//!
//! This crate provides:
//! - The reader loop: one thread per context multiplexing every session
//! - Pluggable I/O multiplexing (poll, epoll) swappable at runtime
//! - Connections, listeners and the greeting exchange
//! - Channels with flow control, fragmentation and serialized delivery
//! - The profile registry and three-level frame dispatch
//! - Channel pools
//! - A fixed worker pool for application handlers

pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod greetings;
pub mod io;
pub mod listener;
pub mod pool;
pub mod profiles;
pub mod reader;
pub mod transport;
pub mod worker;

mod control;

// Re-exports
pub use channel::{Channel, ChannelOptions};
pub use config::{ConfigError, ContextConfig};
pub use connection::{Connection, ConnData, OnCloseHandler, PrereadHandler, ProfileMask, Role};
pub use context::{AcceptedHandler, Context, FinishHandler, IdleHandler};
pub use io::{new_io_wait, IoWait, IoWaitType};
pub use listener::{Listener, ListenerReadyHandler};
pub use pool::{ChannelPool, CreateChannelFn, PoolData, PoolOptions};
pub use profiles::{
    CloseHandler, FrameReceivedHandler, ProfileRegistry, StartDecision, StartExtendedHandler, StartHandler,
    StartRequest,
};
pub use reader::{Reader, ReaderState};
pub use transport::Transport;
pub use worker::{Completion, WorkerPool};
