//! # beep - BEEP protocol engine
//!
//! Threaded implementation of BEEP (RFC 3080) over TCP (RFC 3081).
//!
//! ## Features
//!
//! - **One reader thread** multiplexing every session of a context
//! - **Flow control**: per-channel windows, SEQ frames, fragmentation
//! - **Three-level dispatch**: global hook, channel handler, profile handler
//! - **Channel pools**: reuse open channels instead of paying start/close
//! - **Swappable I/O backend**: poll or epoll, changeable at runtime
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use beep::prelude::*;
//!
//! let ctx = Context::new(ContextConfig::from_env())?;
//! ctx.profiles().register(
//!     "http://example.org/beep/echo",
//!     None,
//!     None,
//!     Some(Arc::new(|ch: &Channel, _conn: &Connection, frame: Frame| {
//!         let _ = ch.send_rpy(frame.msgno(), frame.content());
//!     })),
//! )?;
//! let listener = Listener::new(&ctx, "127.0.0.1", 44000)?;
//!
//! let conn = Connection::connect(&ctx, "127.0.0.1", 44000)?;
//! let ch = Channel::open(&conn, "http://example.org/beep/echo")?;
//! let reply = ch.send_msg_and_wait(b"ping", std::time::Duration::from_secs(5))?;
//! assert_eq!(reply.content(), b"ping");
//! ctx.exit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      profiles, Channel::send_*, ChannelPool, Listener       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Context                                │
//! │        config, profile registry, hooks, id counters         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┴───────────────────┐
//!          ▼                                       ▼
//!    ┌───────────┐                           ┌───────────┐
//!    │  Reader   │ ── profile deliveries ──▶ │  Workers  │
//!    │  Thread   │                           │  (fixed)  │
//!    └───────────┘                           └───────────┘
//!          │
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │      poll / epoll  over  listeners + connections        │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use beep_core::{
    constants, BeepError, BlockingQueue, Frame, FrameKind, FrameType, MimeHeaders, Result, SeqFrame, Status,
};

// Re-export runtime types
pub use beep_runtime::{
    AcceptedHandler, Channel, ChannelOptions, ChannelPool, CloseHandler, Completion, ConfigError, ConnData,
    Connection, Context, ContextConfig, CreateChannelFn, FinishHandler, FrameReceivedHandler, IdleHandler,
    IoWaitType, Listener, ListenerReadyHandler, OnCloseHandler, PoolData, PoolOptions, PrereadHandler,
    ProfileMask, ProfileRegistry, Reader, ReaderState, Role, StartDecision, StartExtendedHandler, StartHandler,
    StartRequest, Transport, WorkerPool,
};

/// Lower-level modules, for embedders that need them
pub mod runtime {
    pub use beep_runtime::{config, greetings, io, reader, transport};
}

pub mod prelude {
    //! Prelude module for convenient imports
    //!
    //! ```ignore
    //! use beep::prelude::*;
    //! ```

    pub use crate::{
        BeepError, Channel, ChannelOptions, ChannelPool, Connection, Context, ContextConfig, Frame, FrameKind,
        Listener, PoolOptions, Result, Role, Status,
    };
}
