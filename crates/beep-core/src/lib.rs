//! # beep-core
//!
//! Core types for the BEEP (RFC 3080/3081) engine.
//!
//! This crate is platform-agnostic and does no I/O. Sockets, threads and
//! the reader loop live in `beep-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy and per-connection status codes
//! - `queue` - Blocking FIFO queue with waiter accounting
//! - `frame` - Frame model, fragment joining
//! - `codec` - Header parsing, incremental decoder, encoders
//! - `mime` - MIME header block parsing
//! - `seq` - Wrapping sequence/message number arithmetic
//! - `state` - Per-channel sequencing, flow control and reassembly
//! - `sync` - Poison-tolerant lock helpers

pub mod codec;
pub mod error;
pub mod frame;
pub mod mime;
pub mod queue;
pub mod seq;
pub mod state;
pub mod sync;

// Re-exports for convenience
pub use codec::{encode_frame, encode_seq, FrameDecoder, Incoming};
pub use error::{BeepError, DecodeError, Result, Status};
pub use frame::{Frame, FrameKind, FrameType, SeqFrame};
pub use mime::{MimeError, MimeHeaders};
pub use queue::{BlockingQueue, QueueGuard};
pub use state::{Assembly, ChannelState, Violation};
pub use sync::{LockExt, RwLockExt};

/// Protocol constants
pub mod constants {
    /// Highest channel number allowed on the wire
    pub const MAX_CHANNEL_NO: u32 = 2_147_483_647;

    /// Highest message number; message numbers wrap modulo 2^31
    pub const MAX_MSG_NO: u32 = 2_147_483_647;

    /// Sequence numbers wrap modulo 2^32
    pub const MAX_SEQ_MOD: u64 = 4_294_967_296;

    /// Largest single read the framing layer performs
    pub const MAX_BUFFER_SIZE: usize = 131_072;

    /// Initial window advertised for every channel (RFC 3081)
    pub const DEFAULT_WINDOW_SIZE: u32 = 4096;

    /// Longest accepted frame header line, CRLF included
    pub const MAX_HEADER_LEN: usize = 100;

    pub const TRAILER: &[u8] = b"END\r\n";

    pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

    pub const DEFAULT_TRANSFER_ENCODING: &str = "binary";

    /// Content type of channel 0 management messages
    pub const BEEP_XML_MIME_TYPE: &str = "application/beep+xml";
}
