//! Protocol state machines for the core of a peer-to-peer overlay client.
//!
//! This library performs no I/O whatsoever. Every object in it is driven
//! from the outside: incoming datagrams and transport events are fed in
//! through `handle` methods, timer expirations through `handle_timeout`,
//! and the resulting transmissions, timer updates, and application events
//! are drained through `poll_io` and `poll`. Time is an absolute `u64`
//! microsecond count supplied by the caller.
//!
//! The three layers, bottom up:
//!
//! - [`SafeStream`](safe_stream/struct.SafeStream.html) turns a lossy,
//!   reorderable datagram link into an ordered, at-most-once byte stream
//!   with cumulative acknowledgements and bounded retransmission.
//! - [`ServerConnection`](connection/struct.ServerConnection.html) opens
//!   one channel to a server at a time, falling back through the server's
//!   channel list and buffering writes until a channel is linked.
//! - [`CloudConnection`](endpoint/struct.CloudConnection.html) multiplexes
//!   several server connections, with quarantine of failing servers and
//!   fan-out request policies.

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate fnv;
extern crate rand;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

use std::fmt;

mod coding;
mod ring;
mod tasks;

pub mod connection;
pub mod endpoint;
pub mod frame;
pub mod safe_stream;
pub mod stream;
pub mod transport;


pub use connection::{ServerConnection, ServerEvent, WriteId, WRITE_BUFFER_CAPACITY};
pub use endpoint::{CloudConfig, CloudConnection, CloudEvent, CloudWriteId, Policy, ServerHandle};
pub use frame::Frame;
pub use ring::{OffsetRange, RingIndex};
pub use safe_stream::{
    Io, SafeStream, SafeStreamConfig, SendId, SessionState, StreamEvent, Timer, TransmitId,
};
pub use stream::SendState;
pub use tasks::{Task, TaskQueue};
pub use transport::{
    Channel, ConnectionClass, ConnectionInfo, ConnectionState, PacketId, Reliability, Server,
    Transport, TransportEvent, TransportFactory, TransportProperties,
};

/// All live offsets of a stream must fit in a window strictly smaller than
/// half the 16-bit ring, or the signed before/after interpretation breaks
/// down.
pub const MAX_WINDOW_SIZE: u16 = (1 << 15) - 1;

/// Identifies a server within the overlay. Zero is reserved and never
/// assigned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one init handshake exchange.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Link state of a byte stream, as reported through `StreamInfo`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    /// No channel is currently open.
    Unlinked,
    /// A channel is open and writable.
    Linked,
    /// The stream failed and will not recover by itself.
    LinkError,
}

/// Properties of a byte stream as seen by its user.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamInfo {
    pub link_state: LinkState,
    pub is_reliable: bool,
    pub is_writable: bool,
    /// Hard upper bound on the size of one written element.
    pub max_element_size: u16,
    /// Recommended element size for best throughput.
    pub rec_element_size: u16,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            link_state: LinkState::Unlinked,
            is_reliable: false,
            is_writable: false,
            max_element_size: 0,
            rec_element_size: 0,
        }
    }
}

/// State of a write action handle.
///
/// The `Ord` impl defines the roll-up rule for replicated writes: the
/// state of the whole is the maximum of the states of the parts, so a
/// single failed replica dominates any number of completed ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum WriteState {
    Queued,
    Sending,
    Done,
    Stopped,
    Timeout,
    Failed,
}

impl WriteState {
    /// Whether the action has reached a final state.
    pub fn is_terminal(self) -> bool {
        match self {
            WriteState::Queued | WriteState::Sending => false,
            _ => true,
        }
    }
}

/// Why a write was rejected synchronously.
#[derive(Debug, Fail, Copy, Clone, Eq, PartialEq)]
pub enum WriteError {
    #[fail(display = "write buffer is full")]
    BufferFull,
    /// The stream has no usable channel and is not buffering.
    #[fail(display = "stream is not writable")]
    Unwritable,
}
