//! The abstract transport consumed by a server connection, and the
//! descriptors of servers and their channels.
//!
//! Like everything else in this crate a transport is driven from the
//! outside: `connect` and `send` start work, and the transport reports
//! progress through `poll`. Concrete UDP/TCP/cellular bindings live with
//! the application.

use bytes::Bytes;

use {ServerId, WriteState};

/// Link classification of a channel, fastest last so that the natural
/// ordering prefers faster classes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ConnectionClass {
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Static properties of one channel's transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportProperties {
    pub connection_class: ConnectionClass,
    pub reliability: Reliability,
    pub max_packet_size: u16,
    pub rec_packet_size: u16,
    /// Expected time to build the transport (μs); also the connect
    /// timeout applied by the server connection.
    pub build_timeout: u64,
    /// Expected ping round trip (μs).
    pub response_timeout: u64,
}

/// One concrete way of reaching a server. The parameterization that makes
/// the channel concrete (protocol, endpoint address) is owned by the
/// application's `TransportFactory` and keyed by `channel_id`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Channel {
    pub channel_id: u32,
    pub properties: TransportProperties,
}

/// A server of the overlay cloud, reachable through an ordered list of
/// channels.
#[derive(Debug, Clone)]
pub struct Server {
    pub server_id: ServerId,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub max_packet_size: u16,
    pub state: ConnectionState,
}

/// Handle to one `Transport::send`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PacketId(pub u64);

#[derive(Debug)]
pub enum TransportEvent {
    /// `connect` succeeded; the transport is ready to carry packets.
    Connected,
    /// `connect` failed or the link went down.
    ConnectionError,
    /// An inbound packet.
    Received(Bytes),
    /// A previously issued `send` reached a terminal state.
    SendFinished { id: PacketId, state: WriteState },
}

/// Downstream contract of a server connection.
pub trait Transport {
    fn connection_info(&self) -> ConnectionInfo;
    /// Idempotent; resolves through `TransportEvent::Connected` or
    /// `TransportEvent::ConnectionError`.
    fn connect(&mut self, now: u64);
    fn send(&mut self, data: Bytes, now: u64) -> PacketId;
    /// Best-effort cancellation of an in-flight packet.
    fn stop_send(&mut self, id: PacketId);
    fn poll(&mut self) -> Option<TransportEvent>;
}

/// Builds a transport for one channel of one server.
pub trait TransportFactory {
    fn build(&mut self, server: ServerId, channel: &Channel, now: u64) -> Box<dyn Transport>;
}
