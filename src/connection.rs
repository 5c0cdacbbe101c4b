//! One connection to one server: opens the server's channels one at a
//! time in preference order, buffers writes until a channel is linked,
//! and distinguishes channels that merely refused to connect (replaced
//! transparently) from channels that failed after carrying data (a server
//! fault).

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use fnv::FnvHashMap;
use slog::Logger;

use tasks::TaskQueue;
use transport::{Channel, PacketId, Reliability, Server, Transport, TransportEvent,
                TransportFactory};
use {LinkState, ServerId, StreamInfo, WriteError, WriteState};

/// Buffered writes held while no channel is linked; writes beyond this
/// fail synchronously.
pub const WRITE_BUFFER_CAPACITY: usize = 100;

/// Handle to one `ServerConnection::write`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WriteId(pub(crate) u64);

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Events of interest to the connection's owner.
#[derive(Debug)]
pub enum ServerEvent {
    /// `stream_info` changed.
    StreamUpdate,
    /// A different channel was selected.
    ChannelChanged,
    /// Inbound bytes from the linked channel.
    Data(Bytes),
    /// A write reached a terminal state.
    WriteFinished { id: WriteId, state: WriteState },
    /// The connection is unusable for this session; the owner should
    /// quarantine the server.
    ServerError,
}

struct ChannelEntry {
    channel: Channel,
    failed: bool,
}

/// Follow-up work deferred out of the event-draining loop.
enum ServerTask {
    /// Declare the channel that was current at enqueue time bad; stale
    /// once another channel was selected in the meantime.
    ChannelError { channel: Option<usize> },
}

struct BufferedWrite {
    id: WriteId,
    data: Bytes,
}

pub struct ServerConnection {
    log: Logger,
    server_id: ServerId,
    /// Channels in preference order: faster class first, then lower build
    /// timeout, then lower ping.
    channels: Vec<ChannelEntry>,
    current: Option<usize>,
    transport: Option<Box<dyn Transport>>,
    connect_deadline: Option<u64>,
    /// Whether any payload byte was received through the current channel
    /// set; a link error afterwards is a server fault, not a channel
    /// fault.
    full_connected: bool,
    active: bool,
    stream_info: StreamInfo,
    buffering: bool,
    buffer: VecDeque<BufferedWrite>,
    /// Transport packet id of each in-flight downstream write.
    in_flight: FnvHashMap<u64, WriteId>,
    deferred: TaskQueue<ServerTask>,
    events: VecDeque<ServerEvent>,
    next_write_id: u64,
}

impl ServerConnection {
    pub fn new(log: Logger, server: Server) -> Self {
        let mut channels: Vec<_> = server
            .channels
            .into_iter()
            .map(|channel| ChannelEntry {
                channel,
                failed: false,
            })
            .collect();
        channels.sort_by(|a, b| {
            let pa = &a.channel.properties;
            let pb = &b.channel.properties;
            pb.connection_class
                .cmp(&pa.connection_class)
                .then(pa.build_timeout.cmp(&pb.build_timeout))
                .then(pa.response_timeout.cmp(&pb.response_timeout))
        });
        Self {
            log,
            server_id: server.server_id,
            channels,
            current: None,
            transport: None,
            connect_deadline: None,
            full_connected: false,
            active: false,
            stream_info: StreamInfo::default(),
            buffering: true,
            buffer: VecDeque::new(),
            in_flight: FnvHashMap::default(),
            deferred: TaskQueue::new(),
            events: VecDeque::new(),
            next_write_id: 0,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.stream_info
    }

    pub fn current_channel(&self) -> Option<&Channel> {
        self.current.map(move |i| &self.channels[i].channel)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start using this server. Returns whether a new connection attempt
    /// actually began; calling on an already active connection is a no-op.
    pub fn begin_connection(&mut self, now: u64, factory: &mut dyn TransportFactory) -> bool {
        if self.active {
            return false;
        }
        debug!(self.log, "begin connection");
        self.active = true;
        self.full_connected = false;
        for entry in &mut self.channels {
            entry.failed = false;
        }
        self.select_channel(now, factory);
        true
    }

    /// Stop using this server. Buffered and in-flight writes fail; the
    /// channel set resets for a later `begin_connection`.
    pub fn end_connection(&mut self) {
        if !self.active {
            return;
        }
        debug!(self.log, "end connection");
        self.active = false;
        self.transport = None;
        self.current = None;
        self.connect_deadline = None;
        self.buffering = true;
        self.deferred.steal();
        self.drop_pending_writes();
        self.set_stream_info(StreamInfo::default());
    }

    /// The owner declares the current channel bad.
    pub fn restream(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        if !self.active {
            return;
        }
        debug!(self.log, "restream");
        self.channel_error(now, factory);
    }

    /// Write bytes to the server, buffering while no channel is linked.
    pub fn write(&mut self, data: Bytes, now: u64) -> Result<WriteId, WriteError> {
        if !self.active || self.stream_info.link_state == LinkState::LinkError {
            return Err(WriteError::Unwritable);
        }
        let id = WriteId(self.next_write_id);
        self.next_write_id += 1;
        if self.buffering {
            if self.buffer.len() >= WRITE_BUFFER_CAPACITY {
                debug!(self.log, "write buffer overflow");
                return Err(WriteError::BufferFull);
            }
            trace!(self.log, "write buffered"; "id" => id.0, "len" => data.len());
            self.buffer.push_back(BufferedWrite { id, data });
        } else {
            self.write_through(id, data, now);
        }
        Ok(id)
    }

    /// Best-effort cancellation: a still-buffered write is removed; an
    /// in-flight one is forwarded to the transport.
    pub fn stop_write(&mut self, id: WriteId) {
        if let Some(pos) = self.buffer.iter().position(|w| w.id == id) {
            self.buffer.remove(pos);
            self.events.push_back(ServerEvent::WriteFinished {
                id,
                state: WriteState::Stopped,
            });
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Some((&packet, _)) = self.in_flight.iter().find(|&(_, &w)| w == id) {
                transport.stop_send(PacketId(packet));
            }
        }
    }

    /// Process transport progress. Call whenever the transport may have
    /// produced events.
    pub fn drive(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        for task in self.deferred.steal() {
            match task {
                ServerTask::ChannelError { channel } => {
                    if channel == self.current {
                        self.channel_error(now, factory);
                    }
                }
            }
        }
        loop {
            let event = match self.transport.as_mut().and_then(|t| t.poll()) {
                Some(x) => x,
                None => return,
            };
            match event {
                TransportEvent::Connected => self.channel_linked(now),
                TransportEvent::ConnectionError => self.channel_error(now, factory),
                TransportEvent::Received(data) => {
                    // the connection to the server is fully open
                    self.full_connected = true;
                    self.events.push_back(ServerEvent::Data(data));
                }
                TransportEvent::SendFinished { id, state } => {
                    let write = match self.in_flight.remove(&id.0) {
                        Some(x) => x,
                        None => continue,
                    };
                    self.events
                        .push_back(ServerEvent::WriteFinished { id: write, state });
                    match state {
                        WriteState::Failed | WriteState::Timeout => {
                            warn!(self.log, "downstream write failed"; "state" => ?state);
                            // finish draining the transport's events before
                            // tearing it down
                            self.deferred.enqueue(ServerTask::ChannelError {
                                channel: self.current,
                            });
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Next deadline the driver must honor, if any.
    pub fn poll_timeout(&self) -> Option<u64> {
        self.connect_deadline
    }

    pub fn handle_timeout(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        if let Some(deadline) = self.connect_deadline {
            if deadline <= now {
                warn!(self.log, "connect timeout");
                self.connect_deadline = None;
                self.channel_error(now, factory);
            }
        }
    }

    pub fn poll(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    fn set_stream_info(&mut self, info: StreamInfo) {
        if info != self.stream_info {
            self.stream_info = info;
            self.events.push_back(ServerEvent::StreamUpdate);
        }
    }

    fn select_channel(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        let top = self.channels.iter().position(|entry| !entry.failed);
        let index = match top {
            Some(x) => x,
            None => {
                self.server_error();
                return;
            }
        };
        self.current = Some(index);
        let channel = self.channels[index].channel;
        debug!(self.log, "channel selected"; "channel" => channel.channel_id);

        self.set_stream_info(StreamInfo {
            link_state: LinkState::Unlinked,
            is_reliable: channel.properties.reliability == Reliability::Reliable,
            is_writable: true,
            max_element_size: channel.properties.max_packet_size,
            rec_element_size: channel.properties.rec_packet_size,
        });

        let mut transport = factory.build(self.server_id, &channel, now);
        transport.connect(now);
        self.transport = Some(transport);
        self.connect_deadline = Some(now + channel.properties.build_timeout);
        self.events.push_back(ServerEvent::ChannelChanged);
    }

    fn channel_linked(&mut self, now: u64) {
        debug!(self.log, "channel linked");
        self.connect_deadline = None;
        let mut info = self.stream_info;
        info.link_state = LinkState::Linked;
        self.set_stream_info(info);
        self.buffering = false;
        while let Some(write) = self.buffer.pop_front() {
            self.write_through(write.id, write.data, now);
        }
    }

    fn channel_error(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        error!(self.log, "channel error");
        self.buffering = true;
        self.transport = None;
        self.connect_deadline = None;
        if let Some(index) = self.current.take() {
            self.channels[index].failed = true;
        }
        // a channel that failed after admitting data indicates a server
        // fault, not a channel fault
        if self.full_connected {
            self.server_error();
        } else {
            self.select_channel(now, factory);
        }
    }

    fn server_error(&mut self) {
        error!(self.log, "server error");
        self.buffering = true;
        self.transport = None;
        self.current = None;
        self.connect_deadline = None;
        self.drop_pending_writes();
        let mut info = self.stream_info;
        info.link_state = LinkState::LinkError;
        info.is_writable = false;
        self.set_stream_info(info);
        self.events.push_back(ServerEvent::ServerError);
    }

    fn drop_pending_writes(&mut self) {
        while let Some(write) = self.buffer.pop_front() {
            self.events.push_back(ServerEvent::WriteFinished {
                id: write.id,
                state: WriteState::Failed,
            });
        }
        let pending: Vec<WriteId> = self.in_flight.drain().map(|(_, id)| id).collect();
        for id in pending {
            self.events.push_back(ServerEvent::WriteFinished {
                id,
                state: WriteState::Failed,
            });
        }
    }

    fn write_through(&mut self, id: WriteId, data: Bytes, now: u64) {
        let transport = match self.transport.as_mut() {
            Some(x) => x,
            None => {
                self.events.push_back(ServerEvent::WriteFinished {
                    id,
                    state: WriteState::Failed,
                });
                return;
            }
        };
        trace!(self.log, "write through"; "id" => id.0, "len" => data.len());
        let packet = transport.send(data, now);
        self.in_flight.insert(packet.0, id);
    }
}
