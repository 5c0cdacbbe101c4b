//! The reliable-stream protocol: turns a lossy, reorderable datagram link
//! into an ordered, at-most-once byte stream.
//!
//! A `SafeStream` performs no I/O. Feed inbound datagrams through
//! `handle_datagram`, completions of its own transmissions through
//! `transmit_result`, and timer expirations through `handle_timeout`;
//! drain outbound datagrams and timer updates through `poll_io` and
//! application events through `poll`.

use std::collections::VecDeque;

use bytes::Bytes;
use fnv::FnvHashMap;
use rand::{rngs::OsRng, Rng};
use slog::Logger;

use frame::{self, Frame, StreamInit, RESERVED_OVERHEAD};
use ring::RingIndex;
use stream::{AddResult, ChunkList, SendBuffer, SendState, SendingChunks};
use {RequestId, WriteError, WriteState, MAX_WINDOW_SIZE};

pub use stream::SendId;

/// Parameters governing one safe stream.
pub struct SafeStreamConfig {
    /// Maximum distance in bytes from the unacknowledged base to the last
    /// sent byte. Must be at most `MAX_WINDOW_SIZE` and should be at least
    /// four times the expected payload size.
    pub window_size: u16,
    /// Maximum transmissions of any chunk, including the first.
    pub max_repeat_count: u8,
    /// Upper bound on buffered unacknowledged user bytes; `write` fails
    /// synchronously beyond it.
    pub buffer_capacity: usize,
    /// Base retransmission timeout (μs), scaled by
    /// `max(1, rto_grow_factor * (repeat_count - 1))` per repeat.
    pub wait_ack_timeout: u64,
    /// How long the receiver may hold an acknowledgement to coalesce
    /// several of them (μs).
    pub send_ack_delay: u64,
    /// How long the receiver waits on a gap before requesting a repeat
    /// (μs). The sender's retransmit timer is the authoritative recovery
    /// mechanism; this only accelerates it.
    pub send_repeat_timeout: u64,
    /// Growth factor of the retransmission timeout.
    pub rto_grow_factor: f64,
}

impl Default for SafeStreamConfig {
    fn default() -> Self {
        Self {
            window_size: 16 * 1024,
            max_repeat_count: 8,
            buffer_capacity: 64 * 1024,
            wait_ack_timeout: 250 * 1000,
            send_ack_delay: 50 * 1000,
            send_repeat_timeout: 100 * 1000,
            rto_grow_factor: 1.5,
        }
    }
}

/// Session handshake state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    /// Nothing sent or received yet.
    Init,
    /// Our `Init` is out, waiting for the peer's `InitAck`.
    WaitInitAck,
    /// The peer's `Init` was accepted; our `InitAck` is due.
    InitAck,
    /// Like `InitAck`, but the peer proposed a window or payload size
    /// larger than ours; our `InitAck` will shrink them.
    InitAckReconfigure,
    Initiated,
}

/// Timers a driver must maintain for the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Timer {
    /// Re-send the oldest unacknowledged chunk, or the `Init` itself.
    Retransmit = 0,
    /// Flush a coalesced acknowledgement.
    AckDelay = 1,
    /// Ask the peer to repeat a missing span.
    RepeatRequest = 2,
}

const TIMER_COUNT: usize = 3;
const TIMERS: [Timer; TIMER_COUNT] = [Timer::Retransmit, Timer::AckDelay, Timer::RepeatRequest];

/// Identifies one outbound datagram, so the driver can report the fate of
/// the underlying write back to the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransmitId(pub u64);

/// I/O operations to be executed by the backend.
#[derive(Debug)]
pub enum Io {
    Transmit { id: TransmitId, datagram: Bytes },
    /// Start or reset a timer (absolute μs).
    TimerStart { timer: Timer, time: u64 },
    TimerStop { timer: Timer },
}

/// Events of interest to the stream's user.
#[derive(Debug)]
pub enum StreamEvent {
    /// In-order bytes, in the sender's original order.
    Received { data: Bytes },
    /// A sending action reached a terminal state.
    SendFinished { id: SendId, state: SendState },
}

struct InitState {
    /// Shared ring base of the session; picked by whichever side initiates.
    begin: RingIndex,
    send_req_id: RequestId,
    /// When our last `Init` went out (absolute μs).
    sent_init: u64,
    sent_repeat_count: u16,
    recv_req_id: Option<RequestId>,
    recv_repeat_count: u16,
}

pub struct SafeStream {
    log: Logger,
    config: SafeStreamConfig,
    state: SessionState,
    init: InitState,

    // send half
    /// Unacknowledged base of the send window.
    send_begin: RingIndex,
    last_sent: RingIndex,
    last_added: RingIndex,
    /// Cleared by the first cumulative ack; until then every data record
    /// carries the reset flag.
    acked_once: bool,
    /// Effective payload budget per datagram, after protocol overhead.
    max_payload: usize,
    chunks: SendingChunks,
    buffer: SendBuffer,
    next_send_id: u64,

    // receive half
    session_start: Option<RingIndex>,
    last_emitted: RingIndex,
    recv_chunks: ChunkList,
    ack_required: bool,
    ack_deadline: Option<u64>,
    repeat_deadline: Option<u64>,

    io: VecDeque<Io>,
    events: VecDeque<StreamEvent>,
    /// Right edge of the data slice carried by each in-flight transmit.
    in_flight: FnvHashMap<u64, RingIndex>,
    next_transmit_id: u64,
    timers: [Option<u64>; TIMER_COUNT],
}

impl SafeStream {
    pub fn new(log: Logger, config: SafeStreamConfig) -> Self {
        assert!(config.window_size <= MAX_WINDOW_SIZE);
        assert!(config.buffer_capacity >= config.window_size as usize);
        let mut rng = OsRng::new().unwrap();
        let begin = RingIndex(rng.gen());
        let send_req_id = RequestId(rng.gen_range(1, u32::max_value() / 2));
        trace!(log, "new stream"; "begin" => begin.0, "req_id" => send_req_id.0);
        Self {
            log,
            config,
            state: SessionState::Init,
            init: InitState {
                begin,
                send_req_id,
                sent_init: 0,
                sent_repeat_count: 0,
                recv_req_id: None,
                recv_repeat_count: 0,
            },
            send_begin: begin,
            last_sent: begin,
            last_added: begin,
            acked_once: false,
            max_payload: 0,
            chunks: SendingChunks::new(),
            buffer: SendBuffer::new(),
            next_send_id: 0,
            session_start: None,
            last_emitted: begin,
            recv_chunks: ChunkList::new(),
            ack_required: false,
            ack_deadline: None,
            repeat_deadline: None,
            io: VecDeque::new(),
            events: VecDeque::new(),
            in_flight: FnvHashMap::default(),
            next_transmit_id: 0,
            timers: [None; TIMER_COUNT],
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    /// Current send window, possibly shrunk by the handshake.
    pub fn window_size(&self) -> u16 {
        self.config.window_size
    }

    /// Effective payload budget per datagram; 0 until the transport's
    /// packet size is known.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Total unacknowledged user bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// State of a pending sending action; `None` once it reached a
    /// terminal state (reported through `poll`).
    pub fn send_state(&self, id: SendId) -> Option<SendState> {
        self.buffer.state(id)
    }

    /// Update the transport's datagram size; the effective payload budget
    /// is what remains after the reserved protocol overhead.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_payload = if size < RESERVED_OVERHEAD {
            0
        } else {
            (size - RESERVED_OVERHEAD).min(u16::max_value() as usize)
        };
        debug!(self.log, "max payload updated"; "payload" => self.max_payload);
    }

    /// Enqueue bytes for reliable delivery.
    ///
    /// The returned handle reaches `Done`, `Stopped`, or `Failed` through
    /// `StreamEvent::SendFinished`.
    pub fn write(&mut self, data: Bytes) -> Result<SendId, WriteError> {
        if self.buffer.len() + data.len() > self.config.buffer_capacity {
            debug!(self.log, "send buffer overflow"; "buffered" => self.buffer.len(), "write" => data.len());
            return Err(WriteError::BufferFull);
        }
        let id = SendId(self.next_send_id);
        self.next_send_id += 1;
        if data.is_empty() {
            self.events
                .push_back(StreamEvent::SendFinished { id, state: SendState::Done });
            return Ok(id);
        }
        trace!(self.log, "write"; "id" => id.0, "offset" => self.last_added.0, "len" => data.len());
        let len = data.len() as u16;
        self.buffer.push(id, self.last_added, data);
        self.last_added = self.last_added + len;
        Ok(id)
    }

    /// Best-effort cancellation: removes the action if no byte of it was
    /// sent yet, otherwise does nothing.
    pub fn stop_send(&mut self, id: SendId) {
        match self.buffer.state(id) {
            Some(SendState::Waiting) => {}
            other => {
                debug!(self.log, "cannot stop sending action"; "id" => id.0, "state" => ?other);
                return;
            }
        }
        let removed = self.buffer.stop(id).unwrap();
        self.last_added = RingIndex(self.last_added.0.wrapping_sub(removed as u16));
        self.events
            .push_back(StreamEvent::SendFinished { id, state: SendState::Stopped });
    }

    /// Process one inbound datagram.
    pub fn handle_datagram(&mut self, now: u64, datagram: Bytes) {
        for frame in frame::Iter::new(datagram) {
            match frame {
                Ok(Frame::Init {
                    req_id,
                    repeat_count,
                    init,
                }) => self.on_init(req_id, repeat_count, init),
                Ok(Frame::InitAck { req_id, init }) => self.on_init_ack(req_id, init),
                Ok(Frame::Ack { offset }) => self.on_ack(offset),
                Ok(Frame::RepeatRequest { offset }) => self.on_repeat_request(offset),
                Ok(Frame::Data(data)) => self.on_data(now, data),
                Err(e) => {
                    trace!(self.log, "malformed datagram"; "reason" => %e);
                    return;
                }
            }
        }
    }

    /// Report the fate of a previously polled `Io::Transmit`. Only
    /// terminal states matter; `Done` is the common case.
    pub fn transmit_result(&mut self, id: TransmitId, state: WriteState) {
        if !state.is_terminal() {
            return;
        }
        let right = match self.in_flight.remove(&id.0) {
            Some(x) => x,
            None => return,
        };
        match state {
            WriteState::Done => {}
            _ => {
                warn!(self.log, "transmit failed"; "id" => id.0, "state" => ?state);
                self.reject_through(right);
            }
        }
    }

    pub fn handle_timeout(&mut self, now: u64, timer: Timer) {
        trace!(self.log, "timeout"; "timer" => ?timer);
        self.timers[timer as usize] = None;
        self.flush(now);
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        if self.io.is_empty() {
            self.flush(now);
        }
        self.io.pop_front()
    }

    //
    // Handshake
    //

    fn on_init(&mut self, req_id: RequestId, repeat_count: u16, init: StreamInit) {
        debug!(self.log, "got init"; "req_id" => req_id.0, "offset" => init.offset.0,
               "window" => init.window_size, "max_payload" => init.max_payload_size);
        if self.init.recv_req_id == Some(req_id) {
            debug!(self.log, "duplicate init");
            if self.init.recv_repeat_count < repeat_count {
                self.init.recv_repeat_count = repeat_count;
                if self.state == SessionState::Initiated {
                    // our ack was probably lost, re-emit it
                    self.state = SessionState::InitAck;
                }
            }
            return;
        }

        // a zero payload proposal means the peer does not know its
        // transport size yet; never adopt it
        if self.config.window_size < init.window_size
            || init.max_payload_size == 0
            || self.max_payload < init.max_payload_size as usize
        {
            // peer proposed more than we can take; our ack will shrink it
            self.state = SessionState::InitAckReconfigure;
        } else {
            self.state = SessionState::InitAck;
            self.config.window_size = init.window_size;
            self.max_payload = init.max_payload_size as usize;
        }

        self.init.recv_req_id = Some(req_id);
        self.init.recv_repeat_count = repeat_count;
        self.init.begin = init.offset;
        self.reset_session(init.offset);
    }

    fn on_init_ack(&mut self, req_id: RequestId, init: StreamInit) {
        if self.state != SessionState::WaitInitAck {
            debug!(self.log, "ignoring init ack"; "state" => ?self.state);
            return;
        }
        if req_id != self.init.send_req_id {
            debug!(self.log, "stale init ack"; "req_id" => req_id.0);
            return;
        }
        debug!(self.log, "got init ack"; "window" => init.window_size,
               "max_payload" => init.max_payload_size);
        // the settled values are the element-wise minimums
        self.config.window_size = self.config.window_size.min(init.window_size);
        self.max_payload = self.max_payload.min(init.max_payload_size as usize);
        self.state = SessionState::Initiated;
    }

    /// Both sides of a session share the ring base picked by the
    /// initiator.
    fn reset_session(&mut self, base: RingIndex) {
        self.acked_once = false;
        self.send_begin = base;
        self.last_sent = base;
        self.last_added = self.buffer.rebase(base);
        self.chunks.clear();
        // results of transmits from the previous session no longer map to
        // anything
        self.in_flight.clear();

        self.session_start = Some(base);
        self.last_emitted = base;
        self.recv_chunks.clear();
        self.ack_required = false;
        self.ack_deadline = None;
        self.repeat_deadline = None;
    }

    //
    // Send half
    //

    fn on_ack(&mut self, offset: RingIndex) {
        trace!(self.log, "got ack"; "offset" => offset.0);
        if self.send_begin.is_after(offset) || self.last_added.is_before(offset) {
            return;
        }
        self.acked_once = true;
        self.chunks.remove_up_to(offset);
        for id in self.buffer.acknowledge(offset) {
            self.events
                .push_back(StreamEvent::SendFinished { id, state: SendState::Done });
        }
        self.send_begin = offset;
        if self.last_sent.is_before(self.send_begin) {
            self.last_sent = self.send_begin;
        }
        if self.state == SessionState::WaitInitAck {
            debug!(self.log, "got ack in init state");
            self.state = SessionState::Initiated;
        }
    }

    fn on_repeat_request(&mut self, offset: RingIndex) {
        if self.last_sent.is_before(offset) {
            debug!(self.log, "repeat request for unsent offset"; "offset" => offset.0);
            return;
        }
        if self.send_begin.is_after(offset) {
            debug!(self.log, "repeat request for acknowledged offset"; "offset" => offset.0);
            return;
        }
        debug!(self.log, "rewinding for repeat request"; "offset" => offset.0);
        self.last_sent = offset;
    }

    fn effective_timeout(&self, repeat_count: u8) -> u64 {
        let factor = (self.config.rto_grow_factor * (repeat_count.saturating_sub(1)) as f64).max(1.0);
        (self.config.wait_ack_timeout as f64 * factor) as u64
    }

    /// Fail every pending action through `right` and advance the window
    /// base past it; the stream keeps operating for subsequent bytes.
    fn reject_through(&mut self, right: RingIndex) {
        let (failed, next) = self.buffer.reject(right);
        for id in failed {
            self.events
                .push_back(StreamEvent::SendFinished { id, state: SendState::Failed });
        }
        let new_begin = next.unwrap_or(self.last_added);
        self.send_begin = new_begin;
        if self.last_sent.is_before(new_begin) {
            self.last_sent = new_begin;
        }
        self.chunks.remove_up_to(new_begin);
    }

    fn init_frame(&mut self, now: u64) -> Frame {
        self.init.send_req_id = RequestId(self.init.send_req_id.0.wrapping_add(1));
        self.init.sent_init = now;
        let repeat_count = self.init.sent_repeat_count;
        self.init.sent_repeat_count += 1;
        self.state = SessionState::WaitInitAck;
        debug!(self.log, "send init"; "req_id" => self.init.send_req_id.0,
               "offset" => self.init.begin.0, "window" => self.config.window_size,
               "max_payload" => self.max_payload, "repeat" => repeat_count);
        Frame::Init {
            req_id: self.init.send_req_id,
            repeat_count,
            init: StreamInit {
                offset: self.init.begin,
                window_size: self.config.window_size,
                max_payload_size: self.max_payload as u16,
            },
        }
    }

    fn send_init(&mut self, now: u64) {
        let frame = self.init_frame(now);
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        self.transmit(buf, None);
    }

    /// Handshake retries exhausted: fail everything pending and return to
    /// the initial state so a later write restarts the handshake.
    fn fail_handshake(&mut self) {
        error!(self.log, "init repeat count exceeded");
        let upto = self.last_added;
        let (failed, _) = self.buffer.reject(upto);
        for id in failed {
            self.events
                .push_back(StreamEvent::SendFinished { id, state: SendState::Failed });
        }
        self.chunks.clear();
        self.send_begin = self.last_added;
        self.last_sent = self.last_added;
        self.state = SessionState::Init;
        self.init.sent_repeat_count = 0;
    }

    fn check_handshake(&mut self, now: u64) {
        match self.state {
            SessionState::InitAck | SessionState::InitAckReconfigure => {
                if self.max_payload == 0 {
                    // transport size still unknown; hold the ack
                    return;
                }
                let req_id = match self.init.recv_req_id {
                    Some(x) => x,
                    None => return,
                };
                debug!(self.log, "send init ack"; "req_id" => req_id.0,
                       "offset" => self.init.begin.0, "window" => self.config.window_size,
                       "max_payload" => self.max_payload);
                let mut buf = Vec::new();
                Frame::InitAck {
                    req_id,
                    init: StreamInit {
                        offset: self.init.begin,
                        window_size: self.config.window_size,
                        max_payload_size: self.max_payload as u16,
                    },
                }.encode(&mut buf);
                self.transmit(buf, None);
                self.state = SessionState::Initiated;
            }
            SessionState::WaitInitAck => {
                if self.init.sent_init + self.config.wait_ack_timeout <= now {
                    debug!(self.log, "wait init ack timeout");
                    if self.init.sent_repeat_count > u16::from(self.config.max_repeat_count) {
                        self.fail_handshake();
                    } else {
                        self.send_init(now);
                    }
                }
            }
            _ => {}
        }
    }

    fn drive_send(&mut self, now: u64) {
        // the oldest in-flight chunk drives retransmission
        if let Some(front) = self.chunks.front() {
            let deadline = front.send_time + self.effective_timeout(front.repeat_count);
            if deadline <= now && self.last_sent.is_after(front.range.left) {
                debug!(self.log, "wait ack timeout"; "offset" => front.range.left.0,
                       "repeat" => front.repeat_count);
                self.last_sent = front.range.left;
            }
        }
        while self.try_send_chunk(now) {}
    }

    fn try_send_chunk(&mut self, now: u64) -> bool {
        if self.max_payload == 0 {
            return false;
        }
        let chunk = match self.buffer.get_slice(self.last_sent, self.max_payload) {
            Some(x) => x,
            None => return false,
        };
        let delta = self.send_begin.distance(chunk.offset);
        let delta_end = delta + chunk.data.len();
        if delta_end > self.config.window_size as usize {
            trace!(self.log, "window exhausted"; "begin" => self.send_begin.0,
                   "last_sent" => self.last_sent.0, "delta_end" => delta_end);
            return false;
        }
        self.last_sent = self.send_begin + delta_end as u16;
        let right = chunk.offset + (chunk.data.len() - 1) as u16;

        let repeat_count = {
            let sending = self.chunks.register(chunk.offset, right, now);
            let count = sending.repeat_count;
            sending.repeat_count += 1;
            count
        };
        if repeat_count >= self.config.max_repeat_count {
            error!(self.log, "repeat count exceeded"; "offset" => chunk.offset.0);
            self.reject_through(right);
            return true;
        }

        trace!(self.log, "send chunk"; "offset" => chunk.offset.0, "len" => chunk.data.len(),
               "delta" => delta, "repeat" => repeat_count, "reset" => !self.acked_once);
        let mut buf = Vec::with_capacity(RESERVED_OVERHEAD + chunk.data.len());
        if self.state == SessionState::Init {
            // cumulative init: first data goes out in the same flush
            let init = self.init_frame(now);
            init.encode(&mut buf);
        }
        Frame::Data(frame::Data {
            repeat_count,
            reset: !self.acked_once,
            delta: delta as u16,
            payload: chunk.data.into(),
        }).encode(&mut buf);
        self.transmit(buf, Some(right));
        true
    }

    //
    // Receive half
    //

    fn on_data(&mut self, now: u64, data: frame::Data) {
        match self.state {
            SessionState::Init => {
                warn!(self.log, "data received in uninitiated state");
                self.send_init(now);
                return;
            }
            SessionState::WaitInitAck | SessionState::InitAckReconfigure => {
                warn!(self.log, "data received while handshake is unsettled");
                return;
            }
            SessionState::InitAck | SessionState::Initiated => {}
        }

        let base = self.init.begin;
        if self.session_start.is_none() {
            debug!(self.log, "init receiver"; "base" => base.0);
            self.session_start = Some(base);
            self.last_emitted = base;
        } else if data.reset && self.session_start != Some(base) {
            debug!(self.log, "reset receiver"; "base" => base.0);
            self.session_start = Some(base);
            self.last_emitted = base;
            self.recv_chunks.clear();
            self.ack_required = false;
            self.ack_deadline = None;
            self.repeat_deadline = None;
        }

        let received = base + data.delta;
        trace!(self.log, "data received"; "offset" => received.0, "len" => data.payload.len(),
               "repeat" => data.repeat_count, "reset" => data.reset);
        match self
            .recv_chunks
            .add(received, data.repeat_count, data.payload, self.last_emitted)
        {
            AddResult::Duplicate => {
                debug!(self.log, "chunk duplicated with a received one");
            }
            // an already-confirmed chunk means our ack was lost; re-ack
            AddResult::Confirmed | AddResult::Added => {
                self.ack_required = true;
            }
        }
        self.check_delivery();
    }

    fn check_delivery(&mut self) {
        if self.session_start.is_none() {
            return;
        }
        if let Some((data, next)) = self.recv_chunks.pop_contiguous(self.last_emitted) {
            debug!(self.log, "emit received data"; "from" => self.last_emitted.0, "to" => next.0);
            self.last_emitted = next;
            self.ack_required = true;
            self.events.push_back(StreamEvent::Received { data });
        }
    }

    fn check_ack(&mut self, now: u64) {
        if !self.ack_required {
            self.ack_deadline = None;
            return;
        }
        let deadline = *self
            .ack_deadline
            .get_or_insert(now + self.config.send_ack_delay);
        if deadline > now {
            return;
        }
        self.ack_deadline = None;
        self.ack_required = false;
        debug!(self.log, "send ack"; "offset" => self.last_emitted.0);
        let mut buf = Vec::new();
        Frame::Ack {
            offset: self.last_emitted,
        }.encode(&mut buf);
        self.transmit(buf, None);
    }

    fn check_missing(&mut self, now: u64) {
        if self.recv_chunks.is_empty() {
            self.repeat_deadline = None;
            return;
        }
        let deadline = *self
            .repeat_deadline
            .get_or_insert(now + self.config.send_repeat_timeout);
        if deadline > now {
            return;
        }
        self.repeat_deadline = Some(now + self.config.send_repeat_timeout);
        let missing = match self.recv_chunks.first_gap(self.last_emitted) {
            Some(x) => x,
            None => return,
        };
        debug!(self.log, "send repeat request"; "offset" => missing.0,
               "last_emitted" => self.last_emitted.0);
        let mut buf = Vec::new();
        Frame::RepeatRequest { offset: missing }.encode(&mut buf);
        self.transmit(buf, None);
    }

    //
    // Plumbing
    //

    fn transmit(&mut self, buf: Vec<u8>, data_right: Option<RingIndex>) {
        let id = TransmitId(self.next_transmit_id);
        self.next_transmit_id += 1;
        if let Some(right) = data_right {
            self.in_flight.insert(id.0, right);
        }
        self.io.push_back(Io::Transmit {
            id,
            datagram: buf.into(),
        });
    }

    fn retransmit_target(&self) -> Option<u64> {
        if self.state == SessionState::WaitInitAck {
            return Some(self.init.sent_init + self.config.wait_ack_timeout);
        }
        self.chunks
            .front()
            .map(|chunk| chunk.send_time + self.effective_timeout(chunk.repeat_count))
    }

    fn sync_timers(&mut self) {
        let desired = [self.retransmit_target(), self.ack_deadline, self.repeat_deadline];
        for (i, &timer) in TIMERS.iter().enumerate() {
            if desired[i] == self.timers[i] {
                continue;
            }
            match desired[i] {
                Some(time) => self.io.push_back(Io::TimerStart { timer, time }),
                None => self.io.push_back(Io::TimerStop { timer }),
            }
            self.timers[i] = desired[i];
        }
    }

    fn flush(&mut self, now: u64) {
        self.check_handshake(now);
        self.check_delivery();
        self.check_ack(now);
        self.check_missing(now);
        self.drive_send(now);
        self.sync_timers();
    }
}
