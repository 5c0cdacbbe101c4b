use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, IntoBuf};

use coding::{BufExt, BufMutExt, Codec, UnexpectedEnd};
use ring::RingIndex;
use RequestId;

/// Reserved per-datagram overhead, in bytes: message tag, request id,
/// repeat count, three 16-bit offsets, flags, length prefix, and slack.
/// Covers the worst case of an `Init` flushed cumulatively with the first
/// `Data` record.
pub const RESERVED_OVERHEAD: usize = 1 + 4 + 2 + (3 * 2) + 1 + 2 + 2;

/// Session parameters proposed in `Init` and settled in `InitAck`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamInit {
    /// First offset of the session ring.
    pub offset: RingIndex,
    pub window_size: u16,
    pub max_payload_size: u16,
}

impl Codec for StreamInit {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(Self {
            offset: RingIndex(buf.get()?),
            window_size: buf.get()?,
            max_payload_size: buf.get()?,
        })
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.offset.0);
        buf.write(self.window_size);
        buf.write(self.max_payload_size);
    }
}

impl Codec for RequestId {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(RequestId(buf.get()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0);
    }
}

/// One payload record of a safe stream session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Data {
    /// 0 for the first transmission, incremented on each retransmit.
    pub repeat_count: u8,
    /// Set on every record sent before the first cumulative ack of the
    /// session arrived; tells the receiver to resynchronize if its
    /// session base differs.
    pub reset: bool,
    /// Position of the first payload byte relative to the session base.
    pub delta: u16,
    pub payload: Bytes,
}

const FLAG_RESET: u8 = 0x01;

/// A safe stream wire record. Several frames may share one datagram; in
/// particular `Init` may be immediately followed by the session's first
/// `Data`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Init {
        req_id: RequestId,
        repeat_count: u16,
        init: StreamInit,
    },
    InitAck {
        req_id: RequestId,
        init: StreamInit,
    },
    /// Cumulative: every byte with offset strictly before `offset` was
    /// delivered in order.
    Ack { offset: RingIndex },
    /// Please resend starting at `offset`.
    RepeatRequest { offset: RingIndex },
    Data(Data),
}

mod tag {
    pub const INIT: u8 = 0x01;
    pub const INIT_ACK: u8 = 0x02;
    pub const ACK: u8 = 0x03;
    pub const REPEAT_REQUEST: u8 = 0x04;
    pub const DATA: u8 = 0x05;
}

impl Frame {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Frame::Init {
                req_id,
                repeat_count,
                ref init,
            } => {
                buf.write(tag::INIT);
                buf.write(req_id);
                buf.write(repeat_count);
                init.encode(buf);
            }
            Frame::InitAck { req_id, ref init } => {
                buf.write(tag::INIT_ACK);
                buf.write(req_id);
                init.encode(buf);
            }
            Frame::Ack { offset } => {
                buf.write(tag::ACK);
                buf.write(offset.0);
            }
            Frame::RepeatRequest { offset } => {
                buf.write(tag::REPEAT_REQUEST);
                buf.write(offset.0);
            }
            Frame::Data(ref data) => {
                buf.write(tag::DATA);
                buf.write(data.repeat_count);
                buf.write(if data.reset { FLAG_RESET } else { 0 });
                buf.write(data.delta);
                debug_assert!(data.payload.len() <= u16::max_value() as usize);
                buf.write(data.payload.len() as u16);
                buf.put_slice(&data.payload);
            }
        }
    }
}

#[derive(Debug, Fail, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    #[fail(display = "frame truncated")]
    UnexpectedEnd,
    #[fail(display = "unknown frame type {:02x}", _0)]
    UnknownType(u8),
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::UnexpectedEnd
    }
}

/// Decodes the sequence of frames in one datagram.
pub struct Iter {
    bytes: io::Cursor<Bytes>,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Self {
            bytes: payload.into_buf(),
        }
    }

    fn take_payload(&mut self) -> Result<Bytes, Error> {
        let len = self.bytes.get::<u16>()? as usize;
        if self.bytes.remaining() < len {
            return Err(Error::UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        let payload = self.bytes.get_ref().slice(start, start + len);
        self.bytes.set_position((start + len) as u64);
        Ok(payload)
    }

    fn try_next(&mut self) -> Result<Frame, Error> {
        let ty = self.bytes.get::<u8>()?;
        Ok(match ty {
            tag::INIT => Frame::Init {
                req_id: self.bytes.get()?,
                repeat_count: self.bytes.get()?,
                init: self.bytes.get()?,
            },
            tag::INIT_ACK => Frame::InitAck {
                req_id: self.bytes.get()?,
                init: self.bytes.get()?,
            },
            tag::ACK => Frame::Ack {
                offset: RingIndex(self.bytes.get()?),
            },
            tag::REPEAT_REQUEST => Frame::RepeatRequest {
                offset: RingIndex(self.bytes.get()?),
            },
            tag::DATA => {
                let repeat_count = self.bytes.get()?;
                let flags = self.bytes.get::<u8>()?;
                let delta = self.bytes.get()?;
                Frame::Data(Data {
                    repeat_count,
                    reset: flags & FLAG_RESET != 0,
                    delta,
                    payload: self.take_payload()?,
                })
            }
            other => return Err(Error::UnknownType(other)),
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, Error>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                // The rest of the datagram cannot be trusted.
                self.bytes.set_position(self.bytes.get_ref().len() as u64);
                Some(Err(e))
            }
        }
    }
}

impl fmt::Debug for Iter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("frame::Iter(..)")
    }
}
