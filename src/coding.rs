use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};

/// A fixed-layout value that can be read from and written to a buffer.
///
/// All multi-byte integers on the wire are little-endian.
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

#[derive(Debug, Fail, Copy, Clone, Eq, PartialEq)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; 2];
        buf.copy_to_slice(&mut bytes);
        Ok(LittleEndian::read_u16(&bytes))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut bytes = [0; 2];
        LittleEndian::write_u16(&mut bytes, *self);
        buf.put_slice(&bytes);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; 4];
        buf.copy_to_slice(&mut bytes);
        Ok(LittleEndian::read_u32(&bytes))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut bytes = [0; 4];
        LittleEndian::write_u32(&mut bytes, *self);
        buf.put_slice(&bytes);
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T, UnexpectedEnd>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T, UnexpectedEnd> {
        T::decode(self)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }
}
