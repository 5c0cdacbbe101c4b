//! Data structures backing the two halves of a safe stream: the FIFO of
//! user sending actions, the registry of in-flight chunks on the send
//! side, and the out-of-order assembly list on the receive side.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use ring::{OffsetRange, RingIndex};

/// Handle to one `SafeStream::write` call.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SendId(pub(crate) u64);

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Progress of one sending action through the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    /// No byte of the action has been sliced into a datagram yet; the
    /// action can still be stopped.
    Waiting,
    /// At least one byte is in flight.
    Sending,
    /// Every byte was cumulatively acknowledged.
    Done,
    /// Removed from the buffer before any byte was sent.
    Stopped,
    /// Rejected: the retransmit budget was exhausted or the transport
    /// reported a write error.
    Failed,
}

/// One queued `write`, owning its payload and the cursor of the prefix
/// already acknowledged by the peer.
#[derive(Debug)]
pub struct SendingData {
    pub id: SendId,
    /// Ring offset of the byte at cursor `begin`.
    pub offset: RingIndex,
    pub data: Bytes,
    /// Acknowledged prefix; only `data[begin..]` is still owed.
    pub begin: usize,
    pub state: SendState,
}

impl SendingData {
    pub fn len(&self) -> usize {
        self.data.len() - self.begin
    }

    /// Range of the unacknowledged bytes. Undefined for an empty action;
    /// empty actions never stay in the buffer.
    pub fn offset_range(&self) -> OffsetRange {
        debug_assert!(self.len() > 0);
        OffsetRange::new(self.offset, self.offset + (self.len() - 1) as u16)
    }
}

/// A slice of contiguous buffered bytes, ready to become one `Data`
/// record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataChunk {
    pub offset: RingIndex,
    pub data: Vec<u8>,
}

/// FIFO of sending actions. The concatenation of `data[begin..]` across
/// all actions is exactly the ring of unacknowledged user bytes, and
/// `len()` reports its size.
#[derive(Debug, Default)]
pub struct SendBuffer {
    actions: VecDeque<SendingData>,
    len: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total unacknowledged bytes buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn push(&mut self, id: SendId, offset: RingIndex, data: Bytes) {
        self.len += data.len();
        self.actions.push_back(SendingData {
            id,
            offset,
            data,
            begin: 0,
            state: SendState::Waiting,
        });
    }

    pub fn state(&self, id: SendId) -> Option<SendState> {
        self.actions
            .iter()
            .find(|action| action.id == id)
            .map(|action| action.state)
    }

    /// Collect up to `max_size` contiguous bytes starting at `from` (or at
    /// the first buffered byte after it). Every action contributing bytes
    /// moves to `Sending`.
    pub fn get_slice(&mut self, from: RingIndex, max_size: usize) -> Option<DataChunk> {
        let start = self
            .actions
            .iter()
            .position(|action| {
                let range = action.offset_range();
                range.contains(from) || range.is_after(from)
            })?;

        let mut current = if self.actions[start].offset.is_after(from) {
            self.actions[start].offset
        } else {
            from
        };
        let chunk_offset = current;
        let mut data = Vec::with_capacity(max_size);
        let mut remaining = max_size;

        for action in self.actions.iter_mut().skip(start) {
            if remaining == 0
                || (action.offset != current && !action.offset_range().contains(current))
            {
                break;
            }
            action.state = SendState::Sending;
            let skip = action.offset.distance(current);
            let take = (action.len() - skip).min(remaining);
            let begin = action.begin + skip;
            data.extend_from_slice(&action.data[begin..begin + take]);
            current = current + take as u16;
            remaining -= take;
        }

        if data.is_empty() {
            return None;
        }
        Some(DataChunk {
            offset: chunk_offset,
            data,
        })
    }

    /// Cumulative acknowledgement of every byte strictly before `upto`.
    /// Completed actions are dropped and reported.
    pub fn acknowledge(&mut self, upto: RingIndex) -> Vec<SendId> {
        let mut done = Vec::new();
        while let Some(front) = self.actions.front_mut() {
            let range = front.offset_range();
            if range.is_before(upto) {
                self.len -= front.len();
                front.state = SendState::Done;
                done.push(front.id);
                self.actions.pop_front();
            } else if front.offset.is_before(upto) {
                // partial acknowledgement inside the action
                let advance = front.offset.distance(upto);
                front.begin += advance;
                front.offset = upto;
                self.len -= advance;
                break;
            } else {
                break;
            }
        }
        done
    }

    /// Fail every action whose range starts at or before `upto`. Returns
    /// the failed ids and the first offset remaining in the buffer.
    pub fn reject(&mut self, upto: RingIndex) -> (Vec<SendId>, Option<RingIndex>) {
        let mut failed = Vec::new();
        while let Some(front) = self.actions.front_mut() {
            if front.offset_range().is_after(upto) {
                break;
            }
            self.len -= front.len();
            front.state = SendState::Failed;
            failed.push(front.id);
            self.actions.pop_front();
        }
        (failed, self.actions.front().map(|action| action.offset))
    }

    /// Reassign action offsets contiguously from a new session base.
    /// Returns the offset one past the last buffered byte.
    pub fn rebase(&mut self, base: RingIndex) -> RingIndex {
        let mut current = base;
        for action in self.actions.iter_mut() {
            action.offset = current;
            current = action.offset_range().right + 1;
        }
        current
    }

    /// Remove a still-waiting action, re-packing the offsets of everything
    /// queued behind it. Returns the number of bytes removed.
    pub fn stop(&mut self, id: SendId) -> Option<usize> {
        let pos = self.actions.iter().position(|action| action.id == id)?;
        debug_assert_eq!(self.actions[pos].state, SendState::Waiting);
        let mut removed = self.actions.remove(pos).unwrap();
        removed.state = SendState::Stopped;
        self.len -= removed.len();
        let mut current = removed.offset;
        for action in self.actions.iter_mut().skip(pos) {
            action.offset = current;
            current = action.offset_range().right + 1;
        }
        Some(removed.len())
    }
}

/// One in-flight span of the send window.
#[derive(Debug, Copy, Clone)]
pub struct SendingChunk {
    pub range: OffsetRange,
    /// When the chunk was last handed to the transport (absolute μs).
    pub send_time: u64,
    /// Transmissions so far, including the first.
    pub repeat_count: u8,
}

/// Ordered registry of in-flight chunks: contiguous, non-overlapping,
/// append-only at the right, truncated from the left by acknowledgements.
#[derive(Debug, Default)]
pub struct SendingChunks {
    chunks: VecDeque<SendingChunk>,
}

impl SendingChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn front(&self) -> Option<&SendingChunk> {
        self.chunks.front()
    }

    /// Register a (re)transmission covering `[left, right]`. A chunk
    /// re-sliced at the same left edge keeps its repeat count.
    pub fn register(&mut self, left: RingIndex, right: RingIndex, now: u64) -> &mut SendingChunk {
        if let Some(pos) = self.chunks.iter().position(|chunk| chunk.range.left == left) {
            let chunk = &mut self.chunks[pos];
            chunk.range.right = right;
            chunk.send_time = now;
            return &mut self.chunks[pos];
        }
        self.chunks.push_back(SendingChunk {
            range: OffsetRange::new(left, right),
            send_time: now,
            repeat_count: 0,
        });
        self.chunks.back_mut().unwrap()
    }

    /// Drop every chunk fully before `offset` and trim one containing it.
    pub fn remove_up_to(&mut self, offset: RingIndex) {
        while let Some(front) = self.chunks.front_mut() {
            if front.range.is_before(offset) {
                self.chunks.pop_front();
            } else if front.range.left.is_before(offset) {
                front.range.left = offset;
                break;
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// One out-of-order received span.
#[derive(Debug)]
pub struct ReceivingChunk {
    /// Ring offset of the byte at cursor `start`.
    pub offset: RingIndex,
    /// Prefix of `data` trimmed away by overlap with an earlier chunk.
    pub start: usize,
    pub data: Bytes,
    pub repeat_count: u8,
}

impl ReceivingChunk {
    fn len(&self) -> usize {
        self.data.len() - self.start
    }

    fn offset_range(&self) -> OffsetRange {
        debug_assert!(self.len() > 0);
        OffsetRange::new(self.offset, self.offset + (self.len() - 1) as u16)
    }
}

/// Outcome of inserting a chunk into the receive list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddResult {
    /// Entirely before the delivery cursor; dropped.
    Confirmed,
    /// Exactly matches a stored chunk; only its repeat count was updated.
    Duplicate,
    Added,
}

/// Unordered-insertion, sorted-on-normalize list of received chunks.
///
/// After `add` returns, chunks are sorted by offset, none is empty, and
/// the content between any two points of the ring is stored exactly once.
#[derive(Debug, Default)]
pub struct ChunkList {
    chunks: Vec<ReceivingChunk>,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn add(
        &mut self,
        offset: RingIndex,
        repeat_count: u8,
        data: Bytes,
        last_emitted: RingIndex,
    ) -> AddResult {
        if data.is_empty() {
            return AddResult::Confirmed;
        }
        let mut chunk = ReceivingChunk {
            offset,
            start: 0,
            data,
            repeat_count,
        };
        if chunk.offset_range().is_before(last_emitted) {
            // duplicated with already confirmed data
            return AddResult::Confirmed;
        }
        // trim the part already delivered
        if chunk.offset.is_before(last_emitted) {
            let trim = chunk.offset.distance(last_emitted);
            chunk.start += trim;
            chunk.offset = last_emitted;
        }

        if let Some(existing) = self
            .chunks
            .iter_mut()
            .find(|c| c.offset == chunk.offset && c.len() == chunk.len())
        {
            existing.repeat_count = existing.repeat_count.max(chunk.repeat_count);
            return AddResult::Duplicate;
        }

        self.chunks.push(chunk);
        self.normalize(last_emitted);
        AddResult::Added
    }

    /// Sort by offset and trim overlaps so that every offset is covered at
    /// most once; later chunks lose their overlapping prefix.
    fn normalize(&mut self, last_emitted: RingIndex) {
        self.chunks
            .sort_by_key(|chunk| last_emitted.distance(chunk.offset));
        let mut next_expected = last_emitted;
        let mut i = 0;
        while i < self.chunks.len() {
            let dominated = {
                let chunk = &mut self.chunks[i];
                if chunk.offset.is_before(next_expected) {
                    let trim = chunk.offset.distance(next_expected);
                    if trim >= chunk.len() {
                        true
                    } else {
                        chunk.start += trim;
                        chunk.offset = next_expected;
                        false
                    }
                } else {
                    false
                }
            };
            if dominated {
                self.chunks.remove(i);
                continue;
            }
            next_expected = self.chunks[i].offset_range().right + 1;
            i += 1;
        }
    }

    /// Join and remove the contiguous chain starting exactly at
    /// `last_emitted`, if any, returning the joined bytes and the offset
    /// one past the chain.
    pub fn pop_contiguous(&mut self, last_emitted: RingIndex) -> Option<(Bytes, RingIndex)> {
        let mut expected = last_emitted;
        let mut count = 0;
        let mut size = 0;
        for chunk in &self.chunks {
            if chunk.offset != expected {
                break;
            }
            expected = chunk.offset_range().right + 1;
            size += chunk.len();
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(size);
        for chunk in self.chunks.drain(..count) {
            data.extend_from_slice(&chunk.data[chunk.start..]);
        }
        Some((data.into(), expected))
    }

    /// First offset missing before buffered data, if the head of the list
    /// does not line up with `last_emitted`.
    pub fn first_gap(&self, last_emitted: RingIndex) -> Option<RingIndex> {
        let mut expected = last_emitted;
        for chunk in &self.chunks {
            if chunk.offset != expected {
                return Some(expected);
            }
            expected = chunk.offset_range().right + 1;
        }
        None
    }
}
