//! The per-pipe framing engine: receive parser and outbound FIFO.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::{Arc, Weak};

use hostpipe_logger::warn;
use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, ServicePipe, transfer};
use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{CloseReason, PollFlags, TransferError, TransferResult, WakeFlags};
use parking_lot::Mutex;

use crate::handle::AsyncMessagePipeHandle;
use crate::service::{HandleRegistry, MessageHandler};
use crate::{MAX_MESSAGE_SIZE, MAX_QUEUED_BYTES};

/// Incremental decoder for the `[u32 length][payload]` wire format.
pub(crate) enum Parser {
    /// Accumulating the four length bytes.
    Length { acc: [u8; 4], have: usize },
    /// Accumulating `expected` payload bytes.
    Payload { expected: usize, data: Vec<u8> },
}

impl Default for Parser {
    fn default() -> Self {
        Parser::Length {
            acc: [0; 4],
            have: 0,
        }
    }
}

impl Parser {
    /// Feeds one byte. Returns a completed payload, or the oversized length
    /// as an error; the length is validated before any payload allocation.
    fn feed(&mut self, byte: u8) -> Result<Option<Vec<u8>>, usize> {
        match self {
            Parser::Length { acc, have } => {
                acc[*have] = byte;
                *have += 1;
                if *have < 4 {
                    return Ok(None);
                }
                let expected = u32::from_le_bytes(*acc) as usize;
                *self = Parser::default();
                if expected > MAX_MESSAGE_SIZE {
                    return Err(expected);
                }
                if expected == 0 {
                    return Ok(Some(Vec::new()));
                }
                *self = Parser::Payload {
                    expected,
                    data: Vec::with_capacity(expected),
                };
                Ok(None)
            }
            Parser::Payload { expected, data } => {
                data.push(byte);
                if data.len() == *expected {
                    let message = mem::take(data);
                    *self = Parser::default();
                    Ok(Some(message))
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub(crate) fn save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        match self {
            Parser::Length { acc, have } => {
                writer.put_byte(0)?;
                writer.put_byte(*have as u8)?;
                writer.put_raw(&acc[..*have])
            }
            Parser::Payload { expected, data } => {
                writer.put_byte(1)?;
                writer.put_le32(*expected as u32)?;
                writer.put_sized(data)
            }
        }
    }

    pub(crate) fn load(reader: &mut SnapshotReader<'_>) -> io::Result<Self> {
        match reader.get_byte()? {
            0 => {
                let have = reader.get_byte()? as usize;
                if have > 4 {
                    return Err(bad_state("length accumulator over four bytes"));
                }
                let bytes = reader.get_raw(have)?;
                let mut acc = [0u8; 4];
                acc[..have].copy_from_slice(&bytes);
                Ok(Parser::Length { acc, have })
            }
            1 => {
                let expected = reader.get_le32()? as usize;
                let data = reader.get_sized()?;
                if expected > MAX_MESSAGE_SIZE || data.len() > expected {
                    return Err(bad_state("payload state out of bounds"));
                }
                Ok(Parser::Payload { expected, data })
            }
            _ => Err(bad_state("unknown parser state")),
        }
    }
}

fn bad_state(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// The outbound FIFO: whole payloads waiting to be framed, plus the raw
/// remainder of a message the guest has partially drained.
#[derive(Default)]
pub(crate) struct Outbound {
    carry: Vec<u8>,
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
}

impl Outbound {
    /// Enqueues a payload; errors when the queue bound would be crossed.
    pub(crate) fn push(&mut self, payload: Vec<u8>) -> Result<(), ()> {
        let framed_len = 4 + payload.len();
        if payload.len() > MAX_MESSAGE_SIZE || self.bytes + framed_len > MAX_QUEUED_BYTES {
            return Err(());
        }
        self.bytes += framed_len;
        self.queue.push_back(payload);
        Ok(())
    }

    pub(crate) fn has_data(&self) -> bool {
        !self.carry.is_empty() || !self.queue.is_empty()
    }

    /// Moves framed bytes into the guest vector, preserving message
    /// boundaries. A partially drained message carries to the next call.
    fn drain(&mut self, bufs: &mut [&mut [u8]]) -> usize {
        let mut cursor = VectorCursor::new(bufs);
        let mut total = 0;
        loop {
            if !self.carry.is_empty() {
                let n = cursor.write(&self.carry);
                self.carry.drain(..n);
                self.bytes -= n;
                total += n;
                if !self.carry.is_empty() {
                    break;
                }
            }
            match self.queue.pop_front() {
                Some(payload) => {
                    let mut framed = Vec::with_capacity(4 + payload.len());
                    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                    framed.extend_from_slice(&payload);
                    self.carry = framed;
                }
                None => break,
            }
        }
        total
    }

    pub(crate) fn save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        writer.put_le32(self.queue.len() as u32)?;
        for payload in &self.queue {
            writer.put_sized(payload)?;
        }
        writer.put_sized(&self.carry)
    }

    pub(crate) fn load(reader: &mut SnapshotReader<'_>) -> io::Result<Self> {
        let count = reader.get_le32()?;
        let mut queue = VecDeque::with_capacity(count as usize);
        let mut bytes = 0;
        for _ in 0..count {
            let payload = reader.get_sized()?;
            bytes += 4 + payload.len();
            queue.push_back(payload);
        }
        let carry = reader.get_sized()?;
        bytes += carry.len();
        Ok(Outbound {
            carry,
            queue,
            bytes,
        })
    }
}

struct VectorCursor<'a, 'b> {
    bufs: &'a mut [&'b mut [u8]],
    seg: usize,
    offset: usize,
}

impl<'a, 'b> VectorCursor<'a, 'b> {
    fn new(bufs: &'a mut [&'b mut [u8]]) -> Self {
        VectorCursor {
            bufs,
            seg: 0,
            offset: 0,
        }
    }

    fn write(&mut self, mut src: &[u8]) -> usize {
        let mut written = 0;
        while !src.is_empty() && self.seg < self.bufs.len() {
            let seg = &mut self.bufs[self.seg];
            let space = seg.len() - self.offset;
            if space == 0 {
                self.seg += 1;
                self.offset = 0;
                continue;
            }
            let n = space.min(src.len());
            seg[self.offset..self.offset + n].copy_from_slice(&src[..n]);
            self.offset += n;
            written += n;
            src = &src[n..];
        }
        written
    }
}

/// Service-pipe implementation wrapping a message handler.
pub(crate) struct AsyncMessagePipe {
    handle: AsyncMessagePipeHandle,
    ctx: PipeContext,
    parser: Parser,
    outbound: Arc<Mutex<Outbound>>,
    handler: Box<dyn MessageHandler>,
    registry: Weak<HandleRegistry>,
}

impl AsyncMessagePipe {
    pub(crate) fn new(
        handle: AsyncMessagePipeHandle,
        ctx: PipeContext,
        parser: Parser,
        outbound: Arc<Mutex<Outbound>>,
        handler: Box<dyn MessageHandler>,
        registry: Weak<HandleRegistry>,
    ) -> Self {
        AsyncMessagePipe {
            handle,
            ctx,
            parser,
            outbound,
            handler,
            registry,
        }
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.handle, &self.outbound);
        }
    }
}

impl ServicePipe for AsyncMessagePipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        self.deregister();
    }

    fn on_guest_poll(&self) -> PollFlags {
        if self.outbound.lock().has_data() {
            PollFlags::IN
        } else {
            PollFlags::OUT
        }
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        let drained = self.outbound.lock().drain(bufs);
        if drained == 0 {
            return Err(TransferError::Again);
        }
        Ok(drained)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        let total = transfer::vector_len(bufs);
        for seg in bufs {
            for &byte in *seg {
                match self.parser.feed(byte) {
                    Ok(None) => {}
                    Ok(Some(message)) => self.handler.on_message(message),
                    Err(oversized) => {
                        warn!(
                            "async pipe {}: length prefix {} exceeds limit, closing",
                            self.handle, oversized
                        );
                        self.ctx.close_from_host(CloseReason::Error);
                        return Err(TransferError::Io);
                    }
                }
            }
        }
        Ok(SendOutcome::Transferred(total))
    }

    fn on_guest_want_wake_on(&mut self, flags: WakeFlags) {
        // Enqueues already signal; only a request racing queued data needs
        // an immediate answer.
        if flags.contains(WakeFlags::READ) && self.outbound.lock().has_data() {
            self.ctx.signal_wake(WakeFlags::READ);
        }
    }

    fn on_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        writer.put_le32(self.handle.value())?;
        self.outbound.lock().save(writer)?;
        self.parser.save(writer)
    }
}

impl Drop for AsyncMessagePipe {
    fn drop(&mut self) {
        self.deregister();
    }
}


#[cfg(test)]
mod outbound_tests {
    use super::*;

    #[test]
    fn drain_preserves_boundaries_across_partial_reads() {
        let mut outbound = Outbound::default();
        outbound.push(b"hello".to_vec()).unwrap();
        outbound.push(b"world!".to_vec()).unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = outbound.drain(&mut [&mut buf]);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }

        let mut expected = Vec::new();
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(b"hello");
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.extend_from_slice(b"world!");
        assert_eq!(collected, expected);
        assert!(!outbound.has_data());
    }

    #[test]
    fn push_enforces_the_queue_bound() {
        let mut outbound = Outbound::default();
        let big = vec![0u8; MAX_QUEUED_BYTES - 8];
        outbound.push(big).unwrap();
        assert!(outbound.push(vec![0u8; 16]).is_err());
    }

    #[test]
    fn snapshot_round_trips_carry_state() {
        let mut outbound = Outbound::default();
        outbound.push(b"abcdef".to_vec()).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(outbound.drain(&mut [&mut buf]), 2);

        let mut saved = Vec::new();
        outbound
            .save(&mut SnapshotWriter::new(&mut saved))
            .unwrap();
        let mut cursor: &[u8] = &saved;
        let mut restored = Outbound::load(&mut SnapshotReader::new(&mut cursor)).unwrap();

        let mut rest = vec![0u8; 16];
        let n = restored.drain(&mut [&mut rest[..]]);
        // 4-byte prefix + 6 payload bytes, minus the 2 already read.
        assert_eq!(n, 8);
        assert_eq!(&rest[..n], &[0, 0, b'a', b'b', b'c', b'd', b'e', b'f']);
    }
}
