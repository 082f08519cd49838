//! Inbound delivery with pull-style read accounting
//!
//! The producer declares how many bytes it expects with
//! [`Channel::request_read`](crate::Channel::request_read). The worker fills a
//! sink-supplied buffer of exactly that size (split into buffers of at most
//! `max_read_size`) and hands it back. Bytes that
//! arrive with no outstanding request are read into a speculative buffer and
//! delivered with their actual count; the credit goes negative by that amount
//! so a later request is reconciled against what was already delivered.

use std::io::{self, Read};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{ChannelError, CloseReason};

/// How a delivered buffer was sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Exactly the requested credit
    Requested,
    /// Arrived before anyone asked; length is whatever was available
    Speculative,
}

/// Receives inbound bytes on the worker thread
pub trait InboundSink: Send + 'static {
    /// Buffer to fill; its contents are overwritten, only the allocation matters
    fn alloc(&mut self, len: usize) -> BytesMut {
        BytesMut::with_capacity(len)
    }

    /// A filled buffer; `data.len()` is the number of bytes received
    fn deliver(&mut self, data: BytesMut, kind: ReadKind);
}

/// One delivered buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    pub data: Bytes,
    pub kind: ReadKind,
}

/// Sink that forwards chunks to an [`InboundReceiver`]
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: Sender<InboundChunk>,
}

impl InboundSink for ChunkSink {
    fn deliver(&mut self, data: BytesMut, kind: ReadKind) {
        // receiver gone means the producer stopped caring
        let _ = self.tx.send(InboundChunk {
            data: data.freeze(),
            kind,
        });
    }
}

/// Producer-side end of a [`ChunkSink`]
#[derive(Debug)]
pub struct InboundReceiver {
    rx: Receiver<InboundChunk>,
    leftover: BytesMut,
}

/// Connected sink/receiver pair
pub fn inbound_channel() -> (ChunkSink, InboundReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        ChunkSink { tx },
        InboundReceiver {
            rx,
            leftover: BytesMut::new(),
        },
    )
}

impl InboundReceiver {
    /// Next chunk as delivered by the worker
    pub fn recv_timeout(&self, timeout: Duration) -> Option<InboundChunk> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<InboundChunk> {
        match self.rx.try_recv() {
            Ok(chunk) => Some(chunk),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Collects exactly `len` bytes, stitching chunks together
    ///
    /// Speculative chunks may overshoot; the surplus is kept for the next call.
    pub fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Bytes, ChannelError> {
        let deadline = Instant::now() + timeout;

        while self.leftover.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.leftover.extend_from_slice(&chunk.data),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ChannelError::timeout_error("read_exact", timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ChannelError::closed(CloseReason::PeerClosed));
                }
            }
        }

        Ok(self.leftover.split_to(len).freeze())
    }

    /// Bytes received but not yet returned by `read_exact`
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }

    /// Discards `len` buffered bytes
    pub fn skip(&mut self, len: usize) {
        let len = len.min(self.leftover.len());
        self.leftover.advance(len);
    }
}

/// Where a read pass stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    WouldBlock,
    Eof,
}

#[derive(Debug)]
struct PendingRead {
    buf: BytesMut,
    filled: usize,
    kind: ReadKind,
}

/// Worker-side read state, kept across readiness events
#[derive(Debug)]
pub(crate) struct ReadState {
    pending: Option<PendingRead>,
    unknown_read_size: usize,
    max_read_size: usize,
    bytes_received: u64,
    speculative_reads: u64,
}

impl ReadState {
    pub fn new(unknown_read_size: usize, max_read_size: usize) -> Self {
        Self {
            pending: None,
            unknown_read_size,
            max_read_size,
            bytes_received: 0,
            speculative_reads: 0,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn speculative_reads(&self) -> u64 {
        self.speculative_reads
    }

    /// Reads until `WouldBlock` or EOF, delivering every completed buffer
    pub fn drive<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        credit: &AtomicI64,
        sink: &mut dyn InboundSink,
    ) -> io::Result<ReadProgress> {
        loop {
            if self.pending.is_none() {
                let started = self.start_read(credit, sink);
                self.pending = Some(started);
            }
            let Some(pending) = self.pending.as_mut() else {
                continue;
            };

            match reader.read(&mut pending.buf[pending.filled..]) {
                Ok(0) => {
                    self.deliver(credit, sink);
                    return Ok(ReadProgress::Eof);
                }
                Ok(n) => {
                    pending.filled += n;
                    self.bytes_received += n as u64;
                    if pending.filled == pending.buf.len() {
                        self.deliver(credit, sink);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // requested buffers wait for the rest; speculative ones go out as-is
                    if pending.kind == ReadKind::Speculative {
                        self.deliver(credit, sink);
                    }
                    return Ok(ReadProgress::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn start_read(&mut self, credit: &AtomicI64, sink: &mut dyn InboundSink) -> PendingRead {
        let wanted = credit.load(Ordering::Acquire);
        // large requests are served as several buffers of at most max_read_size
        let (len, kind) = if wanted > 0 {
            let wanted = usize::try_from(wanted).unwrap_or(usize::MAX);
            (wanted.min(self.max_read_size), ReadKind::Requested)
        } else {
            tracing::debug!(len = self.unknown_read_size, "inbound data ahead of request, reading speculatively");
            (self.unknown_read_size, ReadKind::Speculative)
        };

        let mut buf = sink.alloc(len);
        buf.clear();
        buf.resize(len, 0);

        PendingRead {
            buf,
            filled: 0,
            kind,
        }
    }

    /// Hands the filled prefix of the pending buffer to the sink
    fn deliver(&mut self, credit: &AtomicI64, sink: &mut dyn InboundSink) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        if pending.filled == 0 {
            return;
        }

        pending.buf.truncate(pending.filled);
        credit.fetch_sub(pending.filled as i64, Ordering::AcqRel);
        if pending.kind == ReadKind::Speculative {
            self.speculative_reads += 1;
        }

        tracing::trace!(len = pending.filled, kind = ?pending.kind, "inbound delivered");
        sink.deliver(pending.buf, pending.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted read results
    struct ScriptedReader {
        steps: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self { steps: steps.into() }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn would_block() -> io::Result<Vec<u8>> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    #[test]
    fn test_requested_read_spans_events() {
        let (mut sink, rx) = inbound_channel();
        let credit = AtomicI64::new(10);
        let mut state = ReadState::new(512, 1024);
        let mut reader = ScriptedReader::new(vec![Ok(b"hello".to_vec()), would_block(), Ok(b"world".to_vec())]);

        assert_eq!(state.drive(&mut reader, &credit, &mut sink).unwrap(), ReadProgress::WouldBlock);
        assert!(rx.try_recv().is_none(), "partial requested buffer must not be delivered");

        // second readiness event
        assert_eq!(state.drive(&mut reader, &credit, &mut sink).unwrap(), ReadProgress::WouldBlock);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.kind, ReadKind::Requested);
        assert_eq!(&chunk.data[..], b"helloworld");
        assert_eq!(credit.load(Ordering::Acquire), 0);
        assert_eq!(state.bytes_received(), 10);
    }

    #[test]
    fn test_large_request_split_at_max_read_size() {
        let (mut sink, rx) = inbound_channel();
        let credit = AtomicI64::new(10);
        let mut state = ReadState::new(512, 4);
        let mut reader = ScriptedReader::new(vec![Ok(b"0123456789".to_vec())]);

        assert_eq!(state.drive(&mut reader, &credit, &mut sink).unwrap(), ReadProgress::WouldBlock);

        let chunks: Vec<InboundChunk> = std::iter::from_fn(|| rx.try_recv()).collect();
        let lens: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(chunks.iter().all(|c| c.kind == ReadKind::Requested));
        assert_eq!(credit.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_unrequested_bytes_go_speculative() {
        let (mut sink, rx) = inbound_channel();
        let credit = AtomicI64::new(0);
        let mut state = ReadState::new(4, 1024);
        let mut reader = ScriptedReader::new(vec![Ok(b"abcdef".to_vec())]);

        state.drive(&mut reader, &credit, &mut sink).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.kind, &first.data[..]), (ReadKind::Speculative, &b"abcd"[..]));
        assert_eq!((second.kind, &second.data[..]), (ReadKind::Speculative, &b"ef"[..]));
        assert_eq!(credit.load(Ordering::Acquire), -6);
        assert_eq!(state.speculative_reads(), 2);

        // the producer catches up: its request is already satisfied
        credit.fetch_add(6, Ordering::AcqRel);
        assert_eq!(credit.load(Ordering::Acquire), 0);
        assert_eq!([&first.data[..], &second.data[..]].concat(), b"abcdef");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_eof_flushes_partial_buffer() {
        let (mut sink, rx) = inbound_channel();
        let credit = AtomicI64::new(100);
        let mut state = ReadState::new(512, 1024);
        let mut reader = ScriptedReader::new(vec![Ok(b"xyz".to_vec()), Ok(Vec::new())]);

        assert_eq!(state.drive(&mut reader, &credit, &mut sink).unwrap(), ReadProgress::Eof);
        assert_eq!(&rx.try_recv().unwrap().data[..], b"xyz");
        assert_eq!(credit.load(Ordering::Acquire), 97);
    }

    #[test]
    fn test_read_error_propagates() {
        let (mut sink, _rx) = inbound_channel();
        let credit = AtomicI64::new(0);
        let mut state = ReadState::new(8, 1024);
        let mut reader = ScriptedReader::new(vec![Err(io::ErrorKind::ConnectionReset.into())]);

        let err = state.drive(&mut reader, &credit, &mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_read_exact_keeps_surplus() {
        let (mut sink, mut rx) = inbound_channel();
        sink.deliver(BytesMut::from(&b"0123456789"[..]), ReadKind::Speculative);

        assert_eq!(&rx.read_exact(4, Duration::from_millis(10)).unwrap()[..], b"0123");
        assert_eq!(rx.buffered(), 6);
        rx.skip(2);
        assert_eq!(&rx.read_exact(4, Duration::from_millis(10)).unwrap()[..], b"6789");
        assert!(matches!(
            rx.read_exact(1, Duration::from_millis(10)),
            Err(ChannelError::Timeout { .. })
        ));
    }
}
