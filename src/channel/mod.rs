//! TCP page channel
//!
//! ```text
//! producer thread                          worker thread
//! ───────────────                          ─────────────
//! write ─► PageQueue::push ─► cached ─┐
//! flush ─────────────────────────────┴─► pending ─► header + body ─► socket
//!                                                      │
//!                             free list ◄── recycle ◄──┘
//! request_read ─► credit ─────────────────► socket ─► InboundSink
//! ```

pub mod inbound;
pub(crate) mod outbound;
pub mod state;
pub(crate) mod worker;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use mio::{Interest, Poll, Waker};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, CloseReason};
use crate::event::{ChannelEvent, EVENT_QUEUE_CAPACITY};
use crate::transport::{PageQueue, PoolStats};
use crate::{ChannelId, Result};

pub use inbound::{inbound_channel, ChunkSink, InboundChunk, InboundReceiver, InboundSink, ReadKind};
pub use state::ChannelState;

use worker::{Shared, Worker, WorkerOptions, SOCKET, WAKER};

/// Channel statistics snapshot
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub channel_id: ChannelId,
    pub state: ChannelState,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub speculative_reads: u64,
    pub pages_pending: usize,
    pub pages_discarded: u64,
    /// `Backpressure` events dropped because the event queue was full
    pub events_dropped: u64,
    pub read_credit: i64,
    pub pool: PoolStats,
}

/// Producer handle of one TCP session
///
/// Methods take `&mut self` where they touch the page being filled; the
/// handle is meant to live on the producer thread.
pub struct Channel {
    shared: Arc<Shared>,
    queue: PageQueue,
    waker: Arc<Waker>,
    worker: Option<JoinHandle<()>>,
    events_tx: Sender<ChannelEvent>,
    events_rx: Receiver<ChannelEvent>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Channel {
    /// Connects to `config.host:config.port` and starts the worker thread
    pub fn open<S: InboundSink>(config: ChannelConfig, id: ChannelId, sink: S) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new(id));
        shared.state.set(ChannelState::Connecting);

        let std_stream = connect(&config).map_err(|e| e.with_channel(id))?;
        std_stream.set_nodelay(config.nodelay)?;
        std_stream.set_nonblocking(true)?;

        let local_addr = std_stream.local_addr()?;
        let peer_addr = std_stream.peer_addr()?;
        let mut stream = mio::net::TcpStream::from_std(std_stream);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut stream, SOCKET, Interest::READABLE)?;

        let queue = PageQueue::new(config.page_size, config.page_count, config.max_pages)?
            .with_policy(config.backpressure);
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY);

        let worker = Worker::new(
            Arc::clone(&shared),
            poll,
            stream,
            queue.recycler(),
            Box::new(sink),
            events_tx.clone(),
            WorkerOptions {
                poll_timeout: config.poll_timeout,
                unknown_read_size: config.unknown_read_size,
                max_read_size: config.max_read_size,
                notify_peer_on_close: config.notify_peer_on_close,
            },
        );

        shared.state.set(ChannelState::Active);
        let handle = std::thread::Builder::new()
            .name(format!("pagewire-{}", id.as_u64()))
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.state.set(ChannelState::Closed);
                ChannelError::from(e).with_channel(id)
            })?;

        tracing::info!(
            channel = %id,
            %local_addr,
            %peer_addr,
            page_size = config.page_size,
            page_count = config.page_count,
            "channel connected"
        );
        // first event on an empty queue
        let _ = events_tx.try_send(ChannelEvent::Connected {
            channel_id: id,
            local_addr,
            peer_addr,
        });

        Ok(Self {
            shared,
            queue,
            waker,
            worker: Some(handle),
            events_tx,
            events_rx,
            local_addr,
            peer_addr,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active() && !self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Why the channel closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().clone()
    }

    /// Connected / backpressure / closed notifications
    ///
    /// The queue is bounded by [`EVENT_QUEUE_CAPACITY`]; an undrained queue
    /// drops further `Backpressure` events but always keeps room for `Closed`.
    pub fn events(&self) -> Receiver<ChannelEvent> {
        self.events_rx.clone()
    }

    /// Queues `data` and makes it eligible for sending immediately
    ///
    /// Never blocks under `BackpressurePolicy::Reject`. Fails with
    /// `ResourceExhausted` (nothing queued) at the page cap, and with `Closed`
    /// once the channel is no longer active.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_active()?;

        if let Err(e) = self.queue.push(data) {
            if let ChannelError::ResourceExhausted { current, limit, .. } = &e {
                self.notify_backpressure(*current, *limit);
            }
            return Err(e);
        }

        self.flush()
    }

    /// Hands every cached page, including a partial current one, to the worker
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.queue.flush();

        let moved = {
            let mut pending = self.shared.pending.lock();
            self.queue.drain_into(&mut pending)
        };

        if moved > 0 {
            tracing::trace!(channel = %self.shared.id, pages = moved, "pages handed to worker");
            self.waker
                .wake()
                .map_err(|e| ChannelError::from(e).with_channel(self.shared.id))?;
        }
        Ok(())
    }

    /// Declares that the producer expects `len` more inbound bytes
    ///
    /// Fails with a configuration error, leaving the credit untouched, when
    /// the total outstanding request would not fit in an `i64`.
    pub fn request_read(&self, len: usize) -> Result<()> {
        self.ensure_active()?;

        let too_large = || {
            ChannelError::config_error("request_read", format!("{} bytes exceeds the read credit range", len))
        };
        let added = i64::try_from(len).map_err(|_| too_large())?;

        self.shared
            .read_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| credit.checked_add(added))
            .map_err(|_| too_large())?;
        Ok(())
    }

    /// Stops the worker and closes the socket; repeated calls are no-ops
    pub fn close(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            // the worker still notices within one poll timeout
            tracing::debug!(channel = %self.shared.id, error = %e, "wake on close failed");
        }

        if handle.join().is_err() {
            tracing::error!(channel = %self.shared.id, "channel worker panicked");
            self.shared
                .close_reason
                .lock()
                .get_or_insert_with(|| CloseReason::Error("worker panicked".to_string()));
            self.shared.state.set(ChannelState::Closed);
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let counters = &self.shared.counters;
        ChannelStats {
            channel_id: self.shared.id,
            state: self.state(),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            speculative_reads: counters.speculative_reads.load(Ordering::Relaxed),
            pages_pending: self.shared.pending.lock().len(),
            pages_discarded: counters.pages_discarded.load(Ordering::Relaxed),
            events_dropped: counters.events_dropped.load(Ordering::Relaxed),
            read_credit: self.shared.read_credit.load(Ordering::Acquire),
            pool: self.queue.stats(),
        }
    }

    fn notify_backpressure(&self, live_pages: usize, max_pages: usize) {
        // the last slot belongs to the Closed event
        let sent = self.events_tx.len() + 1 < EVENT_QUEUE_CAPACITY
            && self
                .events_tx
                .try_send(ChannelEvent::Backpressure {
                    channel_id: self.shared.id,
                    live_pages,
                    max_pages,
                })
                .is_ok();

        if !sent {
            self.shared
                .counters
                .events_dropped
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(channel = %self.shared.id, "backpressure event dropped, queue full");
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let reason = self.close_reason().unwrap_or(CloseReason::Normal);
        Err(ChannelError::closed(reason))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Tries every resolved address in order
fn connect(config: &ChannelConfig) -> Result<std::net::TcpStream> {
    let address = config.address();
    let mut last_error = None;

    for addr in address.to_socket_addrs()? {
        tracing::debug!(%addr, "connecting");
        match std::net::TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => ChannelError::connection_error(
            format!("cannot connect to {}: {}", address, e),
            matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
            ),
        ),
        None => ChannelError::connection_error(format!("{} resolved to no address", address), false),
    })
}
