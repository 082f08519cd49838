//! Readiness loop running on the channel's dedicated thread
//!
//! The worker owns the socket. Shared with the producer: the pending-page
//! list, the read credit, the shutdown flag, the state cell and the counters.
//! Locks are held only to move a page in or out of a list, never across a
//! socket call.

use std::collections::VecDeque;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use crossbeam_utils::CachePadded;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use crate::channel::inbound::{InboundSink, ReadProgress, ReadState};
use crate::channel::outbound::{Outbound, WriteProgress};
use crate::channel::state::{ChannelState, StateCell};
use crate::error::CloseReason;
use crate::event::ChannelEvent;
use crate::packet::HEADER_LEN;
use crate::transport::{Page, PageRecycler};
use crate::ChannelId;

pub(crate) const SOCKET: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);

const EVENT_CAPACITY: usize = 8;

#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub frames_sent: CachePadded<AtomicU64>,
    pub bytes_sent: CachePadded<AtomicU64>,
    pub bytes_received: CachePadded<AtomicU64>,
    pub speculative_reads: CachePadded<AtomicU64>,
    pub pages_discarded: CachePadded<AtomicU64>,
    pub events_dropped: CachePadded<AtomicU64>,
}

/// State visible to both threads
#[derive(Debug)]
pub(crate) struct Shared {
    pub id: ChannelId,
    pub state: StateCell,
    pub shutdown: AtomicBool,
    pub pending: Mutex<VecDeque<Page>>,
    pub read_credit: AtomicI64,
    pub close_reason: Mutex<Option<CloseReason>>,
    pub counters: ChannelCounters,
}

impl Shared {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            state: StateCell::new(),
            shutdown: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            read_credit: AtomicI64::new(0),
            close_reason: Mutex::new(None),
            counters: ChannelCounters::default(),
        }
    }
}

pub(crate) struct WorkerOptions {
    pub poll_timeout: Duration,
    pub unknown_read_size: usize,
    pub max_read_size: usize,
    pub notify_peer_on_close: bool,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    poll: Poll,
    stream: TcpStream,
    recycler: PageRecycler,
    sink: Box<dyn InboundSink>,
    events: Sender<ChannelEvent>,
    outbound: Outbound,
    inbound: ReadState,
    write_armed: bool,
    poll_timeout: Duration,
    notify_peer_on_close: bool,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        poll: Poll,
        stream: TcpStream,
        recycler: PageRecycler,
        sink: Box<dyn InboundSink>,
        events: Sender<ChannelEvent>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            shared,
            poll,
            stream,
            recycler,
            sink,
            events,
            outbound: Outbound::new(),
            inbound: ReadState::new(options.unknown_read_size, options.max_read_size),
            write_armed: false,
            poll_timeout: options.poll_timeout,
            notify_peer_on_close: options.notify_peer_on_close,
        }
    }

    /// Runs until shutdown is requested or the connection fails
    pub fn run(mut self) {
        let channel = self.shared.id;
        tracing::debug!(%channel, "channel worker started");

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let reason = loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break CloseReason::Normal;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break CloseReason::Error(format!("poll failed: {}", e));
            }

            if let Err(reason) = self.dispatch(&events) {
                break reason;
            }
        };

        self.teardown(reason);
    }

    fn dispatch(&mut self, events: &Events) -> Result<(), CloseReason> {
        for event in events.iter() {
            match event.token() {
                WAKER => self.on_wake()?,
                SOCKET => self.on_socket(event)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Producer enqueued pages or asked for shutdown
    fn on_wake(&mut self) -> Result<(), CloseReason> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        self.write_ready()
    }

    fn on_socket(&mut self, event: &Event) -> Result<(), CloseReason> {
        if event.is_error() {
            let reason = match self.stream.take_error() {
                Ok(Some(e)) => e.to_string(),
                Ok(None) => "socket error".to_string(),
                Err(e) => e.to_string(),
            };
            return Err(CloseReason::Error(reason));
        }

        if event.is_readable() {
            self.read_ready()?;
        }

        if event.is_writable() {
            self.write_ready()?;
        }

        if event.is_read_closed() || event.is_write_closed() {
            return Err(CloseReason::PeerClosed);
        }

        Ok(())
    }

    fn read_ready(&mut self) -> Result<(), CloseReason> {
        let progress = self
            .inbound
            .drive(&mut self.stream, &self.shared.read_credit, &mut *self.sink);

        let counters = &self.shared.counters;
        counters
            .bytes_received
            .store(self.inbound.bytes_received(), Ordering::Relaxed);
        counters
            .speculative_reads
            .store(self.inbound.speculative_reads(), Ordering::Relaxed);

        match progress {
            Ok(ReadProgress::WouldBlock) => Ok(()),
            Ok(ReadProgress::Eof) => Err(CloseReason::PeerClosed),
            Err(e) => Err(CloseReason::Error(format!("read failed: {}", e))),
        }
    }

    /// Sends pending frames, then arms or disarms writable interest
    fn write_ready(&mut self) -> Result<(), CloseReason> {
        let shared = &self.shared;
        let recycler = &self.recycler;

        let progress = self.outbound.drive(
            &mut self.stream,
            || shared.pending.lock().pop_front(),
            |page| {
                shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .bytes_sent
                    .fetch_add((HEADER_LEN + page.len()) as u64, Ordering::Relaxed);
                recycler.recycle(page);
            },
        );

        match progress {
            Ok(WriteProgress::Drained) => self.set_write_interest(false),
            Ok(WriteProgress::Blocked) => self.set_write_interest(true),
            Err(e) => Err(CloseReason::Error(format!("write failed: {}", e))),
        }
    }

    fn set_write_interest(&mut self, armed: bool) -> Result<(), CloseReason> {
        if self.write_armed == armed {
            return Ok(());
        }

        let interest = if armed {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        self.poll
            .registry()
            .reregister(&mut self.stream, SOCKET, interest)
            .map_err(|e| CloseReason::Error(format!("reregister failed: {}", e)))?;

        self.write_armed = armed;
        tracing::trace!(channel = %self.shared.id, armed, "write interest updated");
        Ok(())
    }

    fn teardown(mut self, reason: CloseReason) {
        let channel = self.shared.id;
        self.shared.state.try_begin_draining();

        if reason == CloseReason::Normal && self.notify_peer_on_close {
            if self.outbound.try_send_close(&mut self.stream) {
                tracing::debug!(%channel, "close notification sent");
            } else {
                tracing::debug!(%channel, "close notification skipped");
            }
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.stream) {
            tracing::warn!(%channel, error = %e, "deregister failed");
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(%channel, error = %e, "shutdown failed");
            }
        }

        // queued but unsent data is discarded
        let mut discarded = self.shared.pending.lock().drain(..).count();
        discarded += usize::from(self.outbound.abandon().is_some());
        self.shared
            .counters
            .pages_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);

        match &reason {
            CloseReason::Error(e) => tracing::error!(%channel, error = %e, discarded, "channel failed"),
            _ => tracing::info!(%channel, %reason, discarded, "channel closed"),
        }

        *self.shared.close_reason.lock() = Some(reason.clone());
        self.shared.state.set(ChannelState::Closed);

        if let Err(e) = self.events.try_send(ChannelEvent::Closed {
            channel_id: channel,
            reason,
        }) {
            // only reachable once the receiver is gone
            tracing::debug!(%channel, error = %e, "close event not delivered");
        }
        // socket and poll drop here
    }
}
