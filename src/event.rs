use std::net::SocketAddr;

use crate::error::CloseReason;
use crate::ChannelId;

/// Slots in a channel's event queue
///
/// One slot is always left for the final `Closed` event; `Backpressure`
/// events that would take it are dropped and counted instead.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Notifications pushed from the worker thread to the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Socket connected and worker running
    Connected {
        channel_id: ChannelId,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    },
    /// A write was refused at the page pool cap
    Backpressure {
        channel_id: ChannelId,
        live_pages: usize,
        max_pages: usize,
    },
    /// Terminal: the channel will not send or receive anything more
    Closed {
        channel_id: ChannelId,
        reason: CloseReason,
    },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChannelEvent::Connected { channel_id, .. }
            | ChannelEvent::Backpressure { channel_id, .. }
            | ChannelEvent::Closed { channel_id, .. } => *channel_id,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelEvent::Closed { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Closed {
                reason: CloseReason::Error(_),
                ..
            }
        )
    }
}
