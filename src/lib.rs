//! pagewire - paged TCP streaming transport
//!
//! A producer writes arbitrary byte sequences into a [`Channel`]. The bytes
//! are packed into fixed-capacity pages drawn from a reusable pool, and a
//! dedicated worker thread sends each page as one length-prefixed frame over
//! a non-blocking socket. Inbound bytes are pulled on demand and handed to an
//! [`InboundSink`].
//!
//! ```no_run
//! use pagewire::{inbound_channel, Channel, ChannelConfig, ChannelId};
//! use std::time::Duration;
//!
//! # fn main() -> pagewire::Result<()> {
//! let (sink, mut inbound) = inbound_channel();
//! let mut channel = Channel::open(ChannelConfig::default(), ChannelId::new(1), sink)?;
//!
//! channel.write(b"hello")?;
//! channel.request_read(4)?;
//! let reply = inbound.read_exact(4, Duration::from_secs(1))?;
//! # let _ = reply;
//! channel.close();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod transport;

pub mod config;
pub mod error;
pub mod event;
pub mod packet;

/// Type-safe channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChannelId> for u64 {
    fn from(channel_id: ChannelId) -> Self {
        channel_id.0
    }
}

pub use channel::{
    inbound_channel, Channel, ChannelState, ChannelStats, ChunkSink, InboundChunk,
    InboundReceiver, InboundSink, ReadKind,
};
pub use config::{BackpressurePolicy, ChannelConfig};
pub use error::{ChannelError, CloseReason};
pub use event::{ChannelEvent, EVENT_QUEUE_CAPACITY};
pub use packet::{Frame, FrameDecoder, PacketError, PacketHeader, PacketType};
pub use transport::{Page, PageId, PageQueue, PageRecycler, PoolStats};

pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_display_and_conversions() {
        let id = ChannelId::new(7);
        assert_eq!(id.to_string(), "channel-7");
        assert_eq!(u64::from(id), 7);
        assert_eq!(ChannelId::from(7u64), id);
        assert_eq!(id.next().as_u64(), 8);
    }
}
