//! Channel lifecycle state
//!
//! Shared between the producer and the worker; guarantees the channel is
//! torn down exactly once.

use std::sync::atomic::{AtomicU8, Ordering};

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Constructed, not yet connecting
    Idle = 0,
    /// TCP connect in progress
    Connecting = 1,
    /// Worker running, writes accepted
    Active = 2,
    /// Teardown in progress, writes refused
    Draining = 3,
    /// Socket closed; terminal
    Closed = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Connecting,
            2 => ChannelState::Active,
            3 => ChannelState::Draining,
            _ => ChannelState::Closed,
        }
    }

    pub fn is_active(self) -> bool {
        self == ChannelState::Active
    }
}

/// Atomic holder for [`ChannelState`]
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Idle as u8))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `Draining` from any earlier state
    ///
    /// Returns true only for the caller that made the transition.
    pub fn try_begin_draining(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < ChannelState::Draining as u8 {
                    Some(ChannelState::Draining as u8)
                } else {
                    None
                }
            })
            .is_ok()
    }
}
