//! Page packet framing
//!
//! Every page leaves the channel as one frame: a fixed 4-byte header followed
//! by the page contents.
//!
//! ```text
//! +-------------+---------------------------+------------------+
//! | type (1)    | body_len (3, little end.) | body (body_len)  |
//! +-------------+---------------------------+------------------+
//! ```

use bytes::{Buf, Bytes, BytesMut};

/// Size of the packet header in bytes
pub const HEADER_LEN: usize = 4;

/// Largest body a single frame can carry (24-bit length field)
pub const MAX_BODY_LEN: usize = (1 << 24) - 1;

/// Packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Page of stream bytes
    Data = 0,
    /// Sender is going away; always has an empty body
    Close = 1,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Close),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Header too short: {0} bytes")]
    Truncated(usize),

    #[error("Unknown packet type: {0}")]
    UnknownType(u8),

    #[error("Body length {0} does not fit in 24 bits")]
    BodyTooLarge(usize),

    #[error("Close packet carries a {0} byte body")]
    CloseWithBody(usize),
}

/// Fixed 4-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub body_len: u32,
}

impl PacketHeader {
    /// Header for a data frame carrying `body_len` bytes
    pub fn data(body_len: usize) -> Result<Self, PacketError> {
        if body_len > MAX_BODY_LEN {
            return Err(PacketError::BodyTooLarge(body_len));
        }
        Ok(Self {
            packet_type: PacketType::Data,
            body_len: body_len as u32,
        })
    }

    /// Header of the close notification
    pub const fn close() -> Self {
        Self {
            packet_type: PacketType::Close,
            body_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        debug_assert!(self.body_len as usize <= MAX_BODY_LEN);
        let len = self.body_len.to_le_bytes();
        [u8::from(self.packet_type), len[0], len[1], len[2]]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated(bytes.len()));
        }

        let packet_type = PacketType::try_from(bytes[0])?;
        let body_len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]);

        if packet_type == PacketType::Close && body_len != 0 {
            return Err(PacketError::CloseWithBody(body_len as usize));
        }

        Ok(Self {
            packet_type,
            body_len,
        })
    }
}

/// A fully reassembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForBody { body_len: usize },
    Closed,
}

/// Receiver-side frame reassembly over an arbitrary chunked byte stream
///
/// A close frame and end-of-stream mean the same thing to a receiver; after
/// either, [`FrameDecoder::is_closed`] is true and further input is ignored.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(64 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
        }
    }

    /// Feed bytes in, get every frame they complete
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, PacketError> {
        let mut frames = Vec::new();
        if matches!(self.state, State::Closed) {
            return Ok(frames);
        }

        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let header = PacketHeader::decode(&self.buffer[..HEADER_LEN])?;
                    self.buffer.advance(HEADER_LEN);

                    match header.packet_type {
                        PacketType::Close => {
                            frames.push(Frame::Close);
                            self.close();
                            break;
                        }
                        PacketType::Data => {
                            self.state = State::WaitingForBody {
                                body_len: header.body_len as usize,
                            };
                        }
                    }
                }
                State::WaitingForBody { body_len } => {
                    if self.buffer.len() < body_len {
                        break;
                    }
                    let body = self.buffer.split_to(body_len).freeze();
                    frames.push(Frame::Data(body));
                    self.state = State::WaitingForHeader;
                }
                State::Closed => break,
            }
        }

        Ok(frames)
    }

    /// Marks end of stream (socket EOF)
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
