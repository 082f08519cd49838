//! Outbound framing with partial-write resumption

use std::io::{self, Write};

use crate::packet::{PacketHeader, PacketType, HEADER_LEN, MAX_BODY_LEN};
use crate::transport::Page;

/// Where a drive pass stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteProgress {
    /// Nothing left to send
    Drained,
    /// Socket buffer full; resume on the next writable event
    Blocked,
}

/// Page being written, with separate offsets into header and body
#[derive(Debug)]
struct InFlight {
    page: Page,
    header: [u8; HEADER_LEN],
    header_sent: usize,
    body_sent: usize,
}

impl InFlight {
    /// Page capacity is bounded by `MAX_BODY_LEN` when the pool is built
    fn new(page: Page) -> Self {
        debug_assert!(page.len() <= MAX_BODY_LEN);
        let header = PacketHeader {
            packet_type: PacketType::Data,
            body_len: page.len() as u32,
        };

        Self {
            page,
            header: header.encode(),
            header_sent: 0,
            body_sent: 0,
        }
    }

    /// `Ok(true)` once the whole frame is out, `Ok(false)` on `WouldBlock`
    fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        if !write_some(writer, &self.header, &mut self.header_sent)? {
            return Ok(false);
        }
        write_some(writer, self.page.as_slice(), &mut self.body_sent)
    }
}

/// Writes `buf[*sent..]` until done or `WouldBlock`, advancing `sent`
fn write_some<W: Write>(writer: &mut W, buf: &[u8], sent: &mut usize) -> io::Result<bool> {
    while *sent < buf.len() {
        match writer.write(&buf[*sent..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Sends pending pages one frame at a time
///
/// A frame that hits `WouldBlock` stays in flight and is resumed at the exact
/// byte where it stopped; the next page is not touched until it completes.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    in_flight: Option<InFlight>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no frame is partially written
    pub fn at_frame_boundary(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Sends frames until the writer blocks or `next_page` runs dry
    ///
    /// `on_sent` receives each page after its last byte was accepted.
    pub fn drive<W, N, S>(
        &mut self,
        writer: &mut W,
        mut next_page: N,
        mut on_sent: S,
    ) -> io::Result<WriteProgress>
    where
        W: Write,
        N: FnMut() -> Option<Page>,
        S: FnMut(Page),
    {
        loop {
            if self.in_flight.is_none() {
                match next_page() {
                    Some(page) => self.in_flight = Some(InFlight::new(page)),
                    None => return Ok(WriteProgress::Drained),
                }
            }
            let Some(frame) = self.in_flight.as_mut() else {
                return Ok(WriteProgress::Drained);
            };

            if !frame.write_to(writer)? {
                return Ok(WriteProgress::Blocked);
            }

            if let Some(done) = self.in_flight.take() {
                tracing::trace!(page = %done.page.id(), len = done.page.len(), "frame sent");
                on_sent(done.page);
            }
        }
    }

    /// One non-blocking attempt at the close notification
    ///
    /// Only tried at a frame boundary; returns whether all 4 bytes went out.
    pub fn try_send_close<W: Write>(&self, writer: &mut W) -> bool {
        if !self.at_frame_boundary() {
            return false;
        }
        let header = PacketHeader::close().encode();
        let mut sent = 0;
        matches!(write_some(writer, &header, &mut sent), Ok(true))
    }

    /// Drops the in-flight page, if any
    pub fn abandon(&mut self) -> Option<Page> {
        self.in_flight.take().map(|frame| frame.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Frame, FrameDecoder};
    use crate::transport::PageId;
    use std::collections::VecDeque;

    /// Accepts at most `chunk` bytes per call and blocks on every other call
    struct TrickleWriter {
        chunk: usize,
        out: Vec<u8>,
        calls: usize,
    }

    impl TrickleWriter {
        fn new(chunk: usize) -> Self {
            Self { chunk, out: Vec::new(), calls: 0 }
        }
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn page(id: u32, fill: u8, len: usize) -> Page {
        let mut page = Page::new(PageId(id), 4096);
        page.append(&vec![fill; len]);
        page
    }

    #[test]
    fn test_partial_writes_resume_exactly() {
        let mut pending: VecDeque<Page> =
            vec![page(0, b'A', 1000), page(1, b'B', 7), page(2, b'C', 4096)].into();
        let mut writer = TrickleWriter::new(3);
        let mut outbound = Outbound::new();
        let mut sent_ids = Vec::new();

        let mut rounds = 0;
        loop {
            rounds += 1;
            let progress = outbound
                .drive(&mut writer, || pending.pop_front(), |p| sent_ids.push(p.id()))
                .unwrap();
            if progress == WriteProgress::Drained {
                break;
            }
        }

        assert!(rounds > 1, "trickle writer should force resumption");
        assert_eq!(sent_ids, vec![PageId(0), PageId(1), PageId(2)]);
        assert_eq!(writer.out.len(), 3 * HEADER_LEN + 1000 + 7 + 4096);

        let frames = FrameDecoder::new().push(&writer.out).unwrap();
        let bodies: Vec<Vec<u8>> = frames
            .into_iter()
            .map(|f| match f {
                Frame::Data(body) => body.to_vec(),
                Frame::Close => panic!("unexpected close frame"),
            })
            .collect();
        assert_eq!(bodies, vec![vec![b'A'; 1000], vec![b'B'; 7], vec![b'C'; 4096]]);
    }

    #[test]
    fn test_blocked_frame_holds_next_page() {
        let mut pending: VecDeque<Page> = vec![page(0, 1, 10), page(1, 2, 10)].into();
        let mut writer = TrickleWriter::new(2);
        let mut outbound = Outbound::new();

        // first call writes 2 header bytes, second blocks
        let progress = outbound.drive(&mut writer, || pending.pop_front(), |_| {}).unwrap();
        assert_eq!(progress, WriteProgress::Blocked);
        assert_eq!(writer.out.len(), 2);
        assert_eq!(pending.len(), 1);
        assert!(!outbound.at_frame_boundary());
        assert!(!outbound.try_send_close(&mut writer));
    }

    #[test]
    fn test_write_error_propagates() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut pending: VecDeque<Page> = vec![page(0, 1, 4)].into();
        let mut outbound = Outbound::new();
        let err = outbound.drive(&mut Broken, || pending.pop_front(), |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(outbound.abandon().is_some());
    }

    #[test]
    fn test_every_popped_page_stays_accounted() {
        let mut big = Page::new(PageId(9), 70_000);
        big.append(&vec![3u8; 70_000]);
        let mut pending: VecDeque<Page> = vec![big].into();
        let mut writer = TrickleWriter::new(HEADER_LEN);
        let mut outbound = Outbound::new();

        // header goes out whole, then the socket blocks mid-frame
        let progress = outbound.drive(&mut writer, || pending.pop_front(), |_| {}).unwrap();
        assert_eq!(progress, WriteProgress::Blocked);
        assert_eq!(PacketHeader::decode(&writer.out).unwrap().body_len, 70_000);

        // the popped page is held in flight, never dropped
        assert!(pending.is_empty());
        assert_eq!(outbound.abandon().map(|p| p.id()), Some(PageId(9)));
    }

    #[test]
    fn test_close_frame_at_boundary() {
        let outbound = Outbound::new();
        let mut out = Vec::new();
        assert!(outbound.try_send_close(&mut out));
        assert_eq!(out, PacketHeader::close().encode());
    }
}
