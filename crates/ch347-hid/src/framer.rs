//! HID report framing
//!
//! Every report starts with a little-endian `body_len` field. Sized
//! commands carry `[opcode][payload_len][payload]` bodies and are cut into
//! as many reports as the payload needs; stream commands always fit in one
//! report. Replies come back the same way.
//!
//! The framer also keeps track of reply bytes the device still owes. If an
//! exchange fails halfway, those bytes are drained before the next command
//! that reads a reply, so it never sees stale data.

use crate::codec::{CommandSpec, Framing, RawReply, ReplyFrame, ReplyShape};
use crate::error::{Ch347Error, Result};
use crate::protocol::*;
use crate::transport::HidTransport;

/// Size of an outgoing report including the report ID
pub const OUT_REPORT_LEN: usize = REPORT_SIZE + 1;

/// One frame of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Report body (everything after `body_len`)
    pub body: Vec<u8>,
    /// True when more frames of the same message follow
    pub more: bool,
}

/// Reply data the device still has to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owed {
    Nothing,
    Report,
    Bytes(usize),
}

/// Split a command payload into frames
pub fn split(spec: &CommandSpec, payload: &[u8]) -> Result<Vec<Frame>> {
    match spec.framing {
        Framing::Sized => {
            let chunks: Vec<&[u8]> = if payload.is_empty() {
                vec![&[]]
            } else {
                payload.chunks(MAX_FRAME_PAYLOAD).collect()
            };
            let last = chunks.len() - 1;
            Ok(chunks
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| {
                    let mut body = Vec::with_capacity(COMMAND_HEADER_LEN + chunk.len());
                    body.push(spec.opcode);
                    body.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
                    body.extend_from_slice(chunk);
                    Frame {
                        body,
                        more: i != last,
                    }
                })
                .collect())
        }
        Framing::Stream => {
            if payload.len() > REPORT_SIZE - REPORT_LEN_FIELD {
                return Err(Ch347Error::InvalidParameter(format!(
                    "stream of {} bytes does not fit in one report",
                    payload.len()
                )));
            }
            Ok(vec![Frame {
                body: payload.to_vec(),
                more: false,
            }])
        }
    }
}

/// Wrap a frame body into a full output report
pub fn build_report(body: &[u8]) -> [u8; OUT_REPORT_LEN] {
    let mut report = [0u8; OUT_REPORT_LEN];
    report[0] = REPORT_ID;
    report[1..3].copy_from_slice(&(body.len() as u16).to_le_bytes());
    report[3..3 + body.len()].copy_from_slice(body);
    report
}

fn report_body(report: &[u8]) -> Result<&[u8]> {
    if report.len() < REPORT_LEN_FIELD {
        return Err(Ch347Error::MalformedResponse(format!(
            "report of {} bytes has no length field",
            report.len()
        )));
    }
    let body_len = u16::from_le_bytes([report[0], report[1]]) as usize;
    report
        .get(REPORT_LEN_FIELD..REPORT_LEN_FIELD + body_len)
        .ok_or_else(|| {
            Ch347Error::MalformedResponse(format!(
                "body length {} exceeds report of {} bytes",
                body_len,
                report.len()
            ))
        })
}

/// Parse a sized reply report: `[body_len][opcode][payload_len][data]`
pub fn parse_reply_frame(report: &[u8]) -> Result<ReplyFrame> {
    if report.len() < MIN_REPLY_FRAME {
        return Err(Ch347Error::MalformedResponse(format!(
            "reply of {} bytes is shorter than the {} byte header",
            report.len(),
            MIN_REPLY_FRAME
        )));
    }
    let body = report_body(report)?;
    if body.len() < COMMAND_HEADER_LEN {
        return Err(Ch347Error::MalformedResponse(format!(
            "reply body of {} bytes has no command header",
            body.len()
        )));
    }
    let payload_len = u16::from_le_bytes([body[1], body[2]]) as usize;
    let data = body
        .get(COMMAND_HEADER_LEN..COMMAND_HEADER_LEN + payload_len)
        .ok_or_else(|| {
            Ch347Error::MalformedResponse(format!(
                "payload length {} exceeds body of {} bytes",
                payload_len,
                body.len()
            ))
        })?;

    Ok(ReplyFrame {
        opcode: body[0],
        data: data.to_vec(),
    })
}

/// Parse a stream reply report: `[body_len][ack bytes and data]`
pub fn parse_stream_reply(report: &[u8]) -> Result<Vec<u8>> {
    Ok(report_body(report)?.to_vec())
}

/// Report framer over a HID transport
pub struct ReportFramer<T> {
    transport: T,
    timeout_ms: u32,
    owed: Owed,
}

impl<T: HidTransport> ReportFramer<T> {
    /// Create a framer reading with the given timeout
    pub fn new(transport: T, timeout_ms: u32) -> Self {
        Self {
            transport,
            timeout_ms,
            owed: Owed::Nothing,
        }
    }

    /// Give back the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Whether reply bytes from an earlier exchange are still outstanding
    pub fn is_draining(&self) -> bool {
        self.owed != Owed::Nothing
    }

    /// Send all frames of one command, in order
    ///
    /// `expected_len` is the number of data bytes the reply will carry. A
    /// failed write aborts the remaining frames; replies already owed for
    /// the frames that did go out are remembered for the next resync.
    pub fn send(&mut self, spec: &CommandSpec, payload: &[u8], expected_len: usize) -> Result<()> {
        let frames = split(spec, payload)?;
        let mut sent = 0;

        for frame in &frames {
            if let Err(e) = self.write_frame(spec, frame) {
                if sent > 0 {
                    self.owe(spec.reply, sent.min(expected_len));
                }
                return Err(e);
            }
            sent += frame.body.len().saturating_sub(COMMAND_HEADER_LEN);
        }

        self.owe(spec.reply, expected_len);
        Ok(())
    }

    fn write_frame(&mut self, spec: &CommandSpec, frame: &Frame) -> Result<()> {
        let report = build_report(&frame.body);
        let written = self.transport.write(&report)?;
        if written != report.len() {
            return Err(Ch347Error::ShortWrite {
                written,
                expected: report.len(),
            });
        }
        log::trace!(
            "frame 0x{:02X}: {} body bytes{}",
            spec.opcode,
            frame.body.len(),
            if frame.more { " (more)" } else { "" }
        );
        Ok(())
    }

    fn owe(&mut self, reply: ReplyShape, bytes: usize) {
        self.owed = match reply {
            ReplyShape::None => self.owed,
            ReplyShape::Status | ReplyShape::AckStream => Owed::Report,
            ReplyShape::Data if bytes > 0 => Owed::Bytes(bytes),
            ReplyShape::Data => Owed::Nothing,
        };
    }

    /// Read the reply to the command just sent
    ///
    /// For data replies, frames are read until `expected_len` bytes have
    /// arrived or the device sends an empty (terminal) frame. Any failure
    /// discards what was collected so far.
    pub fn receive(&mut self, spec: &CommandSpec, expected_len: usize) -> Result<RawReply> {
        let mut buf = [0u8; REPORT_SIZE];

        match spec.reply {
            ReplyShape::None => Ok(RawReply::None),
            ReplyShape::Status => {
                let n = self.read_report(&mut buf)?;
                self.owed = Owed::Nothing;
                Ok(RawReply::Frames(vec![parse_reply_frame(&buf[..n])?]))
            }
            ReplyShape::AckStream => {
                let n = self.read_report(&mut buf)?;
                self.owed = Owed::Nothing;
                Ok(RawReply::Stream(parse_stream_reply(&buf[..n])?))
            }
            ReplyShape::Data => {
                let mut frames = Vec::new();
                let mut total = 0;
                while total < expected_len {
                    let n = self.read_report(&mut buf)?;
                    let frame = match parse_reply_frame(&buf[..n]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            // The report is out of the pipe even if unreadable
                            self.consume(MAX_FRAME_PAYLOAD);
                            return Err(e);
                        }
                    };
                    let len = frame.data.len();
                    total += len;
                    self.consume(len);
                    frames.push(frame);
                    if len == 0 {
                        break;
                    }
                }
                self.owed = Owed::Nothing;
                Ok(RawReply::Frames(frames))
            }
        }
    }

    /// Drain reply bytes left over from a failed exchange
    ///
    /// Returns `SessionDesynced` if the device does not deliver them within
    /// the timeout. The debt is forgotten either way, so the error is
    /// reported once.
    pub fn resync(&mut self) -> Result<()> {
        let mut buf = [0u8; REPORT_SIZE];

        loop {
            match self.owed {
                Owed::Nothing => return Ok(()),
                Owed::Report => {
                    self.drain_one(&mut buf)?;
                    self.owed = Owed::Nothing;
                }
                Owed::Bytes(owed) => {
                    let n = self.drain_one(&mut buf)?;
                    // A frame we cannot parse still came out of the pipe
                    let len = parse_reply_frame(&buf[..n])
                        .map(|f| f.data.len())
                        .unwrap_or(MAX_FRAME_PAYLOAD);
                    if len == 0 {
                        self.owed = Owed::Nothing;
                    } else {
                        self.consume(len);
                    }
                }
            }
        }
    }

    /// Count `len` reply bytes as delivered
    fn consume(&mut self, len: usize) {
        self.owed = match self.owed {
            Owed::Bytes(owed) if owed > len => Owed::Bytes(owed - len),
            _ => Owed::Nothing,
        };
    }

    fn drain_one(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.transport.read(buf, self.timeout_ms) {
            Ok(0) | Err(_) => {
                log::warn!("Could not drain stale reply ({:?} outstanding)", self.owed);
                self.owed = Owed::Nothing;
                Err(Ch347Error::SessionDesynced)
            }
            Ok(n) => {
                log::debug!("Drained {} stale reply bytes", n);
                Ok(n)
            }
        }
    }

    fn read_report(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.transport.read(buf, self.timeout_ms)?;
        if n == 0 {
            return Err(Ch347Error::Timeout);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{spec, CommandKind};
    use std::collections::VecDeque;

    /// Transport returning canned reports
    #[derive(Default)]
    struct Scripted {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        fail_write_at: Option<usize>,
    }

    impl HidTransport for Scripted {
        fn write(&mut self, report: &[u8]) -> Result<usize> {
            if self.fail_write_at == Some(self.written.len()) {
                return Err(Ch347Error::Transport("unplugged".into()));
            }
            self.written.push(report.to_vec());
            Ok(report.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            match self.replies.pop_front() {
                Some(r) => {
                    buf[..r.len()].copy_from_slice(&r);
                    Ok(r.len())
                }
                None => Ok(0),
            }
        }
    }

    fn data_frame(opcode: u8, data: &[u8]) -> Vec<u8> {
        let mut r = ((data.len() + 3) as u16).to_le_bytes().to_vec();
        r.push(opcode);
        r.extend_from_slice(&(data.len() as u16).to_le_bytes());
        r.extend_from_slice(data);
        r
    }

    #[test]
    fn test_split_chunks_large_payload() {
        let payload = vec![0xA5u8; 1200];
        let frames = split(spec(CommandKind::SpiTransfer), &payload).unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| f.body.len() - 3).collect();
        assert_eq!(sizes, [507, 507, 186]);
        assert!(frames[0].more && frames[1].more && !frames[2].more);
        assert_eq!(frames[2].body[..3], [CMD_SPI_OUT_IN, 186, 0]);
    }

    #[test]
    fn test_report_layout() {
        let report = build_report(&[CMD_SPI_OUT_IN, 2, 0, 0xAA, 0x55]);
        assert_eq!(report.len(), 513);
        assert_eq!(report[..8], [0x00, 5, 0, 0xC2, 2, 0, 0xAA, 0x55]);
        assert!(report[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stream_too_long_rejected() {
        let body = vec![0u8; 511];
        assert!(split(spec(CommandKind::I2cTransaction), &body).is_err());
    }

    #[test]
    fn test_short_reply_is_malformed() {
        for len in 0..MIN_REPLY_FRAME {
            let report = vec![0xFFu8; len];
            let err = parse_reply_frame(&report).unwrap_err();
            assert!(err.is_malformed(), "len {}", len);
        }
    }

    #[test]
    fn test_payload_length_beyond_report_is_malformed() {
        let report = [8, 0, CMD_SPI_OUT_IN, 0xFF, 0x00, 1, 2, 3, 4, 5];
        assert!(parse_reply_frame(&report).unwrap_err().is_malformed());
    }

    #[test]
    fn test_receive_collects_frames() {
        let mut t = Scripted::default();
        t.replies.push_back(data_frame(CMD_SPI_OUT_IN, &[1, 2]));
        t.replies.push_back(data_frame(CMD_SPI_OUT_IN, &[3]));
        let mut framer = ReportFramer::new(t, 10);

        let s = spec(CommandKind::SpiTransfer);
        framer.send(s, &[9, 9, 9], 3).unwrap();
        let raw = framer.receive(s, 3).unwrap();
        match raw {
            RawReply::Frames(frames) => {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[0].data, [1, 2]);
                assert_eq!(frames[1].data, [3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!framer.is_draining());
    }

    #[test]
    fn test_timeout_leaves_debt_and_resync_drains() {
        let mut t = Scripted::default();
        t.replies.push_back(data_frame(CMD_SPI_OUT_IN, &[1, 2]));
        let mut framer = ReportFramer::new(t, 10);

        let s = spec(CommandKind::SpiTransfer);
        framer.send(s, &[0; 4], 4).unwrap();
        assert!(matches!(framer.receive(s, 4), Err(Ch347Error::Timeout)));
        assert!(framer.is_draining());

        // The late bytes show up now
        framer.transport.replies.push_back(data_frame(CMD_SPI_OUT_IN, &[3, 4]));
        framer.resync().unwrap();
        assert!(!framer.is_draining());
    }

    #[test]
    fn test_unparsable_frame_counts_against_debt() {
        let mut t = Scripted::default();
        // Claims more payload than the report carries
        t.replies.push_back(vec![8, 0, CMD_SPI_OUT_IN, 0xFF, 0x00, 1, 2, 3]);
        let mut framer = ReportFramer::new(t, 10);

        let s = spec(CommandKind::SpiTransfer);
        framer.send(s, &[0; 600], 600).unwrap();
        assert!(framer.receive(s, 600).unwrap_err().is_malformed());
        assert_eq!(framer.owed, Owed::Bytes(600 - MAX_FRAME_PAYLOAD));

        // Only the second frame is still on its way
        framer
            .transport
            .replies
            .push_back(data_frame(CMD_SPI_OUT_IN, &[0; 93]));
        framer.resync().unwrap();
        assert!(!framer.is_draining());
        assert!(framer.transport.replies.is_empty());
    }

    #[test]
    fn test_resync_reports_desync_once() {
        let mut framer = ReportFramer::new(Scripted::default(), 10);
        let s = spec(CommandKind::SpiConfig);
        framer.send(s, &[0; 26], 0).unwrap();

        assert!(matches!(framer.resync(), Err(Ch347Error::SessionDesynced)));
        assert!(framer.resync().is_ok());
    }

    #[test]
    fn test_write_failure_aborts_remaining_frames() {
        let t = Scripted {
            fail_write_at: Some(1),
            ..Default::default()
        };
        let mut framer = ReportFramer::new(t, 10);
        let s = spec(CommandKind::SpiTransfer);

        assert!(framer.send(s, &[0u8; 600], 600).is_err());
        assert_eq!(framer.transport.written.len(), 1);
        // Only the first frame went out, so only its reply is owed
        assert_eq!(framer.owed, Owed::Bytes(507));
    }

    #[test]
    fn test_read_owes_requested_count() {
        let mut framer = ReportFramer::new(Scripted::default(), 10);
        let s = spec(CommandKind::SpiRead);
        framer.send(s, &1000u32.to_le_bytes(), 1000).unwrap();
        assert_eq!(framer.owed, Owed::Bytes(1000));
    }
}
