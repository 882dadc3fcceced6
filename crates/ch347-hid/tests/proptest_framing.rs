//! Property-based tests for HID report framing and reply decoding.
//!
//! Arbitrary reply bytes must decode to a typed error or a well-formed
//! frame, never panic; frames cut from a payload must join back into it.

use ch347_hid::codec::{self, spec, Command, CommandKind, I2cTransaction, RawReply, ReplyFrame};
use ch347_hid::framer::{build_report, parse_reply_frame, split, OUT_REPORT_LEN};
use ch347_hid::protocol::{CMD_SPI_OUT_IN, MAX_FRAME_PAYLOAD, MIN_REPLY_FRAME, REPORT_SIZE};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Replies shorter than the header are malformed.
    #[test]
    fn prop_short_reply_is_malformed(data in proptest::collection::vec(any::<u8>(), 0..MIN_REPLY_FRAME)) {
        let err = parse_reply_frame(&data).err();
        prop_assert!(err.as_ref().is_some_and(|e| e.is_malformed()), "got {:?}", err);
    }

    /// Any reply parses or fails with a typed error; parsed data stays inside the report.
    #[test]
    fn prop_reply_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..=REPORT_SIZE)) {
        if let Ok(frame) = parse_reply_frame(&data) {
            prop_assert!(frame.data.len() + MIN_REPLY_FRAME <= data.len());
        }
    }

    /// Frames of a sized command carry the payload in order, each within one report.
    #[test]
    fn prop_split_preserves_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let frames = split(spec(CommandKind::SpiTransfer), &payload)
            .map_err(|e| TestCaseError::fail(format!("{e:?}")))?;
        let mut joined = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            prop_assert_eq!(frame.body[0], CMD_SPI_OUT_IN);
            let len = u16::from_le_bytes([frame.body[1], frame.body[2]]) as usize;
            prop_assert!(len <= MAX_FRAME_PAYLOAD);
            prop_assert_eq!(frame.more, i + 1 != frames.len());
            prop_assert_eq!(build_report(&frame.body).len(), OUT_REPORT_LEN);
            joined.extend_from_slice(&frame.body[3..3 + len]);
        }
        prop_assert_eq!(joined, payload);
    }

    /// SPI replies decode only when the byte count matches exactly.
    #[test]
    fn prop_spi_length_is_strict(
        sent in proptest::collection::vec(any::<u8>(), 1..1024),
        returned in 0usize..1100,
    ) {
        let cmd = Command::SpiTransfer(&sent);
        let raw = RawReply::Frames(vec![ReplyFrame { opcode: CMD_SPI_OUT_IN, data: vec![0; returned] }]);
        let result = codec::decode(raw, &cmd);
        prop_assert_eq!(result.is_ok(), returned == sent.len());
    }

    /// I2C reads accept up to the requested number of bytes, never more.
    #[test]
    fn prop_i2c_read_is_bounded(read_len in 1usize..=63, returned in 0usize..80) {
        let t = I2cTransaction { address: 0x50, write: &[], read_len };
        let cmd = Command::I2cTransaction(t);
        let mut body = vec![1u8];
        body.extend(std::iter::repeat(0xA5).take(returned));
        let result = codec::decode(RawReply::Stream(body), &cmd);
        prop_assert_eq!(result.is_ok(), returned <= read_len);
    }
}
