//! Command codec
//!
//! Turns typed [`Command`]s into the bytes the CH347 expects and checks the
//! raw replies collected by the framer against the command that caused them.
//!
//! How each opcode is framed and what it answers with is kept in
//! [`COMMAND_TABLE`]; the field offsets inside payloads are in
//! [`crate::protocol::layout`]. Fixing a wrong mapping means editing those
//! tables, not the bus controllers.

use crate::error::{Ch347Error, NackPhase, Result};
use crate::protocol::*;

/// How a command is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `[opcode][payload_len u16 LE][payload]`, split into several frames
    /// when the payload is larger than one report
    Sized,
    /// `[0xAA][ops...][END]`, always a single frame
    Stream,
}

/// What the device sends back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Nothing
    None,
    /// One sized frame echoing the opcode, first payload byte is a status
    Status,
    /// Sized frames echoing the opcode, carrying the requested data bytes
    Data,
    /// One stream frame: an ack byte per written byte, then read bytes
    AckStream,
}

/// Which command a [`CommandSpec`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// SPI configuration
    SpiConfig,
    /// Chip select control
    SpiCsControl,
    /// Full-duplex SPI transfer
    SpiTransfer,
    /// Read-only SPI transfer
    SpiRead,
    /// Write-only SPI transfer
    SpiWrite,
    /// I2C speed configuration
    I2cConfig,
    /// I2C start/address/data/stop transaction
    I2cTransaction,
    /// Bare I2C stop condition
    I2cStop,
    /// Device reset / configuration query
    Reset,
}

/// Wire description of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command kind
    pub kind: CommandKind,
    /// Opcode byte
    pub opcode: u8,
    /// Frame layout
    pub framing: Framing,
    /// Reply layout
    pub reply: ReplyShape,
}

/// Opcode and reply table for every command the engine can issue
pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        kind: CommandKind::SpiConfig,
        opcode: CMD_SPI_SET_CFG,
        framing: Framing::Sized,
        reply: ReplyShape::Status,
    },
    CommandSpec {
        kind: CommandKind::SpiCsControl,
        opcode: CMD_SPI_CS_CTRL,
        framing: Framing::Sized,
        reply: ReplyShape::None,
    },
    CommandSpec {
        kind: CommandKind::SpiTransfer,
        opcode: CMD_SPI_OUT_IN,
        framing: Framing::Sized,
        reply: ReplyShape::Data,
    },
    CommandSpec {
        kind: CommandKind::SpiRead,
        opcode: CMD_SPI_IN,
        framing: Framing::Sized,
        reply: ReplyShape::Data,
    },
    CommandSpec {
        kind: CommandKind::SpiWrite,
        opcode: CMD_SPI_OUT,
        framing: Framing::Sized,
        reply: ReplyShape::None,
    },
    CommandSpec {
        kind: CommandKind::I2cConfig,
        opcode: CMD_I2C_STREAM,
        framing: Framing::Stream,
        reply: ReplyShape::None,
    },
    CommandSpec {
        kind: CommandKind::I2cTransaction,
        opcode: CMD_I2C_STREAM,
        framing: Framing::Stream,
        reply: ReplyShape::AckStream,
    },
    CommandSpec {
        kind: CommandKind::I2cStop,
        opcode: CMD_I2C_STREAM,
        framing: Framing::Stream,
        reply: ReplyShape::None,
    },
    CommandSpec {
        kind: CommandKind::Reset,
        opcode: CMD_DEVICE_RESET,
        framing: Framing::Sized,
        reply: ReplyShape::Status,
    },
];

/// Look up the wire description of a command kind
pub fn spec(kind: CommandKind) -> &'static CommandSpec {
    COMMAND_TABLE
        .iter()
        .find(|s| s.kind == kind)
        .unwrap_or(&COMMAND_TABLE[0])
}

/// What to do with one chip select line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsAction {
    /// Leave the line as it is
    #[default]
    Keep,
    /// Assert (select)
    Assert,
    /// Deassert (deselect)
    Deassert,
}

impl CsAction {
    fn ctrl_byte(self) -> u8 {
        match self {
            CsAction::Keep => 0x00,
            CsAction::Assert => 0x80,
            CsAction::Deassert => 0xC0,
        }
    }
}

/// Chip select control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CsControl {
    /// Action for CS1
    pub cs1: CsAction,
    /// Action for CS2
    pub cs2: CsAction,
    /// Delays applied to the changed lines
    pub timing: CsTiming,
}

impl CsControl {
    /// Apply `action` to `cs` and leave the other line alone
    pub fn single(cs: ChipSelect, action: CsAction, timing: CsTiming) -> Self {
        let mut ctrl = Self {
            timing,
            ..Self::default()
        };
        match cs {
            ChipSelect::CS1 => ctrl.cs1 = action,
            ChipSelect::CS2 => ctrl.cs2 = action,
        }
        ctrl
    }
}

/// I2C transaction request
///
/// A non-empty `write` (or a zero `read_len`) produces a write phase; a
/// non-zero `read_len` produces a read phase, behind a repeated start when
/// both are present. The bus is always released with a stop at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cTransaction<'a> {
    /// 7-bit target address
    pub address: u8,
    /// Bytes written after the address
    pub write: &'a [u8],
    /// Number of bytes to read
    pub read_len: usize,
}

impl I2cTransaction<'_> {
    fn has_write_phase(&self) -> bool {
        !self.write.is_empty() || self.read_len == 0
    }

    fn has_read_phase(&self) -> bool {
        self.read_len > 0
    }

    /// Number of ack bytes the device returns for this transaction
    pub fn ack_count(&self) -> usize {
        let mut n = 0;
        if self.has_write_phase() {
            n += 1 + self.write.len();
        }
        if self.has_read_phase() {
            n += 1;
        }
        n
    }

    /// Map an ack index back to the phase and byte it belongs to
    fn locate_ack(&self, ack_index: usize) -> (NackPhase, usize) {
        if self.has_write_phase() {
            if ack_index == 0 {
                return (NackPhase::WriteAddress, 0);
            }
            if ack_index <= self.write.len() {
                return (NackPhase::Data, ack_index - 1);
            }
        }
        (NackPhase::ReadAddress, 0)
    }
}

/// A request understood by the CH347
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Apply an SPI configuration
    SpiConfig(&'a SpiConfig),
    /// Change chip select lines
    SpiCsControl(CsControl),
    /// Clock out the bytes and return what was clocked in
    SpiTransfer(&'a [u8]),
    /// Clock in this many bytes
    SpiRead(u32),
    /// Clock out the bytes and discard the input
    SpiWrite(&'a [u8]),
    /// Set the I2C bus speed
    I2cConfig(I2cSpeed),
    /// Run one I2C transaction
    I2cTransaction(I2cTransaction<'a>),
    /// Issue a bare stop condition
    I2cStop,
    /// Reset the device
    Reset,
}

impl Command<'_> {
    /// Command kind
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SpiConfig(_) => CommandKind::SpiConfig,
            Command::SpiCsControl(_) => CommandKind::SpiCsControl,
            Command::SpiTransfer(_) => CommandKind::SpiTransfer,
            Command::SpiRead(_) => CommandKind::SpiRead,
            Command::SpiWrite(_) => CommandKind::SpiWrite,
            Command::I2cConfig(_) => CommandKind::I2cConfig,
            Command::I2cTransaction(_) => CommandKind::I2cTransaction,
            Command::I2cStop => CommandKind::I2cStop,
            Command::Reset => CommandKind::Reset,
        }
    }

    /// Wire description from [`COMMAND_TABLE`]
    pub fn spec(&self) -> &'static CommandSpec {
        spec(self.kind())
    }

    /// Number of data bytes the reply must carry
    pub fn expected_reply_len(&self) -> usize {
        match self {
            Command::SpiTransfer(data) => data.len(),
            Command::SpiRead(len) => *len as usize,
            Command::I2cTransaction(t) => t.ack_count() + t.read_len,
            _ => 0,
        }
    }
}

/// One op inside an I2C stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    /// Set bus speed
    Set(I2cSpeed),
    /// Start or repeated start
    Start,
    /// Stop
    Stop,
    /// Write bytes (at most 63)
    Out(Vec<u8>),
    /// Read bytes: n > 0 reads n ACKed bytes, n = 0 reads one NACKed byte
    In(u8),
}

impl StreamOp {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            StreamOp::Set(speed) => buf.push(stream::SET | speed.level()),
            StreamOp::Start => buf.push(stream::START),
            StreamOp::Stop => buf.push(stream::STOP),
            StreamOp::Out(data) => {
                buf.push(stream::OUT | data.len() as u8);
                buf.extend_from_slice(data);
            }
            StreamOp::In(n) => buf.push(stream::IN | n),
        }
    }
}

/// Address byte with the R/W bit
fn address_byte(address: u8, read: bool) -> u8 {
    (address << 1) | u8::from(read)
}

/// Build the op list for a transaction
pub fn transaction_ops(t: &I2cTransaction<'_>) -> Vec<StreamOp> {
    let mut ops = Vec::new();

    if t.has_write_phase() {
        ops.push(StreamOp::Start);
        let mut bytes = Vec::with_capacity(1 + t.write.len());
        bytes.push(address_byte(t.address, false));
        bytes.extend_from_slice(t.write);
        ops.extend(
            bytes
                .chunks(stream::MAX_OP_LEN)
                .map(|chunk| StreamOp::Out(chunk.to_vec())),
        );
    }

    if t.has_read_phase() {
        ops.push(StreamOp::Start);
        ops.push(StreamOp::Out(vec![address_byte(t.address, true)]));
        if t.read_len > 1 {
            ops.push(StreamOp::In((t.read_len - 1) as u8));
        }
        ops.push(StreamOp::In(0));
    }

    ops.push(StreamOp::Stop);
    ops
}

fn validate(cmd: &Command<'_>) -> Result<()> {
    match cmd {
        Command::SpiTransfer(data) | Command::SpiWrite(data) if data.len() > MAX_SPI_COMMAND_LEN => {
            Err(Ch347Error::InvalidParameter(format!(
                "SPI command of {} bytes exceeds {} bytes",
                data.len(),
                MAX_SPI_COMMAND_LEN
            )))
        }
        Command::SpiRead(len) if *len as usize > MAX_SPI_COMMAND_LEN => {
            Err(Ch347Error::InvalidParameter(format!(
                "SPI read of {} bytes exceeds {} bytes",
                len, MAX_SPI_COMMAND_LEN
            )))
        }
        Command::I2cTransaction(t) => {
            if t.address > 0x7F {
                return Err(Ch347Error::InvalidParameter(format!(
                    "I2C address 0x{:02X} is not a 7-bit address",
                    t.address
                )));
            }
            if t.read_len > stream::MAX_OP_LEN {
                return Err(Ch347Error::InvalidParameter(format!(
                    "I2C read of {} bytes exceeds {} bytes",
                    t.read_len,
                    stream::MAX_OP_LEN
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Encode a command into its payload (sized commands) or stream body
///
/// For [`Framing::Sized`] the result is the payload only; the framer adds
/// opcode and length to every frame it cuts from it. For
/// [`Framing::Stream`] the result is the whole body including the leading
/// `0xAA` and trailing `END`.
pub fn encode(cmd: &Command<'_>) -> Result<Vec<u8>> {
    validate(cmd)?;

    let bytes = match cmd {
        Command::SpiConfig(config) => encode_spi_config(config).to_vec(),
        Command::SpiCsControl(ctrl) => encode_cs_control(ctrl).to_vec(),
        Command::SpiTransfer(data) | Command::SpiWrite(data) => data.to_vec(),
        Command::SpiRead(len) => len.to_le_bytes().to_vec(),
        Command::I2cConfig(speed) => encode_stream(&[StreamOp::Set(*speed)]),
        Command::I2cTransaction(t) => encode_stream(&transaction_ops(t)),
        Command::I2cStop => encode_stream(&[StreamOp::Stop]),
        Command::Reset => layout::RESET_PAYLOAD.to_vec(),
    };

    Ok(bytes)
}

/// Build the SPI_SET_CFG payload
pub fn encode_spi_config(config: &SpiConfig) -> [u8; layout::SPI_CFG_LEN] {
    let mut buf = layout::SPI_CFG_TEMPLATE;

    buf[layout::SPI_CFG_CPOL] = config.mode.cpol() << 1;
    buf[layout::SPI_CFG_CPHA] = config.mode.cpha();
    buf[layout::SPI_CFG_CLOCK] = (config.speed.divisor() & 0x7) << 3;
    buf[layout::SPI_CFG_BIT_ORDER] = match config.bit_order {
        BitOrder::MsbFirst => 0x00,
        BitOrder::LsbFirst => 0x80,
    };
    buf[layout::SPI_CFG_INTERVAL..layout::SPI_CFG_INTERVAL + 2]
        .copy_from_slice(&config.interval_us.to_le_bytes());
    buf[layout::SPI_CFG_CS_POLARITY] = config.active_high().bits();

    buf
}

/// Build the SPI_CS_CTRL payload
pub fn encode_cs_control(ctrl: &CsControl) -> [u8; layout::CS_CTRL_LEN] {
    let mut buf = [0u8; layout::CS_CTRL_LEN];

    for (block, action) in [ctrl.cs1, ctrl.cs2].into_iter().enumerate() {
        if action == CsAction::Keep {
            continue;
        }
        let base = block * layout::CS_BLOCK_LEN;
        buf[base + layout::CS_BLOCK_CTRL] = action.ctrl_byte();
        let assert = base + layout::CS_BLOCK_ASSERT_DELAY;
        buf[assert..assert + 2].copy_from_slice(&ctrl.timing.assert_delay_us.to_le_bytes());
        let deassert = base + layout::CS_BLOCK_DEASSERT_DELAY;
        buf[deassert..deassert + 2].copy_from_slice(&ctrl.timing.deassert_delay_us.to_le_bytes());
    }

    buf
}

/// Build a stream body from ops
pub fn encode_stream(ops: &[StreamOp]) -> Vec<u8> {
    let mut buf = vec![CMD_I2C_STREAM];
    for op in ops {
        op.encode_into(&mut buf);
    }
    buf.push(stream::END);
    buf
}

/// Parse a stream body back into ops
pub fn decode_stream(body: &[u8]) -> Result<Vec<StreamOp>> {
    let (&first, mut rest) = body
        .split_first()
        .ok_or_else(|| Ch347Error::MalformedResponse("empty stream".into()))?;
    if first != CMD_I2C_STREAM {
        return Err(Ch347Error::OpcodeMismatch {
            expected: CMD_I2C_STREAM,
            actual: first,
        });
    }

    let mut ops = Vec::new();
    loop {
        let (&op, tail) = rest
            .split_first()
            .ok_or_else(|| Ch347Error::MalformedResponse("stream without END".into()))?;
        rest = tail;
        match op {
            stream::END => return Ok(ops),
            stream::START => ops.push(StreamOp::Start),
            stream::STOP => ops.push(StreamOp::Stop),
            _ if op & 0xC0 == stream::IN => ops.push(StreamOp::In(op & 0x3F)),
            _ if op & 0xC0 == stream::OUT => {
                let n = (op & 0x3F) as usize;
                if rest.len() < n {
                    return Err(Ch347Error::MalformedResponse(format!(
                        "OUT op of {} bytes truncated",
                        n
                    )));
                }
                ops.push(StreamOp::Out(rest[..n].to_vec()));
                rest = &rest[n..];
            }
            _ if op & 0xFC == stream::SET => {
                // Level is two bits wide, so from_level cannot fail here
                ops.push(StreamOp::Set(
                    I2cSpeed::from_level(op & 0x03).unwrap_or_default(),
                ));
            }
            _ => {
                return Err(Ch347Error::MalformedResponse(format!(
                    "unknown stream op 0x{:02X}",
                    op
                )))
            }
        }
    }
}

/// One reply frame as cut out of a report by the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    /// Echoed opcode
    pub opcode: u8,
    /// Payload bytes
    pub data: Vec<u8>,
}

/// Reply bytes collected by the framer for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawReply {
    /// No reply was expected
    None,
    /// Sized frames in arrival order
    Frames(Vec<ReplyFrame>),
    /// Body of a stream reply
    Stream(Vec<u8>),
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command accepted
    Ack,
    /// Data returned by the device
    Data(Vec<u8>),
}

/// Check a raw reply against the command that produced it
pub fn decode(raw: RawReply, expected: &Command<'_>) -> Result<Response> {
    let spec = expected.spec();

    match (spec.reply, raw) {
        (ReplyShape::None, _) => Ok(Response::Ack),
        (ReplyShape::Status, RawReply::Frames(frames)) => {
            let frame = frames
                .first()
                .ok_or_else(|| Ch347Error::MalformedResponse("no status frame".into()))?;
            check_echo(spec.opcode, frame.opcode)?;
            let status = frame.data.first().copied().ok_or_else(|| {
                Ch347Error::MalformedResponse("status frame without status byte".into())
            })?;
            if status != STATUS_OK {
                return Err(Ch347Error::Rejected {
                    opcode: spec.opcode,
                    status,
                });
            }
            Ok(Response::Ack)
        }
        (ReplyShape::Data, RawReply::Frames(frames)) => {
            let mut data = Vec::with_capacity(expected.expected_reply_len());
            for frame in frames {
                check_echo(spec.opcode, frame.opcode)?;
                data.extend_from_slice(&frame.data);
            }
            if data.len() != expected.expected_reply_len() {
                return Err(Ch347Error::LengthMismatch {
                    expected: expected.expected_reply_len(),
                    actual: data.len(),
                });
            }
            Ok(Response::Data(data))
        }
        (ReplyShape::AckStream, RawReply::Stream(body)) => match expected {
            Command::I2cTransaction(t) => decode_i2c_reply(&body, t),
            _ => Err(Ch347Error::MalformedResponse(
                "stream reply for a sized command".into(),
            )),
        },
        (shape, raw) => Err(Ch347Error::MalformedResponse(format!(
            "{:?} reply expected, got {:?}",
            shape, raw
        ))),
    }
}

fn check_echo(expected: u8, actual: u8) -> Result<()> {
    if expected != actual {
        return Err(Ch347Error::OpcodeMismatch { expected, actual });
    }
    Ok(())
}

fn decode_i2c_reply(body: &[u8], t: &I2cTransaction<'_>) -> Result<Response> {
    let acks = t.ack_count();

    for i in 0..acks {
        match body.get(i) {
            Some(&stream::ACK) => {}
            Some(_) => {
                let (phase, index) = t.locate_ack(i);
                return Err(Ch347Error::DeviceNack { phase, index });
            }
            None => {
                return Err(Ch347Error::MalformedResponse(format!(
                    "I2C reply has {} bytes, expected at least {} ack bytes",
                    body.len(),
                    acks
                )))
            }
        }
    }

    let data = &body[acks..];
    if data.len() > t.read_len {
        return Err(Ch347Error::MalformedResponse(format!(
            "I2C reply carries {} data bytes, {} requested",
            data.len(),
            t.read_len
        )));
    }
    Ok(Response::Data(data.to_vec()))
}
