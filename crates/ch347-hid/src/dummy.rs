//! In-memory CH347 emulator
//!
//! `DummyCh347` speaks the device side of the HID protocol so the engine
//! can be exercised without hardware. SPI is wired as a loopback (MOSI
//! shorted to MISO, the setup the vendor test uses); I2C targets are
//! simple register files with an auto-incrementing pointer.
//!
//! The handle is cheap to clone; clones share state, so a test can keep
//! one while the session owns the other.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{decode_stream, StreamOp};
use crate::error::{Ch347Error, Result};
use crate::framer::OUT_REPORT_LEN;
use crate::protocol::*;

/// Something the emulated device observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// SPI configuration received
    Configured,
    /// Chip select line changed (line, asserted)
    Cs(ChipSelect, bool),
    /// Bytes clocked on the SPI bus
    SpiClock(usize),
    /// I2C start condition from an idle bus
    I2cStart,
    /// I2C repeated start
    I2cRepeatedStart,
    /// I2C stop condition
    I2cStop,
    /// I2C speed change
    I2cSpeed(I2cSpeed),
    /// Device reset
    Reset,
}

/// Simulated I2C target
#[derive(Debug, Clone)]
pub struct I2cTarget {
    /// Register contents
    pub registers: [u8; 256],
    /// Current register pointer
    pub pointer: u8,
    /// Index of the written data byte the target refuses (0 is the
    /// register byte)
    pub nack_data_at: Option<usize>,
}

impl Default for I2cTarget {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
            nack_data_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    replies: VecDeque<Vec<u8>>,
    events: Vec<Event>,
    reports: usize,
    cs: [bool; 2],
    spi_config: Option<[u8; layout::SPI_CFG_LEN]>,
    reject_config: bool,
    mute_replies: usize,
    miso: VecDeque<u8>,
    targets: BTreeMap<u8, I2cTarget>,
    bus_busy: bool,
}

/// Emulated CH347 implementing the HID transport
#[derive(Debug, Clone, Default)]
pub struct DummyCh347 {
    state: Arc<Mutex<State>>,
}

impl DummyCh347 {
    /// Create an emulator with no I2C targets
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach an I2C target at a 7-bit address
    pub fn add_i2c_target(&self, address: u8, target: I2cTarget) {
        self.state().targets.insert(address, target);
    }

    /// Current register file of a target
    pub fn i2c_registers(&self, address: u8) -> Option<[u8; 256]> {
        self.state().targets.get(&address).map(|t| t.registers)
    }

    /// Reject SPI configuration commands with status 0x01
    pub fn set_reject_config(&self, reject: bool) {
        self.state().reject_config = reject;
    }

    /// Swallow the next `count` replies (they never arrive)
    pub fn mute_replies(&self, count: usize) {
        self.state().mute_replies = count;
    }

    /// Queue bytes returned by read-only SPI transfers
    pub fn queue_miso(&self, bytes: &[u8]) {
        self.state().miso.extend(bytes);
    }

    /// Inject a raw input report
    pub fn push_raw_reply(&self, report: Vec<u8>) {
        self.state().replies.push_back(report);
    }

    /// Everything observed so far
    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// Number of reports received
    pub fn reports_received(&self) -> usize {
        self.state().reports
    }

    /// Chip select line states
    pub fn cs_asserted(&self, cs: ChipSelect) -> bool {
        self.state().cs[cs as usize]
    }

    /// Last SPI configuration payload accepted
    pub fn spi_config(&self) -> Option<[u8; layout::SPI_CFG_LEN]> {
        self.state().spi_config
    }

    /// Whether an I2C transaction is holding the bus
    pub fn i2c_bus_busy(&self) -> bool {
        self.state().bus_busy
    }
}

impl State {
    fn reply(&mut self, body: &[u8]) {
        if self.mute_replies > 0 {
            self.mute_replies -= 1;
            return;
        }
        let mut report = (body.len() as u16).to_le_bytes().to_vec();
        report.extend_from_slice(body);
        self.replies.push_back(report);
    }

    fn reply_sized(&mut self, opcode: u8, data: &[u8]) {
        let mut body = vec![opcode];
        body.extend_from_slice(&(data.len() as u16).to_le_bytes());
        body.extend_from_slice(data);
        self.reply(&body);
    }

    fn handle(&mut self, body: &[u8]) -> Result<()> {
        let (&opcode, rest) = body
            .split_first()
            .ok_or_else(|| Ch347Error::InvalidParameter("empty report body".into()))?;

        if opcode == CMD_I2C_STREAM {
            return self.handle_stream(body);
        }

        if rest.len() < 2 {
            return Err(Ch347Error::InvalidParameter("truncated command".into()));
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let payload = rest
            .get(2..2 + len)
            .ok_or_else(|| Ch347Error::InvalidParameter("payload overruns report".into()))?;

        match opcode {
            CMD_SPI_SET_CFG => {
                let status = if self.reject_config {
                    0x01
                } else {
                    let mut cfg = [0u8; layout::SPI_CFG_LEN];
                    cfg.copy_from_slice(payload.get(..layout::SPI_CFG_LEN).ok_or_else(|| {
                        Ch347Error::InvalidParameter("short SPI config".into())
                    })?);
                    self.spi_config = Some(cfg);
                    self.events.push(Event::Configured);
                    STATUS_OK
                };
                self.reply_sized(opcode, &[status]);
            }
            CMD_SPI_CS_CTRL => {
                for cs in [ChipSelect::CS1, ChipSelect::CS2] {
                    let ctrl = payload
                        .get(cs as usize * layout::CS_BLOCK_LEN + layout::CS_BLOCK_CTRL)
                        .copied()
                        .unwrap_or(0);
                    match ctrl {
                        0x80 => self.set_cs(cs, true),
                        0xC0 => self.set_cs(cs, false),
                        _ => {}
                    }
                }
            }
            CMD_SPI_OUT_IN => {
                self.events.push(Event::SpiClock(payload.len()));
                self.reply_sized(opcode, payload);
            }
            CMD_SPI_OUT => {
                self.events.push(Event::SpiClock(payload.len()));
            }
            CMD_SPI_IN => {
                let mut count = [0u8; 4];
                count.copy_from_slice(
                    payload
                        .get(..4)
                        .ok_or_else(|| Ch347Error::InvalidParameter("short read count".into()))?,
                );
                let count = u32::from_le_bytes(count) as usize;
                self.events.push(Event::SpiClock(count));
                let data: Vec<u8> = (0..count)
                    .map(|_| self.miso.pop_front().unwrap_or(0xFF))
                    .collect();
                for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
                    self.reply_sized(opcode, chunk);
                }
            }
            CMD_DEVICE_RESET => {
                self.events.push(Event::Reset);
                self.cs = [false; 2];
                self.bus_busy = false;
                self.reply_sized(opcode, &[STATUS_OK]);
            }
            other => log::warn!("dummy: ignoring unknown opcode 0x{:02X}", other),
        }
        Ok(())
    }

    fn set_cs(&mut self, cs: ChipSelect, asserted: bool) {
        self.cs[cs as usize] = asserted;
        self.events.push(Event::Cs(cs, asserted));
    }

    fn handle_stream(&mut self, body: &[u8]) -> Result<()> {
        let ops = decode_stream(body)?;
        let mut out = Vec::new();
        let mut has_data_ops = false;
        // (address, read direction, data bytes seen)
        let mut selected: Option<(u8, bool, usize)> = None;
        let mut expect_address = false;
        let mut aborted = false;

        for op in ops {
            match op {
                StreamOp::Set(speed) => self.events.push(Event::I2cSpeed(speed)),
                StreamOp::Start => {
                    self.events.push(if self.bus_busy {
                        Event::I2cRepeatedStart
                    } else {
                        Event::I2cStart
                    });
                    self.bus_busy = true;
                    expect_address = true;
                    aborted = false;
                }
                StreamOp::Stop => {
                    self.events.push(Event::I2cStop);
                    self.bus_busy = false;
                    selected = None;
                }
                StreamOp::Out(bytes) => {
                    has_data_ops = true;
                    for byte in bytes {
                        let ack = if aborted {
                            false
                        } else if expect_address {
                            expect_address = false;
                            let address = byte >> 1;
                            let read = byte & 1 == 1;
                            let present = self.targets.contains_key(&address);
                            selected = present.then_some((address, read, 0));
                            present
                        } else {
                            self.target_write(&mut selected, byte)
                        };
                        if !ack {
                            aborted = true;
                        }
                        out.push(u8::from(ack));
                    }
                }
                StreamOp::In(n) => {
                    has_data_ops = true;
                    let count = if n == 0 { 1 } else { n as usize };
                    for _ in 0..count {
                        out.push(self.target_read(&selected, aborted));
                    }
                }
            }
        }

        if has_data_ops {
            self.reply(&out);
        }
        Ok(())
    }

    fn target_write(&mut self, selected: &mut Option<(u8, bool, usize)>, byte: u8) -> bool {
        let Some((address, false, index)) = selected else {
            return false;
        };
        let Some(target) = self.targets.get_mut(address) else {
            return false;
        };
        if target.nack_data_at == Some(*index) {
            return false;
        }
        if *index == 0 {
            target.pointer = byte;
        } else {
            target.registers[target.pointer as usize] = byte;
            target.pointer = target.pointer.wrapping_add(1);
        }
        *index += 1;
        true
    }

    fn target_read(&mut self, selected: &Option<(u8, bool, usize)>, aborted: bool) -> u8 {
        match selected {
            Some((address, true, _)) if !aborted => match self.targets.get_mut(address) {
                Some(target) => {
                    let value = target.registers[target.pointer as usize];
                    target.pointer = target.pointer.wrapping_add(1);
                    value
                }
                None => 0xFF,
            },
            _ => 0xFF,
        }
    }
}

impl crate::transport::HidTransport for DummyCh347 {
    fn write(&mut self, report: &[u8]) -> Result<usize> {
        if report.len() != OUT_REPORT_LEN || report[0] != REPORT_ID {
            return Err(Ch347Error::Transport(format!(
                "dummy: bad report of {} bytes",
                report.len()
            )));
        }
        let body_len = u16::from_le_bytes([report[1], report[2]]) as usize;
        let body = report
            .get(3..3 + body_len)
            .ok_or_else(|| Ch347Error::Transport("dummy: body overruns report".into()))?;

        let mut state = self.state();
        state.reports += 1;
        state.handle(body)?;
        Ok(report.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
        match self.state().replies.pop_front() {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HidTransport;

    #[test]
    fn test_loopback_reply() {
        let mut dev = DummyCh347::new();
        let mut report = [0u8; OUT_REPORT_LEN];
        report[1..8].copy_from_slice(&[5, 0, CMD_SPI_OUT_IN, 2, 0, 0xAA, 0x55]);
        dev.write(&report).unwrap();

        let mut buf = [0u8; REPORT_SIZE];
        let n = dev.read(&mut buf, 10).unwrap();
        assert_eq!(buf[..n], [5, 0, CMD_SPI_OUT_IN, 2, 0, 0xAA, 0x55]);
        assert_eq!(dev.read(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_register_target() {
        let dev = DummyCh347::new();
        dev.add_i2c_target(0x50, I2cTarget::default());

        let mut state = dev.state();
        let write = crate::codec::encode_stream(&[
            StreamOp::Start,
            StreamOp::Out(vec![0xA0, 0x10, 0x42]),
            StreamOp::Stop,
        ]);
        state.handle(&write).unwrap();
        assert_eq!(state.replies.pop_front().unwrap(), [3, 0, 1, 1, 1]);
        assert_eq!(state.targets[&0x50].registers[0x10], 0x42);
        assert!(!state.bus_busy);
    }
}
