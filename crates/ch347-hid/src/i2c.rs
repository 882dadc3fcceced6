//! I2C bus controller
//!
//! Every operation is sent as one stream report: start, address, data,
//! optional repeated start and read, stop. The device runs the whole stream
//! and answers with one ack byte per written byte followed by the data it
//! read, so the controller learns afterwards how far the transaction got.
//! [`BusState`] follows that walk; a NACK or any other failure ends in an
//! explicit stop so the bus is never left held.

use crate::codec::{Command, I2cTransaction};
use crate::error::{Ch347Error, NackPhase, Result};
use crate::protocol::*;
use crate::session::{Ch347, Link};
use crate::transport::HidTransport;

/// First address probed by [`I2cDevice::scan`]
pub const SCAN_FIRST: u8 = 0x08;
/// Last address probed by [`I2cDevice::scan`]
pub const SCAN_LAST: u8 = 0x77;

/// Where the last transaction left the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Released, no transaction since the last success
    Idle,
    /// Start (or repeated start) issued
    StartSent,
    /// Target acknowledged its address
    AddressAcked,
    /// Data bytes moving
    DataPhase,
    /// Stop issued
    StopSent,
    /// Transaction failed, stop still owed
    Abort,
}

impl BusState {
    fn can_move_to(self, next: BusState) -> bool {
        use BusState::*;
        matches!(
            (self, next),
            (Idle | StopSent, StartSent)
                | (StartSent, AddressAcked)
                | (AddressAcked, DataPhase)
                | (AddressAcked | DataPhase, StartSent)
                | (AddressAcked | DataPhase, StopSent)
                | (StartSent | AddressAcked | DataPhase, Abort)
                | (Abort, StopSent)
                | (StopSent, Idle)
        )
    }
}

/// I2C settings and bus state of a session
///
/// Lives behind the session lock, so every [`I2cDevice`] handle on one
/// session sees the same speed and bus state.
#[derive(Debug)]
pub(crate) struct I2cState {
    speed: Option<I2cSpeed>,
    bus: BusState,
}

impl Default for I2cState {
    fn default() -> Self {
        Self {
            speed: None,
            bus: BusState::Idle,
        }
    }
}

impl I2cState {
    fn move_to(&mut self, next: BusState) {
        debug_assert!(
            self.bus.can_move_to(next),
            "illegal I2C bus transition {:?} -> {:?}",
            self.bus,
            next
        );
        log::trace!("I2C bus {:?} -> {:?}", self.bus, next);
        self.bus = next;
    }

    fn walk_success(&mut self, t: &I2cTransaction<'_>) {
        if !t.write.is_empty() || t.read_len == 0 {
            self.move_to(BusState::AddressAcked);
            if !t.write.is_empty() {
                self.move_to(BusState::DataPhase);
            }
            if t.read_len > 0 {
                self.move_to(BusState::StartSent);
            }
        }
        if t.read_len > 0 {
            self.move_to(BusState::AddressAcked);
            self.move_to(BusState::DataPhase);
        }
        self.move_to(BusState::StopSent);
        self.move_to(BusState::Idle);
    }

    fn walk_nack(&mut self, t: &I2cTransaction<'_>, phase: NackPhase) {
        match phase {
            NackPhase::WriteAddress => {}
            NackPhase::Data => {
                self.move_to(BusState::AddressAcked);
                self.move_to(BusState::DataPhase);
            }
            NackPhase::ReadAddress => {
                if !t.write.is_empty() {
                    self.move_to(BusState::AddressAcked);
                    self.move_to(BusState::DataPhase);
                    self.move_to(BusState::StartSent);
                }
            }
        }
    }
}

/// I2C controller handle on a session
///
/// Handles are cheap. All of them share the session's speed and bus state;
/// a transaction and any stop forced after it run under the session lock.
pub struct I2cDevice<'a, T> {
    session: &'a Ch347<T>,
}

impl<'a, T: HidTransport> I2cDevice<'a, T> {
    pub(crate) fn new(session: &'a Ch347<T>) -> Self {
        Self { session }
    }

    /// Speed of the last accepted configuration
    pub fn speed(&self) -> Option<I2cSpeed> {
        self.session.link().i2c.speed
    }

    /// Current bus state
    pub fn bus_state(&self) -> BusState {
        self.session.link().i2c.bus
    }

    /// Set the bus clock
    pub fn configure(&mut self, speed: I2cSpeed) -> Result<()> {
        let mut link = self.session.link();
        link.execute(&Command::I2cConfig(speed))?;
        log::info!("I2C configured: {} kHz", speed.to_khz());
        link.i2c.speed = Some(speed);
        Ok(())
    }

    /// Write `data` to the target at `address`
    ///
    /// A NACK is reported with the index of the first refused byte.
    pub fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.run(I2cTransaction {
            address,
            write: data,
            read_len: 0,
        })
        .map(|_| ())
    }

    /// Read `len` bytes from the target at `address`
    pub fn read(&mut self, address: u8, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.run(I2cTransaction {
            address,
            write: &[],
            read_len: len,
        })
    }

    /// Write then read behind a repeated start, without releasing the bus
    pub fn write_then_read(
        &mut self,
        address: u8,
        write_data: &[u8],
        read_len: usize,
    ) -> Result<Vec<u8>> {
        self.run(I2cTransaction {
            address,
            write: write_data,
            read_len,
        })
    }

    /// Check whether a target answers at `address`
    pub fn probe(&mut self, address: u8) -> Result<bool> {
        match self.write(address, &[]) {
            Ok(()) => Ok(true),
            Err(Ch347Error::DeviceNack {
                phase: NackPhase::WriteAddress,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Probe every non-reserved 7-bit address
    pub fn scan(&mut self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for address in SCAN_FIRST..=SCAN_LAST {
            if self.probe(address)? {
                log::debug!("I2C target at 0x{:02X}", address);
                found.push(address);
            }
        }
        Ok(found)
    }

    /// Write `data` starting at register `register`
    pub fn write_register(&mut self, address: u8, register: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + data.len());
        buf.push(register);
        buf.extend_from_slice(data);
        self.write(address, &buf)
    }

    /// Read `len` bytes starting at register `register`
    pub fn read_register(&mut self, address: u8, register: u8, len: usize) -> Result<Vec<u8>> {
        self.write_then_read(address, &[register], len)
    }

    fn run(&mut self, t: I2cTransaction<'_>) -> Result<Vec<u8>> {
        if t.address > 0x7F {
            return Err(Ch347Error::InvalidParameter(format!(
                "I2C address 0x{:02X} is not a 7-bit address",
                t.address
            )));
        }
        if t.read_len > stream::MAX_OP_LEN {
            return Err(Ch347Error::InvalidParameter(format!(
                "I2C read of {} bytes exceeds {} bytes per transaction",
                t.read_len,
                stream::MAX_OP_LEN
            )));
        }

        let mut link = self.session.link();
        if link.i2c.speed.is_none() {
            return Err(Ch347Error::NotConfigured);
        }

        // A stop the last failure could not deliver goes out first
        if link.i2c.bus == BusState::Abort {
            release(&mut *link)?;
        }

        link.i2c.move_to(BusState::StartSent);
        match link.execute_data(&Command::I2cTransaction(t)) {
            Ok(data) => {
                link.i2c.walk_success(&t);
                Ok(data)
            }
            Err(e) => {
                if let Ch347Error::DeviceNack { phase, index } = e {
                    log::debug!(
                        "I2C 0x{:02X}: NACK on {} byte {}",
                        t.address,
                        phase,
                        index
                    );
                    link.i2c.walk_nack(&t, phase);
                }
                link.i2c.move_to(BusState::Abort);
                if let Err(stop_err) = release(&mut *link) {
                    log::warn!("I2C stop after failure did not go out: {}", stop_err);
                }
                Err(e)
            }
        }
    }
}

fn release<T: HidTransport>(link: &mut Link<T>) -> Result<()> {
    link.execute(&Command::I2cStop)?;
    link.i2c.move_to(BusState::StopSent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyCh347, Event, I2cTarget};

    fn setup() -> (DummyCh347, Ch347<DummyCh347>) {
        let dev = DummyCh347::new();
        let mut eeprom = I2cTarget::default();
        for (i, b) in eeprom.registers.iter_mut().enumerate() {
            *b = i as u8;
        }
        dev.add_i2c_target(0x50, eeprom);
        let ch347 = Ch347::new(dev.clone());
        (dev, ch347)
    }

    fn count(dev: &DummyCh347, event: &Event) -> usize {
        dev.events().iter().filter(|e| *e == event).count()
    }

    #[test]
    fn test_unconfigured_bus_refused() {
        let (_dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        assert!(matches!(i2c.write(0x50, &[0]), Err(Ch347Error::NotConfigured)));
    }

    #[test]
    fn test_write_then_read_uses_one_start() {
        let (dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed400K).unwrap();

        let data = i2c.write_then_read(0x50, &[0x10], 4).unwrap();
        assert_eq!(data, [0x10, 0x11, 0x12, 0x13]);
        assert_eq!(count(&dev, &Event::I2cStart), 1);
        assert_eq!(count(&dev, &Event::I2cRepeatedStart), 1);
        assert_eq!(count(&dev, &Event::I2cStop), 1);
        assert_eq!(dev.reports_received(), 2);
        assert_eq!(i2c.bus_state(), BusState::Idle);
    }

    #[test]
    fn test_register_write_and_read_back() {
        let (dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed100K).unwrap();

        i2c.write_register(0x50, 0x20, &[0xDE, 0xAD]).unwrap();
        assert_eq!(i2c.read_register(0x50, 0x20, 2).unwrap(), [0xDE, 0xAD]);
        assert_eq!(dev.i2c_registers(0x50).unwrap()[0x21], 0xAD);
    }

    #[test]
    fn test_data_nack_reports_index_and_releases_bus() {
        let (dev, ch347) = setup();
        dev.add_i2c_target(
            0x51,
            I2cTarget {
                nack_data_at: Some(2),
                ..I2cTarget::default()
            },
        );
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed100K).unwrap();

        let err = i2c.write(0x51, &[0x00, 0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(
            err,
            Ch347Error::DeviceNack {
                phase: NackPhase::Data,
                index: 2
            }
        ));
        assert_eq!(i2c.bus_state(), BusState::StopSent);
        assert!(!dev.i2c_bus_busy());
        // The stream's own stop plus the forced one
        assert_eq!(count(&dev, &Event::I2cStop), 2);
    }

    #[test]
    fn test_address_nack() {
        let (_dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed100K).unwrap();

        let err = i2c.read(0x23, 1).unwrap_err();
        assert!(matches!(
            err,
            Ch347Error::DeviceNack {
                phase: NackPhase::ReadAddress,
                index: 0
            }
        ));
        assert_eq!(i2c.bus_state(), BusState::StopSent);

        // The bus is usable again afterwards
        assert_eq!(i2c.read(0x50, 1).unwrap(), [0x00]);
        assert_eq!(i2c.bus_state(), BusState::Idle);
    }

    #[test]
    fn test_handles_share_speed_and_bus_state() {
        let (dev, ch347) = setup();
        let mut a = ch347.i2c();
        let mut b = ch347.i2c();

        a.configure(I2cSpeed::Speed20K).unwrap();
        b.configure(I2cSpeed::Speed750K).unwrap();
        assert_eq!(a.speed(), Some(I2cSpeed::Speed750K));
        assert_eq!(dev.events().last(), Some(&Event::I2cSpeed(I2cSpeed::Speed750K)));

        assert!(b.read(0x23, 1).is_err());
        assert_eq!(a.bus_state(), BusState::StopSent);
        assert_eq!(a.read(0x50, 1).unwrap(), [0x00]);
        assert_eq!(b.bus_state(), BusState::Idle);
    }

    #[test]
    fn test_scan_finds_targets() {
        let (dev, ch347) = setup();
        dev.add_i2c_target(0x68, I2cTarget::default());
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed400K).unwrap();

        assert_eq!(i2c.scan().unwrap(), [0x50, 0x68]);
        assert!(!i2c.probe(0x10).unwrap());
    }

    #[test]
    fn test_zero_length_read_is_silent() {
        let (dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed20K).unwrap();
        let before = dev.reports_received();

        assert!(i2c.read(0x50, 0).unwrap().is_empty());
        assert_eq!(dev.reports_received(), before);
    }

    #[test]
    fn test_timeout_forces_stop() {
        let (dev, ch347) = setup();
        let mut i2c = ch347.i2c();
        i2c.configure(I2cSpeed::Speed100K).unwrap();

        dev.mute_replies(1);
        assert!(matches!(i2c.write(0x50, &[0, 1]), Err(Ch347Error::Timeout)));
        assert_eq!(i2c.bus_state(), BusState::StopSent);
    }

    #[test]
    fn test_transitions() {
        use BusState::*;
        assert!(Idle.can_move_to(StartSent));
        assert!(DataPhase.can_move_to(StartSent));
        assert!(Abort.can_move_to(StopSent));
        assert!(!Idle.can_move_to(DataPhase));
        assert!(!Abort.can_move_to(Idle));
        assert!(!StartSent.can_move_to(StopSent));
    }
}
