//! Device session
//!
//! A [`Ch347`] owns the transport and serialises every exchange with the
//! chip. The chip has no request identifiers, so a reply can only be matched
//! to its command by order; the session makes sure only one command (or one
//! multi-command bus operation) is in flight at a time. The SPI and I2C
//! settings live behind the same lock, so every controller handle taken from
//! a session sees the same configuration and held chip select.
//!
//! Bus controllers borrow the session:
//!
//! ```
//! # #[cfg(feature = "dummy")]
//! # fn main() -> ch347_hid::Result<()> {
//! use ch347_hid::dummy::DummyCh347;
//! use ch347_hid::{Ch347, SpiConfig};
//!
//! let ch347 = Ch347::new(DummyCh347::new());
//! let mut spi = ch347.spi();
//! spi.configure(SpiConfig::new())?;
//! assert_eq!(spi.transfer(&[0xAA, 0x55])?, [0xAA, 0x55]);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "dummy"))]
//! # fn main() {}
//! ```

use std::sync::{Mutex, MutexGuard};

use crate::codec::{self, Command, ReplyShape, Response};
use crate::error::{Ch347Error, Result};
use crate::framer::ReportFramer;
use crate::i2c::{I2cDevice, I2cState};
use crate::protocol::*;
use crate::spi::{SpiDevice, SpiState};
use crate::transport::HidTransport;

/// Session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long to wait for each reply report
    pub timeout_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// The single command channel to the chip, plus the bus state it drives
pub(crate) struct Link<T> {
    framer: ReportFramer<T>,
    pub(crate) spi: SpiState,
    pub(crate) i2c: I2cState,
}

impl<T: HidTransport> Link<T> {
    /// Run one command: drain stale replies, send, wait for the reply and
    /// check it
    ///
    /// Commands without a reply skip the drain so that a chip select can
    /// still be released after a failed transfer.
    pub(crate) fn execute(&mut self, cmd: &Command<'_>) -> Result<Response> {
        let spec = cmd.spec();
        let payload = codec::encode(cmd)?;
        let expected = cmd.expected_reply_len();

        if spec.reply != ReplyShape::None {
            self.framer.resync()?;
        }

        log::debug!(
            "{:?} (0x{:02X}): {} payload bytes, {} reply bytes",
            spec.kind,
            spec.opcode,
            payload.len(),
            expected
        );

        self.framer.send(spec, &payload, expected)?;
        let raw = self.framer.receive(spec, expected)?;
        codec::decode(raw, cmd)
    }

    /// Run a command that must come back with data
    pub(crate) fn execute_data(&mut self, cmd: &Command<'_>) -> Result<Vec<u8>> {
        match self.execute(cmd)? {
            Response::Data(data) => Ok(data),
            Response::Ack => Err(Ch347Error::MalformedResponse(format!(
                "{:?} returned no data",
                cmd.kind()
            ))),
        }
    }
}

/// Open session with a CH347
pub struct Ch347<T> {
    link: Mutex<Link<T>>,
    config: SessionConfig,
}

impl<T: HidTransport> Ch347<T> {
    /// Start a session over an open transport with default settings
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Start a session over an open transport
    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            link: Mutex::new(Link {
                framer: ReportFramer::new(transport, config.timeout_ms),
                spi: SpiState::default(),
                i2c: I2cState::default(),
            }),
            config,
        }
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Take the channel for one bus operation
    pub(crate) fn link(&self) -> MutexGuard<'_, Link<T>> {
        // Reports are written whole, so a poisoned link is still usable
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// SPI controller on this session
    ///
    /// All handles share one set of SPI settings. The bus starts
    /// unconfigured; call [`SpiDevice::configure`] before transferring.
    pub fn spi(&self) -> SpiDevice<'_, T> {
        SpiDevice::new(self)
    }

    /// I2C controller on this session, sharing the session's I2C state
    pub fn i2c(&self) -> I2cDevice<'_, T> {
        I2cDevice::new(self)
    }

    /// Reset the chip's SPI/I2C engine
    pub fn reset(&self) -> Result<()> {
        self.link().execute(&Command::Reset)?;
        log::info!("CH347 reset");
        Ok(())
    }

    /// End the session and give back the transport
    pub fn close(self) -> T {
        let link = self.link.into_inner().unwrap_or_else(|e| e.into_inner());
        link.framer.into_inner()
    }
}

#[cfg(feature = "hidapi")]
mod hardware {
    use super::*;
    use crate::transport::hid::{Ch347DeviceInfo, HidapiTransport};

    impl Ch347<HidapiTransport> {
        /// Open the first CH347 found
        pub fn open() -> Result<Self> {
            Self::open_nth(0)
        }

        /// Open the nth CH347 (0-indexed)
        ///
        /// Useful when multiple CH347 devices are connected.
        pub fn open_nth(index: usize) -> Result<Self> {
            Self::open_nth_with_config(index, SessionConfig::default())
        }

        /// Open the nth CH347 with custom session settings
        pub fn open_nth_with_config(index: usize, config: SessionConfig) -> Result<Self> {
            let transport = HidapiTransport::open_nth(index)?;
            Ok(Self::with_config(transport, config))
        }

        /// Open a device by vendor and product ID
        pub fn open_ids(vendor_id: u16, product_id: u16) -> Result<Self> {
            let transport = HidapiTransport::open(vendor_id, product_id, CH347_HID_INTERFACE)?;
            Ok(Self::new(transport))
        }

        /// List all connected CH347 devices
        pub fn list_devices() -> Result<Vec<Ch347DeviceInfo>> {
            HidapiTransport::list_devices()
        }
    }
}

/// Settings parsed from programmer-style `key=value` options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// SPI configuration
    pub spi: SpiConfig,
    /// I2C bus speed
    pub i2c_speed: I2cSpeed,
    /// Session settings
    pub session: SessionConfig,
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N> {
    value
        .parse()
        .map_err(|_| Ch347Error::InvalidParameter(format!("Invalid {} value: {}", key, value)))
}

/// Parse CH347 options
///
/// Supported options:
/// - `spispeed=<kHz>`: SPI clock, rounded down to the nearest supported rate
/// - `spimode=<0-3>`: SPI mode
/// - `cs=<0|1>`: chip select line used by transfers
/// - `lsb=<0|1>`: send the least significant bit first
/// - `i2cspeed=<0-3>`: I2C speed level (20, 100, 400, 750 kHz)
/// - `timeout=<ms>`: reply timeout
///
/// # Example
///
/// ```
/// let options = [("spispeed", "30000"), ("cs", "1")];
/// let parsed = ch347_hid::parse_options(&options)?;
/// assert_eq!(parsed.spi.cs, ch347_hid::ChipSelect::CS2);
/// # Ok::<(), ch347_hid::Ch347Error>(())
/// ```
pub fn parse_options(options: &[(&str, &str)]) -> Result<Options> {
    let mut parsed = Options::default();

    for (key, value) in options {
        match *key {
            "spispeed" => {
                let khz: u32 = parse_number(key, value)?;
                parsed.spi.speed = SpiSpeed::from_khz(khz);
                log::debug!(
                    "Setting SPI speed to {}kHz (actual: {}kHz)",
                    khz,
                    parsed.spi.speed.to_khz()
                );
            }
            "spimode" => {
                let mode: u8 = parse_number(key, value)?;
                parsed.spi.mode = SpiMode::from_number(mode).ok_or_else(|| {
                    Ch347Error::InvalidParameter(format!("Invalid spimode: {} (must be 0-3)", mode))
                })?;
            }
            "cs" => {
                let cs: u8 = parse_number(key, value)?;
                parsed.spi.cs = ChipSelect::from_index(cs).ok_or_else(|| {
                    Ch347Error::InvalidParameter(format!("Invalid cs: {} (must be 0 or 1)", cs))
                })?;
            }
            "lsb" => {
                parsed.spi.bit_order = match *value {
                    "1" | "yes" | "true" => BitOrder::LsbFirst,
                    "0" | "no" | "false" => BitOrder::MsbFirst,
                    _ => {
                        return Err(Ch347Error::InvalidParameter(format!(
                            "Invalid lsb value: {}",
                            value
                        )))
                    }
                };
            }
            "i2cspeed" => {
                let level: u8 = parse_number(key, value)?;
                parsed.i2c_speed = I2cSpeed::from_level(level).ok_or_else(|| {
                    Ch347Error::InvalidParameter(format!(
                        "Invalid i2cspeed: {} (must be 0-3)",
                        level
                    ))
                })?;
            }
            "timeout" => {
                parsed.session.timeout_ms = parse_number(key, value)?;
                if parsed.session.timeout_ms == 0 {
                    return Err(Ch347Error::InvalidParameter(
                        "timeout must be at least 1 ms".into(),
                    ));
                }
            }
            _ => {
                log::warn!("Unknown CH347 option: {}={}", key, value);
            }
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyCh347, Event};

    #[test]
    fn test_reset_roundtrip() {
        let dev = DummyCh347::new();
        let ch347 = Ch347::new(dev.clone());
        ch347.reset().unwrap();
        assert_eq!(dev.events(), [Event::Reset]);
    }

    #[test]
    fn test_stale_reply_drained_before_next_command() {
        let dev = DummyCh347::new();
        let ch347 = Ch347::new(dev.clone());

        // Reply arrives late: the first reset times out
        dev.mute_replies(1);
        assert!(matches!(ch347.reset(), Err(Ch347Error::Timeout)));

        // The late reply shows up and is drained, not mistaken for the next
        dev.push_raw_reply(vec![4, 0, CMD_DEVICE_RESET, 1, 0, 0]);
        ch347.reset().unwrap();
    }

    #[test]
    fn test_undrainable_reply_reports_desync_once() {
        let dev = DummyCh347::new();
        let ch347 = Ch347::new(dev.clone());

        dev.mute_replies(1);
        assert!(ch347.reset().is_err());
        assert!(matches!(ch347.reset(), Err(Ch347Error::SessionDesynced)));
        ch347.reset().unwrap();
    }

    #[test]
    fn test_threads_share_one_session() {
        let dev = DummyCh347::new();
        dev.add_i2c_target(0x50, crate::dummy::I2cTarget::default());
        let ch347 = Ch347::new(dev.clone());
        ch347.spi().configure(SpiConfig::new()).unwrap();
        ch347.i2c().configure(I2cSpeed::Speed400K).unwrap();

        std::thread::scope(|s| {
            for id in 0..3u8 {
                let ch347 = &ch347;
                s.spawn(move || {
                    let mut spi = ch347.spi();
                    for round in 0..20u8 {
                        let data = vec![id.wrapping_mul(32).wrapping_add(round); 700];
                        assert_eq!(spi.transfer(&data).unwrap(), data);
                    }
                });
            }
            s.spawn(|| {
                let mut i2c = ch347.i2c();
                for _ in 0..20 {
                    assert_eq!(i2c.read_register(0x50, 0, 4).unwrap(), [0; 4]);
                }
            });
        });

        // Each transfer is assert, clocks, release with nothing in between
        let mut selected = false;
        for event in dev.events() {
            match event {
                Event::Configured | Event::I2cSpeed(_) => {}
                Event::Cs(ChipSelect::CS1, true) => {
                    assert!(!selected);
                    selected = true;
                }
                Event::Cs(ChipSelect::CS1, false) => {
                    assert!(selected);
                    selected = false;
                }
                Event::SpiClock(_) => assert!(selected),
                Event::I2cStart | Event::I2cRepeatedStart | Event::I2cStop => {
                    assert!(!selected)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!selected);
    }

    #[test]
    fn test_close_returns_transport() {
        let dev = DummyCh347::new();
        let ch347 = Ch347::new(dev.clone());
        ch347.reset().unwrap();
        let back = ch347.close();
        assert_eq!(back.reports_received(), 1);
    }

    #[test]
    fn test_parse_options() {
        let parsed = parse_options(&[
            ("spispeed", "15000"),
            ("spimode", "3"),
            ("cs", "1"),
            ("lsb", "1"),
            ("i2cspeed", "2"),
            ("timeout", "250"),
        ])
        .unwrap();
        assert_eq!(parsed.spi.speed, SpiSpeed::Speed15M);
        assert_eq!(parsed.spi.mode, SpiMode::Mode3);
        assert_eq!(parsed.spi.cs, ChipSelect::CS2);
        assert_eq!(parsed.spi.bit_order, BitOrder::LsbFirst);
        assert_eq!(parsed.i2c_speed, I2cSpeed::Speed400K);
        assert_eq!(parsed.session.timeout_ms, 250);
    }

    #[test]
    fn test_parse_options_rejects_bad_values() {
        assert!(parse_options(&[("spimode", "4")]).is_err());
        assert!(parse_options(&[("cs", "2")]).is_err());
        assert!(parse_options(&[("i2cspeed", "fast")]).is_err());
        assert!(parse_options(&[("timeout", "0")]).is_err());
        // Unknown keys are only warned about
        assert!(parse_options(&[("frobnicate", "1")]).is_ok());
    }
}
