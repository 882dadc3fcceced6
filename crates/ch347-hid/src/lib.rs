//! ch347-hid - CH347 USB-HID SPI/I2C bridge driver
//!
//! This crate drives the CH347 when it enumerates in HID mode (mode 2 on the
//! CH347T, the default on the CH347F). In that mode the SPI and I2C engines
//! are reached through 512-byte HID reports on interface 1 instead of the
//! vendor bulk endpoints.
//!
//! # Protocol Overview
//!
//! Every report starts with a little-endian body length. The body is either
//! a sized command or an I2C stream:
//!
//! - Sized commands `0xC0`-`0xCA`: `[opcode][len u16 LE][payload]`, at most
//!   507 payload bytes per report; longer payloads span several reports
//! - I2C streams `0xAA`: start/stop/out/in ops terminated by `0x00`, always
//!   one report
//! - Replies echo the opcode (sized) or carry ack bytes and read data
//!   (streams)
//!
//! The command set was captured from the vendor tool, not documented. The
//! byte layouts live in [`protocol::layout`] and [`codec::COMMAND_TABLE`].
//!
//! # Device Variants
//!
//! - **CH347T** (PID: 0x55DB): USB to UART+SPI+I2C
//! - **CH347F** (PID: 0x55DE): USB to UART+SPI+I2C+JTAG
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "hidapi")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ch347_hid::{Ch347, I2cSpeed, SpiConfig, SpiSpeed};
//!
//! let ch347 = Ch347::open()?;
//!
//! let mut spi = ch347.spi();
//! spi.configure(SpiConfig::new().with_speed(SpiSpeed::Speed7_5M))?;
//! let id = spi.transfer(&[0x9F, 0, 0, 0])?;
//! println!("JEDEC ID: {:02X} {:02X} {:02X}", id[1], id[2], id[3]);
//!
//! let mut i2c = ch347.i2c();
//! i2c.configure(I2cSpeed::Speed400K)?;
//! let who_am_i = i2c.read_register(0x68, 0x75, 1)?;
//! println!("WHO_AM_I: {:02X}", who_am_i[0]);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "hidapi"))]
//! # fn main() {}
//! ```

pub mod codec;
#[cfg(any(test, feature = "dummy"))]
pub mod dummy;
mod error;
pub mod framer;
mod i2c;
pub mod protocol;
mod session;
mod spi;
pub mod transport;

pub use error::{Ch347Error, NackPhase, Result};
pub use i2c::{BusState, I2cDevice, SCAN_FIRST, SCAN_LAST};
pub use protocol::{
    BitOrder, Ch347Variant, ChipSelect, CsActiveHigh, CsPolarity, CsTiming, I2cSpeed, SpiConfig,
    SpiMode, SpiSpeed,
};
pub use session::{parse_options, Ch347, Options, SessionConfig};
pub use spi::SpiDevice;
pub use transport::HidTransport;

#[cfg(feature = "hidapi")]
pub use transport::hid::{Ch347DeviceInfo, HidapiTransport};
