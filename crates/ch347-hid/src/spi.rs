//! SPI bus controller
//!
//! [`SpiDevice`] keeps the settings the chip was last configured with and
//! the chip select line held by [`SpiDevice::select`], if any. Settings only
//! change when the chip accepts a configuration.
//!
//! Transfers assert the configured chip select before the first byte and
//! release it after the last. Once a line is held with `select`, transfers
//! leave chip select alone until it is released, so several transfers can
//! form one SPI transaction:
//!
//! ```
//! # #[cfg(feature = "dummy")]
//! # fn main() -> ch347_hid::Result<()> {
//! use ch347_hid::dummy::DummyCh347;
//! use ch347_hid::{Ch347, ChipSelect, SpiConfig};
//!
//! let ch347 = Ch347::new(DummyCh347::new());
//! let mut spi = ch347.spi();
//! spi.configure(SpiConfig::new())?;
//!
//! spi.select(ChipSelect::CS1, true)?;
//! spi.write(&[0x03, 0x00, 0x10, 0x00])?;
//! let data = spi.read(16)?;
//! spi.select(ChipSelect::CS1, false)?;
//! assert_eq!(data.len(), 16);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "dummy"))]
//! # fn main() {}
//! ```

use crate::codec::{Command, CsAction, CsControl};
use crate::error::{Ch347Error, Result};
use crate::protocol::*;
use crate::session::{Ch347, Link};
use crate::transport::HidTransport;

/// SPI settings of a session
#[derive(Debug, Default)]
pub(crate) struct SpiState {
    settings: Option<SpiConfig>,
    timing: CsTiming,
    held: Option<ChipSelect>,
}

impl SpiState {
    fn transfer_cs(&self) -> Result<ChipSelect> {
        self.settings
            .as_ref()
            .map(|s| s.cs)
            .ok_or(Ch347Error::NotConfigured)
    }
}

/// SPI controller handle on a session
///
/// Every handle taken from one [`Ch347`] shares its settings and held chip
/// select, and each call holds the session for its whole duration.
pub struct SpiDevice<'a, T> {
    session: &'a Ch347<T>,
}

impl<'a, T: HidTransport> SpiDevice<'a, T> {
    pub(crate) fn new(session: &'a Ch347<T>) -> Self {
        Self { session }
    }

    /// Settings of the last accepted configuration
    pub fn settings(&self) -> Option<SpiConfig> {
        self.session.link().spi.settings.clone()
    }

    /// Chip select line held by [`select`](Self::select)
    pub fn held(&self) -> Option<ChipSelect> {
        self.session.link().spi.held
    }

    /// Delays applied on every chip select change
    pub fn set_cs_timing(&mut self, timing: CsTiming) {
        self.session.link().spi.timing = timing;
    }

    /// Apply a configuration
    ///
    /// On failure the previous settings stay in effect.
    pub fn configure(&mut self, config: SpiConfig) -> Result<()> {
        let mut link = self.session.link();
        link.execute(&Command::SpiConfig(&config))?;

        log::info!(
            "SPI configured: {} kHz, {:?}, {:?}, {:?}",
            config.speed.to_khz(),
            config.mode,
            config.bit_order,
            config.cs
        );
        link.spi.settings = Some(config);
        Ok(())
    }

    /// Assert or release a chip select line outside of a transfer
    ///
    /// Asserting a line releases the other one in the same command.
    pub fn select(&mut self, cs: ChipSelect, active: bool) -> Result<()> {
        let mut link = self.session.link();
        let mut ctrl = CsControl {
            timing: link.spi.timing,
            ..CsControl::default()
        };
        let (mine, other) = match cs {
            ChipSelect::CS1 => (&mut ctrl.cs1, &mut ctrl.cs2),
            ChipSelect::CS2 => (&mut ctrl.cs2, &mut ctrl.cs1),
        };
        if active {
            *mine = CsAction::Assert;
            *other = CsAction::Deassert;
        } else {
            *mine = CsAction::Deassert;
        }

        link.execute(&Command::SpiCsControl(ctrl))?;
        log::debug!("{:?} {}", cs, if active { "selected" } else { "released" });

        if active {
            link.spi.held = Some(cs);
        } else if link.spi.held == Some(cs) {
            link.spi.held = None;
        }
        Ok(())
    }

    /// Full-duplex transfer
    ///
    /// Returns exactly as many bytes as were written. An empty slice is a
    /// no-op.
    pub fn transfer(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut link = self.session.link();
        let cs = link.spi.transfer_cs()?;

        framed(&mut *link, cs, |link| {
            let mut read = Vec::with_capacity(data.len());
            for chunk in data.chunks(MAX_SPI_COMMAND_LEN) {
                read.extend(link.execute_data(&Command::SpiTransfer(chunk))?);
            }
            Ok(read)
        })
    }

    /// Write-only transfer, input is discarded
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut link = self.session.link();
        let cs = link.spi.transfer_cs()?;

        framed(&mut *link, cs, |link| {
            for chunk in data.chunks(MAX_SPI_COMMAND_LEN) {
                link.execute(&Command::SpiWrite(chunk))?;
            }
            Ok(())
        })
    }

    /// Read-only transfer of `len` bytes
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut link = self.session.link();
        let cs = link.spi.transfer_cs()?;

        framed(&mut *link, cs, |link| {
            let mut read = Vec::with_capacity(len);
            while read.len() < len {
                let count = (len - read.len()).min(MAX_SPI_COMMAND_LEN);
                // count <= MAX_SPI_COMMAND_LEN, well inside u32
                read.extend(link.execute_data(&Command::SpiRead(count as u32))?);
            }
            Ok(read)
        })
    }
}

/// Run `op` with chip select asserted, unless a line is already held
///
/// The release is attempted even when `op` fails; the first error wins.
fn framed<T: HidTransport, R>(
    link: &mut Link<T>,
    cs: ChipSelect,
    op: impl FnOnce(&mut Link<T>) -> Result<R>,
) -> Result<R> {
    if link.spi.held.is_some() {
        return op(link);
    }

    let timing = link.spi.timing;
    link.execute(&Command::SpiCsControl(CsControl::single(
        cs,
        CsAction::Assert,
        timing,
    )))?;

    let result = op(link);
    let release = link.execute(&Command::SpiCsControl(CsControl::single(
        cs,
        CsAction::Deassert,
        timing,
    )));

    match (result, release) {
        (Err(e), Err(release_err)) => {
            log::warn!("Failed to release {:?} after error: {}", cs, release_err);
            Err(e)
        }
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(value), Ok(_)) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyCh347, Event};

    fn session(dev: &DummyCh347) -> Ch347<DummyCh347> {
        Ch347::new(dev.clone())
    }

    #[test]
    fn test_transfer_echo() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();
        spi.configure(
            SpiConfig::new()
                .with_speed(SpiSpeed::Speed3_75M)
                .with_mode(SpiMode::Mode0)
                .with_cs(ChipSelect::CS1),
        )
        .unwrap();

        assert_eq!(spi.transfer(&[0xAA, 0x55]).unwrap(), [0xAA, 0x55]);
        assert_eq!(
            dev.events(),
            [
                Event::Configured,
                Event::Cs(ChipSelect::CS1, true),
                Event::SpiClock(2),
                Event::Cs(ChipSelect::CS1, false),
            ]
        );
    }

    #[test]
    fn test_transfer_requires_configure() {
        let ch347 = Ch347::new(DummyCh347::new());
        let mut spi = ch347.spi();
        assert!(matches!(spi.transfer(&[1]), Err(Ch347Error::NotConfigured)));
        // Empty transfers never touch the bus
        assert!(spi.transfer(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_failed_configure_keeps_settings() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();

        let first = SpiConfig::new().with_speed(SpiSpeed::Speed15M);
        spi.configure(first.clone()).unwrap();

        dev.set_reject_config(true);
        let err = spi
            .configure(SpiConfig::new().with_mode(SpiMode::Mode3))
            .unwrap_err();
        assert!(matches!(err, Ch347Error::Rejected { status: 0x01, .. }));
        assert_eq!(spi.settings(), Some(first));
    }

    #[test]
    fn test_configure_without_status_byte_not_committed() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();

        // The device's own reply is lost; an empty status frame arrives instead
        dev.mute_replies(1);
        dev.push_raw_reply(vec![3, 0, CMD_SPI_SET_CFG, 0, 0]);
        let err = spi
            .configure(SpiConfig::new().with_speed(SpiSpeed::Speed60M))
            .unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(spi.settings(), None);
    }

    #[test]
    fn test_handles_share_held_cs() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut a = ch347.spi();
        let mut b = ch347.spi();
        a.configure(SpiConfig::new()).unwrap();
        assert_eq!(b.settings(), a.settings());

        a.select(ChipSelect::CS1, true).unwrap();
        b.transfer(&[1, 2]).unwrap();
        assert!(dev.cs_asserted(ChipSelect::CS1));
        assert_eq!(b.held(), Some(ChipSelect::CS1));

        a.transfer(&[3]).unwrap();
        assert!(dev.cs_asserted(ChipSelect::CS1));
        b.select(ChipSelect::CS1, false).unwrap();
        assert_eq!(a.held(), None);
        assert!(!dev.cs_asserted(ChipSelect::CS1));

        let cs_events = dev
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Cs(ChipSelect::CS1, _)))
            .count();
        assert_eq!(cs_events, 2);
    }

    #[test]
    fn test_held_cs_spans_transfers() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();
        spi.configure(SpiConfig::new().with_cs(ChipSelect::CS2)).unwrap();

        spi.select(ChipSelect::CS2, true).unwrap();
        assert!(dev.cs_asserted(ChipSelect::CS2));
        spi.transfer(&[1, 2, 3]).unwrap();
        spi.transfer(&[4]).unwrap();
        assert!(dev.cs_asserted(ChipSelect::CS2));
        spi.select(ChipSelect::CS2, false).unwrap();
        assert!(!dev.cs_asserted(ChipSelect::CS2));
        assert_eq!(spi.held(), None);

        let cs_events = dev
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Cs(..)))
            .count();
        // select asserts CS2 and releases CS1, then the final release
        assert_eq!(cs_events, 3);
    }

    #[test]
    fn test_select_releases_other_line() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();

        spi.select(ChipSelect::CS1, true).unwrap();
        spi.select(ChipSelect::CS2, true).unwrap();
        assert!(!dev.cs_asserted(ChipSelect::CS1));
        assert!(dev.cs_asserted(ChipSelect::CS2));
        assert_eq!(spi.held(), Some(ChipSelect::CS2));
    }

    #[test]
    fn test_large_transfer_keeps_order() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();
        spi.configure(SpiConfig::new()).unwrap();

        let data: Vec<u8> = (0..MAX_SPI_COMMAND_LEN + 1000).map(|i| i as u8).collect();
        assert_eq!(spi.transfer(&data).unwrap(), data);

        let clocks: Vec<usize> = dev
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SpiClock(n) => Some(n),
                _ => None,
            })
            .collect();
        let frames = MAX_SPI_COMMAND_LEN.div_ceil(MAX_FRAME_PAYLOAD)
            + 1000usize.div_ceil(MAX_FRAME_PAYLOAD);
        assert_eq!(clocks.len(), frames);
        assert_eq!(clocks.iter().sum::<usize>(), data.len());
        // One assert, one release around the whole transfer
        assert!(!dev.cs_asserted(ChipSelect::CS1));
    }

    #[test]
    fn test_read_and_write() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();
        spi.configure(SpiConfig::new()).unwrap();

        spi.write(&[0x9F; 600]).unwrap();
        dev.queue_miso(&[0xEF, 0x40, 0x18]);
        assert_eq!(spi.read(4).unwrap(), [0xEF, 0x40, 0x18, 0xFF]);
    }

    #[test]
    fn test_cs_released_after_failed_transfer() {
        let dev = DummyCh347::new();
        let ch347 = session(&dev);
        let mut spi = ch347.spi();
        spi.configure(SpiConfig::new()).unwrap();

        dev.mute_replies(1);
        assert!(matches!(spi.transfer(&[1, 2]), Err(Ch347Error::Timeout)));
        assert!(!dev.cs_asserted(ChipSelect::CS1));
    }
}
