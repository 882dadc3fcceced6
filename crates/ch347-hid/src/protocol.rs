//! CH347 HID protocol constants and settings
//!
//! This module holds the USB identifiers, report geometry, opcodes and the
//! typed settings (SPI clock, mode, bit order, chip select, I2C speed) that
//! the command codec turns into bytes.
//!
//! The HID command set is not documented by the vendor. Everything here was
//! taken from captured traffic, so the byte-level tables live in one place
//! ([`layout`]) where they can be corrected without touching the bus
//! controllers.

use bitflags::bitflags;

// USB device identifiers
/// WCH USB vendor ID
pub const CH347_USB_VENDOR: u16 = 0x1A86;
/// CH347T USB PID (USB to UART+SPI+I2C)
pub const CH347T_USB_PRODUCT: u16 = 0x55DB;
/// CH347F USB PID (USB to UART+SPI+I2C+JTAG)
pub const CH347F_USB_PRODUCT: u16 = 0x55DE;
/// HID interface carrying the SPI/I2C command channel
pub const CH347_HID_INTERFACE: i32 = 1;

/// Default read timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

// Report geometry
/// HID report size in bytes (without the report ID)
pub const REPORT_SIZE: usize = 512;
/// Report ID prefixed to every outgoing report
pub const REPORT_ID: u8 = 0x00;
/// Bytes used by the `body_len` field at the start of every report
pub const REPORT_LEN_FIELD: usize = 2;
/// Bytes of a sized command header: opcode + payload length
pub const COMMAND_HEADER_LEN: usize = 3;
/// Minimum length of a sized reply frame (length field + command header)
pub const MIN_REPLY_FRAME: usize = REPORT_LEN_FIELD + COMMAND_HEADER_LEN;
/// Maximum payload carried by one sized command frame
pub const MAX_FRAME_PAYLOAD: usize = REPORT_SIZE - REPORT_LEN_FIELD - COMMAND_HEADER_LEN;
/// Maximum number of bytes in one logical SPI command
pub const MAX_SPI_COMMAND_LEN: usize = 32768;

// Command codes
/// Set SPI configuration
pub const CMD_SPI_SET_CFG: u8 = 0xC0;
/// Control chip select lines
pub const CMD_SPI_CS_CTRL: u8 = 0xC1;
/// SPI full-duplex transfer
pub const CMD_SPI_OUT_IN: u8 = 0xC2;
/// SPI read-only transfer
pub const CMD_SPI_IN: u8 = 0xC3;
/// SPI write-only transfer
pub const CMD_SPI_OUT: u8 = 0xC4;
/// Device reset / configuration query
pub const CMD_DEVICE_RESET: u8 = 0xCA;
/// I2C stream command
pub const CMD_I2C_STREAM: u8 = 0xAA;

/// Status byte returned by a device that accepted a command
pub const STATUS_OK: u8 = 0x00;

/// I2C stream sub-commands
pub mod stream {
    /// End of stream
    pub const END: u8 = 0x00;
    /// Set bus speed, low 2 bits hold the speed level
    pub const SET: u8 = 0x60;
    /// Start (or repeated start) condition
    pub const START: u8 = 0x74;
    /// Stop condition
    pub const STOP: u8 = 0x75;
    /// Write n bytes, low 6 bits hold the count
    pub const OUT: u8 = 0x80;
    /// Read bytes, low 6 bits hold the ACKed count (0 = one NACKed byte)
    pub const IN: u8 = 0xC0;
    /// Largest count an OUT or IN op can carry
    pub const MAX_OP_LEN: usize = 63;
    /// Ack byte value for an acknowledged byte
    pub const ACK: u8 = 0x01;
}

/// Byte offsets inside the command payloads
///
/// Offsets are relative to the start of the payload (after opcode and
/// payload length).
pub mod layout {
    /// SPI_SET_CFG payload length
    pub const SPI_CFG_LEN: usize = 26;
    /// SPI_SET_CFG payload as captured from the vendor tool
    pub const SPI_CFG_TEMPLATE: [u8; SPI_CFG_LEN] = [
        0x00, 0x00, 0x04, 0x01, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x02, 0x08, 0x00, 0x00,
        0x00, 0x07, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    /// Clock polarity byte (0x02 = idle high)
    pub const SPI_CFG_CPOL: usize = 6;
    /// Clock phase byte (0x01 = second edge)
    pub const SPI_CFG_CPHA: usize = 8;
    /// Clock divider byte, divider in bits 5:3
    pub const SPI_CFG_CLOCK: usize = 12;
    /// Bit order byte (0x80 = LSB first)
    pub const SPI_CFG_BIT_ORDER: usize = 14;
    /// Write/read interval in microseconds, u16 LE
    pub const SPI_CFG_INTERVAL: usize = 18;
    /// Chip select polarity byte
    pub const SPI_CFG_CS_POLARITY: usize = 21;

    /// SPI_CS_CTRL payload length
    pub const CS_CTRL_LEN: usize = 10;
    /// Size of one chip select block
    pub const CS_BLOCK_LEN: usize = 5;
    /// Offset of the control byte inside a block
    pub const CS_BLOCK_CTRL: usize = 0;
    /// Offset of the assert delay (u16 LE) inside a block
    pub const CS_BLOCK_ASSERT_DELAY: usize = 1;
    /// Offset of the deassert delay (u16 LE) inside a block
    pub const CS_BLOCK_DEASSERT_DELAY: usize = 3;

    /// DEVICE_RESET payload
    pub const RESET_PAYLOAD: [u8; 1] = [0x01];
}

/// SPI clock divisor settings
///
/// The CH347 has a 120MHz base clock, divided by powers of 2.
/// Divisor = 2^(value + 1), so:
/// - 0 -> 60 MHz
/// - 1 -> 30 MHz
/// - 2 -> 15 MHz
/// - 3 -> 7.5 MHz
/// - 4 -> 3.75 MHz
/// - 5 -> 1.875 MHz
/// - 6 -> 937.5 kHz
/// - 7 -> 468.75 kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiSpeed {
    /// 60 MHz (divisor 0)
    Speed60M = 0,
    /// 30 MHz (divisor 1)
    Speed30M = 1,
    /// 15 MHz (divisor 2)
    Speed15M = 2,
    /// 7.5 MHz (divisor 3, default)
    #[default]
    Speed7_5M = 3,
    /// 3.75 MHz (divisor 4)
    Speed3_75M = 4,
    /// 1.875 MHz (divisor 5)
    Speed1_875M = 5,
    /// 937.5 kHz (divisor 6)
    Speed937_5K = 6,
    /// 468.75 kHz (divisor 7)
    Speed468_75K = 7,
}

impl SpiSpeed {
    const ALL: [SpiSpeed; 8] = [
        SpiSpeed::Speed60M,
        SpiSpeed::Speed30M,
        SpiSpeed::Speed15M,
        SpiSpeed::Speed7_5M,
        SpiSpeed::Speed3_75M,
        SpiSpeed::Speed1_875M,
        SpiSpeed::Speed937_5K,
        SpiSpeed::Speed468_75K,
    ];

    /// Build from a raw divider value (0-7)
    pub fn from_divider(divider: u8) -> Option<Self> {
        Self::ALL.get(divider as usize).copied()
    }

    /// Convert a frequency in kHz to the fastest speed not above it
    pub fn from_khz(khz: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|speed| speed.to_khz() <= khz)
            .unwrap_or(SpiSpeed::Speed468_75K)
    }

    /// Get the actual speed in kHz for this divisor
    pub fn to_khz(self) -> u32 {
        const BASE_KHZ: u32 = 120_000;
        BASE_KHZ / (1 << (self as u32 + 1))
    }

    /// Get the divisor value for the configuration payload
    pub fn divisor(self) -> u8 {
        self as u8
    }
}

/// SPI mode (clock polarity and phase)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiMode {
    /// Mode 0: CPOL=0, CPHA=0
    #[default]
    Mode0 = 0,
    /// Mode 1: CPOL=0, CPHA=1
    Mode1 = 1,
    /// Mode 2: CPOL=1, CPHA=0
    Mode2 = 2,
    /// Mode 3: CPOL=1, CPHA=1
    Mode3 = 3,
}

impl SpiMode {
    /// Build from a mode number (0-3)
    pub fn from_number(mode: u8) -> Option<Self> {
        match mode {
            0 => Some(SpiMode::Mode0),
            1 => Some(SpiMode::Mode1),
            2 => Some(SpiMode::Mode2),
            3 => Some(SpiMode::Mode3),
            _ => None,
        }
    }

    /// Get clock polarity (CPOL)
    pub fn cpol(self) -> u8 {
        (self as u8 >> 1) & 1
    }

    /// Get clock phase (CPHA)
    pub fn cpha(self) -> u8 {
        self as u8 & 1
    }
}

/// Order in which bits of each byte are clocked out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    /// Most significant bit first
    #[default]
    MsbFirst,
    /// Least significant bit first
    LsbFirst,
}

/// Which chip select line to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipSelect {
    /// CS1 (first line, default)
    #[default]
    CS1 = 0,
    /// CS2 (second line)
    CS2 = 1,
}

impl ChipSelect {
    /// Build from a line index (0 or 1)
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ChipSelect::CS1),
            1 => Some(ChipSelect::CS2),
            _ => None,
        }
    }

    /// The other chip select line
    pub fn other(self) -> Self {
        match self {
            ChipSelect::CS1 => ChipSelect::CS2,
            ChipSelect::CS2 => ChipSelect::CS1,
        }
    }
}

bitflags! {
    /// Chip select lines driven high while selected (SPI_CFG_CS_POLARITY)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CsActiveHigh: u8 {
        /// CS1 is active high
        const CS1 = 0x80;
        /// CS2 is active high
        const CS2 = 0x40;
    }
}

impl From<ChipSelect> for CsActiveHigh {
    fn from(cs: ChipSelect) -> Self {
        match cs {
            ChipSelect::CS1 => CsActiveHigh::CS1,
            ChipSelect::CS2 => CsActiveHigh::CS2,
        }
    }
}

/// Active level of a chip select line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsPolarity {
    /// Line is pulled low while selected (default)
    #[default]
    ActiveLow,
    /// Line is driven high while selected
    ActiveHigh,
}

/// Delays applied around chip select transitions, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CsTiming {
    /// Delay between asserting CS and the first clock
    pub assert_delay_us: u16,
    /// Delay between the last clock and deasserting CS
    pub deassert_delay_us: u16,
}

/// SPI configuration for CH347
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpiConfig {
    /// SPI clock speed
    pub speed: SpiSpeed,
    /// SPI mode (clock polarity and phase)
    pub mode: SpiMode,
    /// Bit order
    pub bit_order: BitOrder,
    /// Which chip select transfers use
    pub cs: ChipSelect,
    /// Polarity of CS1
    pub cs1_polarity: CsPolarity,
    /// Polarity of CS2
    pub cs2_polarity: CsPolarity,
    /// Gap between the write and read phase, in microseconds
    pub interval_us: u16,
}

impl SpiConfig {
    /// Create a new SPI configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SPI clock speed
    pub fn with_speed(mut self, speed: SpiSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Set the SPI clock speed from a frequency in kHz
    pub fn with_speed_khz(mut self, khz: u32) -> Self {
        self.speed = SpiSpeed::from_khz(khz);
        self
    }

    /// Set the SPI mode
    pub fn with_mode(mut self, mode: SpiMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the bit order
    pub fn with_bit_order(mut self, bit_order: BitOrder) -> Self {
        self.bit_order = bit_order;
        self
    }

    /// Set which chip select to use
    pub fn with_cs(mut self, cs: ChipSelect) -> Self {
        self.cs = cs;
        self
    }

    /// Set the polarity of one chip select line
    pub fn with_cs_polarity(mut self, cs: ChipSelect, polarity: CsPolarity) -> Self {
        match cs {
            ChipSelect::CS1 => self.cs1_polarity = polarity,
            ChipSelect::CS2 => self.cs2_polarity = polarity,
        }
        self
    }

    /// Set the write/read interval
    pub fn with_interval_us(mut self, us: u16) -> Self {
        self.interval_us = us;
        self
    }

    /// Polarity of the given line
    pub fn polarity(&self, cs: ChipSelect) -> CsPolarity {
        match cs {
            ChipSelect::CS1 => self.cs1_polarity,
            ChipSelect::CS2 => self.cs2_polarity,
        }
    }

    /// Lines configured active high
    pub fn active_high(&self) -> CsActiveHigh {
        [ChipSelect::CS1, ChipSelect::CS2]
            .into_iter()
            .filter(|&cs| self.polarity(cs) == CsPolarity::ActiveHigh)
            .map(CsActiveHigh::from)
            .collect()
    }
}

/// I2C clock speed levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum I2cSpeed {
    /// 20 kHz
    Speed20K = 0,
    /// 100 kHz (default)
    #[default]
    Speed100K = 1,
    /// 400 kHz
    Speed400K = 2,
    /// 750 kHz
    Speed750K = 3,
}

impl I2cSpeed {
    /// Build from a speed level (0-3)
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(I2cSpeed::Speed20K),
            1 => Some(I2cSpeed::Speed100K),
            2 => Some(I2cSpeed::Speed400K),
            3 => Some(I2cSpeed::Speed750K),
            _ => None,
        }
    }

    /// Level value sent in the stream SET op
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Nominal bus clock in kHz
    pub fn to_khz(self) -> u32 {
        match self {
            I2cSpeed::Speed20K => 20,
            I2cSpeed::Speed100K => 100,
            I2cSpeed::Speed400K => 400,
            I2cSpeed::Speed750K => 750,
        }
    }
}

/// CH347 variant information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ch347Variant {
    /// CH347T: USB to UART+SPI+I2C
    Ch347T,
    /// CH347F: USB to UART+SPI+I2C+JTAG
    Ch347F,
}

impl Ch347Variant {
    /// Get the USB product ID for this variant
    pub fn product_id(self) -> u16 {
        match self {
            Ch347Variant::Ch347T => CH347T_USB_PRODUCT,
            Ch347Variant::Ch347F => CH347F_USB_PRODUCT,
        }
    }

    /// Detect variant from USB product ID
    pub fn from_product_id(pid: u16) -> Option<Self> {
        match pid {
            CH347T_USB_PRODUCT => Some(Ch347Variant::Ch347T),
            CH347F_USB_PRODUCT => Some(Ch347Variant::Ch347F),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ch347Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ch347Variant::Ch347T => write!(f, "CH347T"),
            Ch347Variant::Ch347F => write!(f, "CH347F"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_speed_from_khz() {
        assert_eq!(SpiSpeed::from_khz(60_000), SpiSpeed::Speed60M);
        assert_eq!(SpiSpeed::from_khz(30_000), SpiSpeed::Speed30M);
        assert_eq!(SpiSpeed::from_khz(100_000), SpiSpeed::Speed60M);

        // Between values should round down
        assert_eq!(SpiSpeed::from_khz(20_000), SpiSpeed::Speed15M);
        assert_eq!(SpiSpeed::from_khz(10_000), SpiSpeed::Speed7_5M);

        assert_eq!(SpiSpeed::from_khz(100), SpiSpeed::Speed468_75K);
    }

    #[test]
    fn test_spi_speed_divider() {
        assert_eq!(SpiSpeed::from_divider(4), Some(SpiSpeed::Speed3_75M));
        assert_eq!(SpiSpeed::from_divider(8), None);
        assert_eq!(SpiSpeed::Speed3_75M.to_khz(), 3_750);
    }

    #[test]
    fn test_spi_mode() {
        assert_eq!(SpiMode::Mode0.cpol(), 0);
        assert_eq!(SpiMode::Mode0.cpha(), 0);
        assert_eq!(SpiMode::Mode1.cpol(), 0);
        assert_eq!(SpiMode::Mode1.cpha(), 1);
        assert_eq!(SpiMode::Mode2.cpol(), 1);
        assert_eq!(SpiMode::Mode2.cpha(), 0);
        assert_eq!(SpiMode::Mode3.cpol(), 1);
        assert_eq!(SpiMode::Mode3.cpha(), 1);
        assert_eq!(SpiMode::from_number(4), None);
    }

    #[test]
    fn test_i2c_speed_table() {
        let khz: Vec<u32> = (0..4)
            .filter_map(I2cSpeed::from_level)
            .map(I2cSpeed::to_khz)
            .collect();
        assert_eq!(khz, [20, 100, 400, 750]);
        assert_eq!(I2cSpeed::from_level(4), None);
    }

    #[test]
    fn test_cs_active_high_bits() {
        let config = SpiConfig::new()
            .with_cs_polarity(ChipSelect::CS1, CsPolarity::ActiveHigh)
            .with_cs_polarity(ChipSelect::CS2, CsPolarity::ActiveHigh);
        assert_eq!(config.active_high().bits(), 0xC0);
        assert!(SpiConfig::new().active_high().is_empty());
    }

    #[test]
    fn test_frame_payload_fits_report() {
        assert_eq!(MAX_FRAME_PAYLOAD, 507);
    }
}
