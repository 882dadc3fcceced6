//! CLI command implementations
//!
//! Every command opens its own controller on the session and configures it
//! from the programmer options before touching the bus.

mod i2c;
mod list;
mod spi;

pub use i2c::{cmd_i2c_read, cmd_i2c_scan, cmd_i2c_write, cmd_i2c_write_read};
pub use list::{list_devices, list_programmers};
pub use spi::{cmd_spi_read, cmd_spi_transfer, cmd_spi_write};

/// Format bytes as space-separated hex, 16 per line
pub fn format_hex(data: &[u8]) -> String {
    data.chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xAA, 0x55]), "aa 55");
        assert_eq!(format_hex(&[0; 17]).lines().count(), 2);
        assert_eq!(format_hex(&[]), "");
    }
}
