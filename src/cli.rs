//! CLI argument parsing

use crate::programmers;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u8
fn parse_address(s: &str) -> Result<u8, String> {
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))?
    } else {
        s.parse::<u8>().map_err(|e| format!("Invalid number: {}", e))?
    };
    if value > 0x7F {
        return Err(format!("0x{:02X} is not a 7-bit I2C address", value));
    }
    Ok(value)
}

/// Parse a byte string like "9f0000", "9F 00 00" or "0x9f,0x00"
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(format!("Invalid hex digit '{}' in '{}'", bad, s));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{}'", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect()
}

/// Generate dynamic help text for the programmer argument
fn programmer_help() -> String {
    format!(
        "Programmer to use, with options as name:key=value,... [available: {}]",
        programmers::programmer_names_short()
    )
}

#[derive(Parser)]
#[command(name = "ch347")]
#[command(author, version, about = "CH347 USB-HID SPI/I2C bridge tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short, long, global = true, default_value = "ch347", help = programmer_help())]
    pub programmer: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected CH347 devices
    List,

    /// Reset the chip's SPI/I2C engine
    Reset,

    /// SPI operations
    #[command(subcommand)]
    Spi(SpiCommands),

    /// I2C operations
    #[command(subcommand)]
    I2c(I2cCommands),
}

#[derive(Subcommand)]
pub enum SpiCommands {
    /// Full-duplex transfer, prints the bytes read back
    Transfer {
        /// Bytes to send, in hex
        #[arg(value_parser = parse_hex_bytes)]
        data: ::std::vec::Vec<u8>,
    },

    /// Clock in bytes
    Read {
        /// Number of bytes to read
        length: usize,

        /// Write the data to a file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Clock out bytes, discarding the input
    Write {
        /// Bytes to send, in hex
        #[arg(value_parser = parse_hex_bytes, required_unless_present = "input")]
        data: Option<::std::vec::Vec<u8>>,

        /// Send the contents of a file
        #[arg(short, long, conflicts_with = "data")]
        input: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum I2cCommands {
    /// Probe every 7-bit address and list the ones that answer
    Scan,

    /// Read bytes from a target
    Read {
        /// 7-bit target address
        #[arg(value_parser = parse_address)]
        address: u8,

        /// Number of bytes to read
        length: usize,
    },

    /// Write bytes to a target
    Write {
        /// 7-bit target address
        #[arg(value_parser = parse_address)]
        address: u8,

        /// Bytes to write, in hex
        #[arg(value_parser = parse_hex_bytes)]
        data: ::std::vec::Vec<u8>,
    },

    /// Write then read behind a repeated start
    WriteRead {
        /// 7-bit target address
        #[arg(value_parser = parse_address)]
        address: u8,

        /// Bytes to write, in hex
        #[arg(value_parser = parse_hex_bytes)]
        data: ::std::vec::Vec<u8>,

        /// Number of bytes to read
        length: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("9f0000").unwrap(), [0x9F, 0, 0]);
        assert_eq!(parse_hex_bytes("0x9f,0x01 AA").unwrap(), [0x9F, 0x01, 0xAA]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x50").unwrap(), 0x50);
        assert_eq!(parse_address("80").unwrap(), 80);
        assert!(parse_address("0x80").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "ch347",
            "-p",
            "dummy",
            "i2c",
            "write-read",
            "0x50",
            "10",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.programmer, "dummy");
        assert!(matches!(
            cli.command,
            Commands::I2c(I2cCommands::WriteRead {
                address: 0x50,
                length: 4,
                ..
            })
        ));
    }
}
