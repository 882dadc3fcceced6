//! I2C command implementations

use super::format_hex;
use crate::programmers::{Session, Transport};
use ch347_hid::I2cDevice;

fn configured(session: &Session) -> Result<I2cDevice<'_, Transport>, Box<dyn std::error::Error>> {
    let mut i2c = session.ch347.i2c();
    i2c.configure(session.options.i2c_speed)?;
    Ok(i2c)
}

/// Probe the bus and print a map of answering addresses
pub fn cmd_i2c_scan(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    let mut i2c = configured(session)?;
    let found = i2c.scan()?;

    println!("     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f");
    for row in 0..8u8 {
        let mut line = format!("{:02x}:", row << 4);
        for col in 0..16u8 {
            let address = (row << 4) | col;
            let cell = if !(ch347_hid::SCAN_FIRST..=ch347_hid::SCAN_LAST).contains(&address) {
                "   ".to_string()
            } else if found.contains(&address) {
                format!(" {:02x}", address)
            } else {
                " --".to_string()
            };
            line.push_str(&cell);
        }
        println!("{}", line);
    }

    println!("{} device(s) found", found.len());
    Ok(())
}

/// Read and print bytes from a target
pub fn cmd_i2c_read(
    session: &Session,
    address: u8,
    length: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut i2c = configured(session)?;
    let data = i2c.read(address, length)?;
    println!("{}", format_hex(&data));
    Ok(())
}

/// Write bytes to a target
pub fn cmd_i2c_write(
    session: &Session,
    address: u8,
    data: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut i2c = configured(session)?;
    i2c.write(address, data)?;
    println!("Wrote {} bytes to 0x{:02x}", data.len(), address);
    Ok(())
}

/// Write then read behind a repeated start, print the bytes read
pub fn cmd_i2c_write_read(
    session: &Session,
    address: u8,
    data: &[u8],
    length: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut i2c = configured(session)?;
    let read = i2c.write_then_read(address, data, length)?;
    println!("{}", format_hex(&read));
    Ok(())
}
