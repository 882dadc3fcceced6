//! SPI command implementations

use super::format_hex;
use crate::programmers::{Session, Transport};
use ch347_hid::SpiDevice;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Default chunk size for reading to a file (4 KiB)
const READ_CHUNK_SIZE: usize = 4096;

fn configured(session: &Session) -> Result<SpiDevice<'_, Transport>, Box<dyn std::error::Error>> {
    let mut spi = session.ch347.spi();
    spi.configure(session.options.spi.clone())?;
    Ok(spi)
}

/// Full-duplex transfer, prints what was clocked in
pub fn cmd_spi_transfer(session: &Session, data: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let mut spi = configured(session)?;
    let read = spi.transfer(data)?;
    println!("{}", format_hex(&read));
    Ok(())
}

/// Read `length` bytes, printing them or saving them to `output`
pub fn cmd_spi_read(
    session: &Session,
    length: usize,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut spi = configured(session)?;

    let Some(output) = output else {
        let data = spi.read(length)?;
        println!("{}", format_hex(&data));
        return Ok(());
    };

    let data = read_with_progress(&mut spi, length)?;
    let mut file = File::create(output)?;
    file.write_all(&data)?;

    println!("Wrote {} bytes to {:?}", data.len(), output);
    Ok(())
}

/// Read in chunks under one chip select, with a progress bar
fn read_with_progress(
    spi: &mut SpiDevice<'_, Transport>,
    length: usize,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let cs = spi
        .settings()
        .map(|s| s.cs)
        .ok_or(ch347_hid::Ch347Error::NotConfigured)?;
    let mut data = Vec::with_capacity(length);

    let pb = ProgressBar::new(length as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );

    spi.select(cs, true)?;
    let result = (|| {
        while data.len() < length {
            let chunk_size = std::cmp::min(READ_CHUNK_SIZE, length - data.len());
            data.extend(spi.read(chunk_size)?);
            pb.set_position(data.len() as u64);
        }
        Ok::<_, ch347_hid::Ch347Error>(())
    })();
    let release = spi.select(cs, false);
    result?;
    release?;

    pb.finish_with_message("Read complete");
    Ok(data)
}

/// Write-only transfer of `data`, or of the contents of `input`
pub fn cmd_spi_write(
    session: &Session,
    data: Option<&[u8]>,
    input: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let owned;
    let data = match (data, input) {
        (Some(data), _) => data,
        (None, Some(path)) => {
            owned = std::fs::read(path)?;
            &owned[..]
        }
        (None, None) => return Err("Nothing to write".into()),
    };

    let mut spi = configured(session)?;
    spi.write(data)?;
    println!("Wrote {} bytes", data.len());
    Ok(())
}
