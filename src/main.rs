//! ch347 - command line tool for the CH347 USB-HID SPI/I2C bridge
//!
//! Thin front end over the `ch347-hid` crate. Every invocation opens one
//! session on the selected programmer, runs one command and closes it.
//!
//! ```text
//! ch347 list
//! ch347 spi transfer 9f000000
//! ch347 -p ch347:spispeed=15000,cs=1 spi read 4096 -o dump.bin
//! ch347 -p dummy i2c write-read 0x50 00 16
//! ```

mod cli;
mod commands;
mod programmers;

use clap::Parser;
use cli::{Cli, Commands, I2cCommands, SpiCommands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let result = match cli.command {
        Commands::List => {
            commands::list_programmers();
            println!();
            commands::list_devices()
        }
        Commands::Reset => {
            let session = programmers::open_session(&cli.programmer)?;
            session.ch347.reset().map_err(Into::into)
        }
        Commands::Spi(subcmd) => {
            let session = programmers::open_session(&cli.programmer)?;
            match subcmd {
                SpiCommands::Transfer { data } => commands::cmd_spi_transfer(&session, &data),
                SpiCommands::Read { length, output } => {
                    commands::cmd_spi_read(&session, length, output.as_deref())
                }
                SpiCommands::Write { data, input } => {
                    commands::cmd_spi_write(&session, data.as_deref(), input.as_deref())
                }
            }
        }
        Commands::I2c(subcmd) => {
            let session = programmers::open_session(&cli.programmer)?;
            match subcmd {
                I2cCommands::Scan => commands::cmd_i2c_scan(&session),
                I2cCommands::Read { address, length } => {
                    commands::cmd_i2c_read(&session, address, length)
                }
                I2cCommands::Write { address, data } => {
                    commands::cmd_i2c_write(&session, address, &data)
                }
                I2cCommands::WriteRead {
                    address,
                    data,
                    length,
                } => commands::cmd_i2c_write_read(&session, address, &data, length),
            }
        }
    };

    result
}
