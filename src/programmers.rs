//! Programmer registration and dispatch
//!
//! A programmer string selects the backend and carries its options, e.g.
//! `ch347:index=1,spispeed=15000` or `dummy:i2cspeed=2`.

use ch347_hid::{parse_options, Ch347, Ch347Error, HidTransport, Options};
use thiserror::Error;

/// Information about a programmer
pub struct ProgrammerInfo {
    /// Name used on the command line
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// Get information about all available programmers (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_programmers() -> Vec<ProgrammerInfo> {
    let mut programmers = Vec::new();

    #[cfg(feature = "hidapi")]
    programmers.push(ProgrammerInfo {
        name: "ch347",
        description: "CH347T/CH347F in HID mode (VID:1a86 PID:55db/55de) (index=<n>)",
    });

    #[cfg(feature = "dummy")]
    programmers.push(ProgrammerInfo {
        name: "dummy",
        description: "Emulated CH347: SPI loopback, EEPROM at I2C address 0x50",
    });

    programmers
}

/// Generate a short list of programmer names for CLI help
pub fn programmer_names_short() -> String {
    let programmers = available_programmers();
    let names: Vec<&str> = programmers.iter().map(|p| p.name).collect();
    names.join(", ")
}

/// Errors from selecting and opening a programmer
#[derive(Debug, Error)]
pub enum ProgrammerError {
    /// Name does not match a compiled-in programmer
    #[error("Unknown programmer: {name} (available: {available})")]
    Unknown { name: String, available: String },

    /// Option not in key=value form
    #[error("Invalid parameter format: '{0}' (expected key=value)")]
    BadOption(String),

    /// Device or option error from the driver
    #[error(transparent)]
    Device(#[from] Ch347Error),
}

/// Parse a programmer string into name and options
///
/// Format: "name" or "name:option1=value1,option2=value2"
pub fn parse_programmer_string(s: &str) -> Result<(&str, Vec<(&str, &str)>), ProgrammerError> {
    let (name, opts) = s.split_once(':').unwrap_or((s, ""));
    let options = opts
        .split(',')
        .filter(|opt| !opt.is_empty())
        .map(|opt| {
            opt.split_once('=')
                .ok_or_else(|| ProgrammerError::BadOption(opt.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name, options))
}

/// Transport behind whichever programmer was selected
pub type Transport = Box<dyn HidTransport>;

/// Open session plus the options it was opened with
pub struct Session {
    /// Device session
    pub ch347: Ch347<Transport>,
    /// Parsed options
    pub options: Options,
}

/// Open the programmer named by `programmer`
pub fn open_session(programmer: &str) -> Result<Session, ProgrammerError> {
    let (name, mut opts) = parse_programmer_string(programmer)?;

    let mut index = 0usize;
    if let Some(pos) = opts.iter().position(|(key, _)| *key == "index") {
        let (_, value) = opts.remove(pos);
        index = value.parse().map_err(|_| {
            Ch347Error::InvalidParameter(format!("Invalid index value: {}", value))
        })?;
    }
    let options = parse_options(&opts)?;

    let transport: Transport = match name {
        #[cfg(feature = "hidapi")]
        "ch347" => Box::new(ch347_hid::HidapiTransport::open_nth(index)?),
        #[cfg(feature = "dummy")]
        "dummy" => {
            log::info!("Using emulated CH347 (ignoring index={})", index);
            Box::new(demo_device())
        }
        _ => {
            return Err(ProgrammerError::Unknown {
                name: name.to_string(),
                available: programmer_names_short(),
            })
        }
    };

    Ok(Session {
        ch347: Ch347::with_config(transport, options.session),
        options,
    })
}

/// Emulator with a blank 256-byte EEPROM on the I2C bus
#[cfg(feature = "dummy")]
fn demo_device() -> ch347_hid::dummy::DummyCh347 {
    use ch347_hid::dummy::{DummyCh347, I2cTarget};

    let device = DummyCh347::new();
    device.add_i2c_target(
        0x50,
        I2cTarget {
            registers: [0xFF; 256],
            ..I2cTarget::default()
        },
    );
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_programmer_string() {
        let (name, opts) = parse_programmer_string("ch347:index=1,spispeed=15000").unwrap();
        assert_eq!(name, "ch347");
        assert_eq!(opts, [("index", "1"), ("spispeed", "15000")]);

        let (name, opts) = parse_programmer_string("dummy").unwrap();
        assert_eq!(name, "dummy");
        assert!(opts.is_empty());

        assert!(parse_programmer_string("ch347:fast").is_err());
    }

    #[test]
    fn test_unknown_programmer() {
        assert!(matches!(
            open_session("ch341a"),
            Err(ProgrammerError::Unknown { .. })
        ));
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_dummy_session_options() {
        let session = open_session("dummy:cs=1,i2cspeed=3").unwrap();
        assert_eq!(session.options.spi.cs, ch347_hid::ChipSelect::CS2);
        assert_eq!(session.options.i2c_speed, ch347_hid::I2cSpeed::Speed750K);
    }
}
