//! List commands implementation

use crate::programmers;

/// List all compiled-in programmers
pub fn list_programmers() {
    println!("Supported programmers:");
    println!();
    for p in programmers::available_programmers() {
        println!("  {:<8} - {}", p.name, p.description);
    }
}

/// List connected CH347 devices
#[cfg(feature = "hidapi")]
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let devices = ch347_hid::Ch347::list_devices()?;
    if devices.is_empty() {
        println!("No CH347 devices found (is the chip in HID mode?)");
        return Ok(());
    }
    for (index, device) in devices.iter().enumerate() {
        println!("{:>3}: {}", index, device);
    }
    Ok(())
}

/// List connected CH347 devices
#[cfg(not(feature = "hidapi"))]
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    Err("Built without hidapi support, cannot enumerate devices".into())
}
