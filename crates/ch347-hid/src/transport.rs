//! HID transport abstraction
//!
//! The protocol engine only needs to write whole reports and read whole
//! reports with a bounded wait. Anything that can do that (a real hidapi
//! handle, the in-memory emulator, a test double) implements
//! [`HidTransport`].

use crate::error::Result;

/// Transport trait for exchanging HID reports
pub trait HidTransport {
    /// Write one output report (report ID included)
    ///
    /// Returns the number of bytes the OS accepted.
    fn write(&mut self, report: &[u8]) -> Result<usize>;

    /// Read one input report, waiting up to `timeout_ms` milliseconds
    ///
    /// Returns the number of bytes read, or 0 on timeout.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;
}

impl<T: HidTransport + ?Sized> HidTransport for Box<T> {
    fn write(&mut self, report: &[u8]) -> Result<usize> {
        (**self).write(report)
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        (**self).read(buf, timeout_ms)
    }
}

#[cfg(feature = "hidapi")]
pub mod hid {
    //! hidapi transport implementation

    use super::HidTransport;
    use crate::error::{Ch347Error, Result};
    use crate::protocol::{
        Ch347Variant, CH347_HID_INTERFACE, CH347_USB_VENDOR, CH347F_USB_PRODUCT,
        CH347T_USB_PRODUCT,
    };
    use hidapi::{DeviceInfo, HidApi, HidDevice};

    /// Information about a connected CH347 HID interface
    #[derive(Debug, Clone)]
    pub struct Ch347DeviceInfo {
        /// OS path of the HID interface
        pub path: String,
        /// Device variant
        pub variant: Ch347Variant,
        /// USB serial number, if the device reports one
        pub serial: Option<String>,
    }

    impl std::fmt::Display for Ch347DeviceInfo {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{} at {}", self.variant, self.path)?;
            if let Some(serial) = &self.serial {
                write!(f, " (serial {})", serial)?;
            }
            Ok(())
        }
    }

    fn is_ch347_spi_interface(d: &DeviceInfo) -> bool {
        d.vendor_id() == CH347_USB_VENDOR
            && (d.product_id() == CH347T_USB_PRODUCT || d.product_id() == CH347F_USB_PRODUCT)
            && d.interface_number() == CH347_HID_INTERFACE
    }

    /// hidapi-backed transport
    pub struct HidapiTransport {
        device: HidDevice,
    }

    impl HidapiTransport {
        /// Open the HID interface matching the given IDs and interface number
        pub fn open(vendor_id: u16, product_id: u16, interface: i32) -> Result<Self> {
            let api = HidApi::new().map_err(|e| Ch347Error::OpenFailed(e.to_string()))?;
            let info = api
                .device_list()
                .find(|d| {
                    d.vendor_id() == vendor_id
                        && d.product_id() == product_id
                        && d.interface_number() == interface
                })
                .ok_or(Ch347Error::DeviceNotFound)?;

            log::info!(
                "Opening HID device {:04X}:{:04X} interface {} at {}",
                vendor_id,
                product_id,
                interface,
                info.path().to_string_lossy()
            );

            let device = info
                .open_device(&api)
                .map_err(|e| Ch347Error::OpenFailed(e.to_string()))?;
            Ok(Self { device })
        }

        /// Open the nth CH347 (0-indexed), either variant
        pub fn open_nth(index: usize) -> Result<Self> {
            let api = HidApi::new().map_err(|e| Ch347Error::OpenFailed(e.to_string()))?;
            let info = api
                .device_list()
                .filter(|d| is_ch347_spi_interface(d))
                .nth(index)
                .ok_or(Ch347Error::DeviceNotFound)?;

            log::info!(
                "Opening CH347 at {}",
                info.path().to_string_lossy()
            );

            let device = info
                .open_device(&api)
                .map_err(|e| Ch347Error::OpenFailed(e.to_string()))?;
            Ok(Self { device })
        }

        /// List all connected CH347 HID interfaces
        pub fn list_devices() -> Result<Vec<Ch347DeviceInfo>> {
            let api = HidApi::new().map_err(|e| Ch347Error::OpenFailed(e.to_string()))?;
            let devices = api
                .device_list()
                .filter(|d| is_ch347_spi_interface(d))
                .filter_map(|d| {
                    Some(Ch347DeviceInfo {
                        path: d.path().to_string_lossy().into_owned(),
                        variant: Ch347Variant::from_product_id(d.product_id())?,
                        serial: d.serial_number().map(str::to_owned),
                    })
                })
                .collect();
            Ok(devices)
        }
    }

    impl HidTransport for HidapiTransport {
        fn write(&mut self, report: &[u8]) -> Result<usize> {
            let n = self.device.write(report)?;
            log::trace!("HID write {} bytes", n);
            Ok(n)
        }

        fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
            let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
            let n = self.device.read_timeout(buf, timeout)?;
            log::trace!("HID read {} bytes", n);
            Ok(n)
        }
    }
}
