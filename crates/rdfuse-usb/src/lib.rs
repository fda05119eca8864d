//! rdfuse-usb - USB transport for DfuSe devices
//!
//! Opens a device in DFU mode with nusb, selects the DfuSe alternate
//! setting and implements [`rdfuse_core::DfuDevice`] with DFU class
//! control requests on that interface.
//!
//! # Example
//!
//! ```no_run
//! use rdfuse_usb::DfuseUsb;
//!
//! let mut dev = DfuseUsb::open()?;
//! let image = std::fs::read("firmware.bin")?;
//! let chunk = dev.transfer_size();
//! rdfuse_core::download(&mut dev, chunk, &image, Some("0x08000000:leave"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod device;
mod error;
pub mod protocol;

pub use device::{AltSetting, DfuDeviceInfo, DfuseUsb, DfuseUsbConfig};
pub use error::{Result, UsbError};
pub use protocol::parse_device_id;
