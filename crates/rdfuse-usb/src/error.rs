//! Error types for the USB transport

use thiserror::Error;

/// Result type for USB operations
pub type Result<T> = std::result::Result<T, UsbError>;

/// Errors that can occur when talking to a DFU device over USB
#[derive(Debug, Error)]
pub enum UsbError {
    #[error("No DFU device found with ID {vendor_id:04x}:{product_id:04x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {reason}")]
    ClaimFailed { interface: u8, reason: String },

    #[error("Device has no interface in DFU mode")]
    NoDfuInterface,

    #[error("No DFU alternate setting matches \"{0}\"")]
    AltSettingNotFound(String),

    #[error("Alternate setting {0} has no DfuSe memory layout name")]
    NoAltName(u8),

    #[error("USB transfer failed: {0}")]
    TransferFailed(String),

    #[error("Invalid device ID \"{0}\", expected VID:PID in hexadecimal")]
    InvalidDeviceId(String),

    #[error(transparent)]
    Core(#[from] rdfuse_core::Error),
}

impl From<UsbError> for rdfuse_core::Error {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::Core(e) => e,
            other => rdfuse_core::Error::Transport(other.to_string()),
        }
    }
}

impl From<nusb::Error> for UsbError {
    fn from(e: nusb::Error) -> Self {
        UsbError::OpenFailed(e.to_string())
    }
}

impl From<nusb::transfer::TransferError> for UsbError {
    fn from(e: nusb::transfer::TransferError) -> Self {
        UsbError::TransferFailed(e.to_string())
    }
}
