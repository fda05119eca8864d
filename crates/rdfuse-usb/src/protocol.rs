//! DFU class request codes and descriptor parsing

use crate::error::{Result, UsbError};

/// ST Microelectronics
pub const ST_VENDOR_ID: u16 = 0x0483;
/// STM32 system bootloader in DFU mode
pub const ST_DFU_PRODUCT_ID: u16 = 0xDF11;

/// Application specific interface class
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// Device firmware upgrade subclass
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// Interface protocol of a device in DFU mode (as opposed to runtime)
pub const DFU_MODE_PROTOCOL: u8 = 0x02;

/// DFU functional descriptor type
pub const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;
/// `bcdDFUVersion` of ST's DfuSe extension
pub const DFUSE_VERSION: u16 = 0x011A;

// Class requests
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_ABORT: u8 = 6;

/// Control transfer timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// DFU functional descriptor (DFU 1.1 section 4.1.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    /// `bmAttributes`
    pub attributes: u8,
    /// `wDetachTimeOut` in milliseconds
    pub detach_timeout: u16,
    /// `wTransferSize`, maximum bytes per DFU_DNLOAD
    pub transfer_size: u16,
    /// `bcdDFUVersion`, absent in DFU 1.0 descriptors
    pub dfu_version: Option<u16>,
}

impl FunctionalDescriptor {
    /// Device accepts DFU_DNLOAD
    pub const CAN_DOWNLOAD: u8 = 1 << 0;

    /// Parse a raw descriptor including its length and type bytes
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 7 || raw[1] != DFU_FUNCTIONAL_DESCRIPTOR {
            return None;
        }
        let dfu_version = raw
            .get(7..9)
            .map(|v| u16::from_le_bytes([v[0], v[1]]));
        Some(Self {
            attributes: raw[2],
            detach_timeout: u16::from_le_bytes([raw[3], raw[4]]),
            transfer_size: u16::from_le_bytes([raw[5], raw[6]]),
            dfu_version,
        })
    }

    /// Whether the device implements the DfuSe extension
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == Some(DFUSE_VERSION)
    }

    /// Whether DFU_DNLOAD is supported
    pub fn can_download(&self) -> bool {
        self.attributes & Self::CAN_DOWNLOAD != 0
    }
}

/// Parse a `VID:PID` pair in hexadecimal
pub fn parse_device_id(s: &str) -> Result<(u16, u16)> {
    let invalid = || UsbError::InvalidDeviceId(s.to_string());
    let (vid, pid) = s.split_once(':').ok_or_else(invalid)?;
    let vid = u16::from_str_radix(vid.trim_start_matches("0x"), 16).map_err(|_| invalid())?;
    let pid = u16::from_str_radix(pid.trim_start_matches("0x"), 16).map_err(|_| invalid())?;
    Ok((vid, pid))
}
