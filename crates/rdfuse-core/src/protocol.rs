//! DFU and DfuSe protocol types
//!
//! State and status codes follow the USB DFU 1.1 class specification.
//! The special command encoding follows ST's DfuSe 1.1a extension
//! (AN3156): an op-code byte, optionally followed by a little-endian
//! 32-bit address, sent as the payload of a `DFU_DNLOAD` with
//! transaction number 0.

use core::fmt;

use crate::error::{Error, Result};

/// Set Address Pointer op-code
pub const OP_SET_ADDRESS: u8 = 0x21;
/// Erase op-code (page erase with an address, mass erase without)
pub const OP_ERASE: u8 = 0x41;
/// Read Unprotect op-code
pub const OP_READ_UNPROTECT: u8 = 0x92;

/// Transaction number carrying special commands
pub const TRANSACTION_COMMAND: u16 = 0;
/// Transaction number for data written at the address pointer itself
pub const TRANSACTION_NO_OFFSET: u16 = 2;

/// Poll-timeout STM32F405 reports for mass erase, which is far too short
pub const MASS_ERASE_FALSE_TIMEOUT_MS: u32 = 100;
/// Poll-timeout used instead of [`MASS_ERASE_FALSE_TIMEOUT_MS`]
pub const MASS_ERASE_TIMEOUT_MS: u32 = 35_000;

/// Length of a `DFU_GETSTATUS` response
pub const STATUS_LEN: usize = 6;

/// DfuSe special commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuseCommand {
    /// Set the address pointer for the next transfer
    SetAddress,
    /// Erase the page containing an address
    ErasePage,
    /// Erase the whole device
    MassErase,
    /// Remove read protection (erases the device and resets it)
    ReadUnprotect,
}

impl DfuseCommand {
    /// Display name of the command
    pub fn name(self) -> &'static str {
        match self {
            Self::SetAddress => "SET_ADDRESS",
            Self::ErasePage => "ERASE_PAGE",
            Self::MassErase => "MASS_ERASE",
            Self::ReadUnprotect => "READ_UNPROTECT",
        }
    }

    /// Op-code byte sent first in the command buffer
    pub fn opcode(self) -> u8 {
        match self {
            Self::SetAddress => OP_SET_ADDRESS,
            Self::ErasePage | Self::MassErase => OP_ERASE,
            Self::ReadUnprotect => OP_READ_UNPROTECT,
        }
    }

    /// Number of bytes of the command buffer that are sent
    ///
    /// MASS_ERASE shares its op-code with ERASE_PAGE and is told apart by
    /// its length.
    pub fn payload_len(self) -> usize {
        match self {
            Self::SetAddress | Self::ErasePage => 5,
            Self::MassErase | Self::ReadUnprotect => 1,
        }
    }

    /// Build the command buffer; only `payload_len()` bytes are meaningful
    pub fn encode(self, address: u32) -> [u8; 5] {
        let mut buf = [0u8; 5];
        buf[0] = self.opcode();
        buf[1..].copy_from_slice(&address.to_le_bytes());
        buf
    }

    /// Decode a special command payload into the command and its address
    ///
    /// Commands without an address decode with address 0.
    pub fn decode(payload: &[u8]) -> Result<(Self, u32)> {
        let address = |p: &[u8]| u32::from_le_bytes([p[1], p[2], p[3], p[4]]);
        match (payload.first().copied(), payload.len()) {
            (Some(OP_SET_ADDRESS), 5) => Ok((Self::SetAddress, address(payload))),
            (Some(OP_ERASE), 5) => Ok((Self::ErasePage, address(payload))),
            (Some(OP_ERASE), 1) => Ok((Self::MassErase, 0)),
            (Some(OP_READ_UNPROTECT), 1) => Ok((Self::ReadUnprotect, 0)),
            (Some(op), _) => Err(Error::UnsupportedCommand(op)),
            (None, _) => Err(Error::UnsupportedCommand(0)),
        }
    }
}

impl fmt::Display for DfuseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// DFU device state (`bState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuState {
    /// Running the application
    AppIdle,
    /// Application received DFU_DETACH and waits for a reset
    AppDetach,
    /// DFU mode, waiting for requests
    DfuIdle,
    /// Block received, waiting for DFU_GETSTATUS
    DfuDnloadSync,
    /// Programming a block
    DfuDnBusy,
    /// Download in progress, expecting DFU_DNLOAD
    DfuDnloadIdle,
    /// Final block received, waiting for DFU_GETSTATUS
    DfuManifestSync,
    /// Manifestation in progress
    DfuManifest,
    /// Manifestation done, waiting for a reset
    DfuManifestWaitReset,
    /// Upload in progress, expecting DFU_UPLOAD
    DfuUploadIdle,
    /// An error occurred, awaiting DFU_CLRSTATUS
    DfuError,
    /// State value outside the DFU 1.1 range
    Other(u8),
}

impl DfuState {
    /// Decode a `bState` value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DfuDnloadSync,
            4 => Self::DfuDnBusy,
            5 => Self::DfuDnloadIdle,
            6 => Self::DfuManifestSync,
            7 => Self::DfuManifest,
            8 => Self::DfuManifestWaitReset,
            9 => Self::DfuUploadIdle,
            10 => Self::DfuError,
            other => Self::Other(other),
        }
    }

    /// Encode as a `bState` value
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AppIdle => 0,
            Self::AppDetach => 1,
            Self::DfuIdle => 2,
            Self::DfuDnloadSync => 3,
            Self::DfuDnBusy => 4,
            Self::DfuDnloadIdle => 5,
            Self::DfuManifestSync => 6,
            Self::DfuManifest => 7,
            Self::DfuManifestWaitReset => 8,
            Self::DfuUploadIdle => 9,
            Self::DfuError => 10,
            Self::Other(value) => value,
        }
    }

    /// Name as used in the DFU specification
    pub fn name(self) -> &'static str {
        match self {
            Self::AppIdle => "appIDLE",
            Self::AppDetach => "appDETACH",
            Self::DfuIdle => "dfuIDLE",
            Self::DfuDnloadSync => "dfuDNLOAD-SYNC",
            Self::DfuDnBusy => "dfuDNBUSY",
            Self::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            Self::DfuManifestSync => "dfuMANIFEST-SYNC",
            Self::DfuManifest => "dfuMANIFEST",
            Self::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            Self::DfuUploadIdle => "dfuUPLOAD-IDLE",
            Self::DfuError => "dfuERROR",
            Self::Other(_) => "unknown state",
        }
    }

    /// Whether a download request has finished being processed
    pub fn download_settled(self) -> bool {
        matches!(
            self,
            Self::DfuDnloadIdle | Self::DfuError | Self::DfuManifest
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u8())
    }
}

/// DFU status code (`bStatus`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuStatusCode {
    /// No error
    Ok,
    /// File is not targeted for use by this device
    ErrTarget,
    /// File fails some vendor-specific verification test
    ErrFile,
    /// Device is unable to write memory
    ErrWrite,
    /// Memory erase function failed
    ErrErase,
    /// Memory erase check failed
    ErrCheckErased,
    /// Program memory function failed
    ErrProg,
    /// Programmed memory failed verification
    ErrVerify,
    /// Received address is out of range
    ErrAddress,
    /// Zero-length download before all data was received
    ErrNotDone,
    /// Device firmware is corrupt
    ErrFirmware,
    /// Vendor-specific error
    ErrVendor,
    /// Unexpected USB reset
    ErrUsbr,
    /// Unexpected power on reset
    ErrPor,
    /// Unknown error
    ErrUnknown,
    /// Device stalled an unexpected request
    ErrStalledPkt,
    /// Status value outside the DFU 1.1 range
    Other(u8),
}

impl DfuStatusCode {
    /// Decode a `bStatus` value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbr,
            0x0D => Self::ErrPor,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPkt,
            other => Self::Other(other),
        }
    }

    /// Encode as a `bStatus` value
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::ErrTarget => 0x01,
            Self::ErrFile => 0x02,
            Self::ErrWrite => 0x03,
            Self::ErrErase => 0x04,
            Self::ErrCheckErased => 0x05,
            Self::ErrProg => 0x06,
            Self::ErrVerify => 0x07,
            Self::ErrAddress => 0x08,
            Self::ErrNotDone => 0x09,
            Self::ErrFirmware => 0x0A,
            Self::ErrVendor => 0x0B,
            Self::ErrUsbr => 0x0C,
            Self::ErrPor => 0x0D,
            Self::ErrUnknown => 0x0E,
            Self::ErrStalledPkt => 0x0F,
            Self::Other(value) => value,
        }
    }

    /// Human readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "No error condition is present",
            Self::ErrTarget => "File is not targeted for use by this device",
            Self::ErrFile => "File is for this device but fails some vendor-specific test",
            Self::ErrWrite => "Device is unable to write memory",
            Self::ErrErase => "Memory erase function failed",
            Self::ErrCheckErased => "Memory erase check failed",
            Self::ErrProg => "Program memory function failed",
            Self::ErrVerify => "Programmed memory failed verification",
            Self::ErrAddress => "Cannot program memory due to received address that is out of range",
            Self::ErrNotDone => "Received zero-length DFU_DNLOAD but device expected more data",
            Self::ErrFirmware => "Device's firmware is corrupt",
            Self::ErrVendor => "Vendor-specific error",
            Self::ErrUsbr => "Device detected unexpected USB reset signaling",
            Self::ErrPor => "Device detected unexpected power on reset",
            Self::ErrUnknown => "Something went wrong, but the device does not know what",
            Self::ErrStalledPkt => "Device stalled an unexpected request",
            Self::Other(_) => "Unknown status code",
        }
    }

    /// Whether this is the OK status
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.description(), self.as_u8())
    }
}

/// Result of a `DFU_GETSTATUS` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Status code
    pub status: DfuStatusCode,
    /// Minimum time in milliseconds before the next status request
    pub poll_timeout: u32,
    /// Device state
    pub state: DfuState,
    /// Index of a status description string descriptor
    pub string_index: u8,
}

impl DeviceStatus {
    /// Build a status without a description string
    pub fn new(state: DfuState, status: DfuStatusCode, poll_timeout: u32) -> Self {
        Self {
            status,
            poll_timeout,
            state,
            string_index: 0,
        }
    }

    /// Decode the 6-byte `DFU_GETSTATUS` response
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_LEN {
            return Err(Error::Transport(format!(
                "status response too short: {} of {} bytes",
                buf.len(),
                STATUS_LEN
            )));
        }
        Ok(Self {
            status: DfuStatusCode::from_u8(buf[0]),
            poll_timeout: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: DfuState::from_u8(buf[4]),
            string_index: buf[5],
        })
    }

    /// Encode as a 6-byte `DFU_GETSTATUS` response
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let timeout = self.poll_timeout.to_le_bytes();
        [
            self.status.as_u8(),
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.as_u8(),
            self.string_index,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_commands() {
        let buf = DfuseCommand::SetAddress.encode(0x0800_1234);
        assert_eq!(buf, [0x21, 0x34, 0x12, 0x00, 0x08]);
        assert_eq!(DfuseCommand::SetAddress.payload_len(), 5);

        let buf = DfuseCommand::ErasePage.encode(0x0800_0800);
        assert_eq!(buf, [0x41, 0x00, 0x08, 0x00, 0x08]);
        assert_eq!(DfuseCommand::ErasePage.payload_len(), 5);

        assert_eq!(DfuseCommand::MassErase.encode(0)[0], 0x41);
        assert_eq!(DfuseCommand::MassErase.payload_len(), 1);
        assert_eq!(DfuseCommand::ReadUnprotect.encode(0)[0], 0x92);
        assert_eq!(DfuseCommand::ReadUnprotect.payload_len(), 1);
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(
            DfuseCommand::decode(&[0x21, 0x00, 0x00, 0x00, 0x08]).unwrap(),
            (DfuseCommand::SetAddress, 0x0800_0000)
        );
        assert_eq!(
            DfuseCommand::decode(&[0x41]).unwrap(),
            (DfuseCommand::MassErase, 0)
        );
        assert_eq!(
            DfuseCommand::decode(&[0x41, 0x00, 0x40, 0x00, 0x08]).unwrap(),
            (DfuseCommand::ErasePage, 0x0800_4000)
        );
        assert_eq!(
            DfuseCommand::decode(&[0x55, 0, 0, 0, 0]),
            Err(Error::UnsupportedCommand(0x55))
        );
        assert_eq!(
            DfuseCommand::decode(&[0x21]),
            Err(Error::UnsupportedCommand(0x21))
        );
    }

    #[test]
    fn test_status_bytes() {
        let status = DeviceStatus::from_bytes(&[0x00, 0x64, 0x00, 0x00, 0x04, 0x00]).unwrap();
        assert_eq!(status.status, DfuStatusCode::Ok);
        assert_eq!(status.poll_timeout, 100);
        assert_eq!(status.state, DfuState::DfuDnBusy);
        assert_eq!(status.to_bytes(), [0x00, 0x64, 0x00, 0x00, 0x04, 0x00]);

        let status = DeviceStatus::from_bytes(&[0x0A, 0xB8, 0x88, 0x00, 0x0A, 0x00]).unwrap();
        assert_eq!(status.status, DfuStatusCode::ErrFirmware);
        assert_eq!(status.poll_timeout, 35_000);
        assert_eq!(status.state, DfuState::DfuError);

        assert!(matches!(
            DeviceStatus::from_bytes(&[0, 0, 0]),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_unknown_codes_round_trip() {
        assert_eq!(DfuState::from_u8(42), DfuState::Other(42));
        assert_eq!(DfuState::Other(42).as_u8(), 42);
        assert_eq!(DfuStatusCode::from_u8(0x80).as_u8(), 0x80);
        assert!(DfuState::DfuManifest.download_settled());
        assert!(!DfuState::DfuDnBusy.download_settled());
    }
}
