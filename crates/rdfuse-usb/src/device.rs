//! DFU device access over nusb

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::descriptors::language_id::US_ENGLISH;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Interface, MaybeFuture};
use rdfuse_core::{DeviceStatus, DfuDevice};

use crate::error::{Result, UsbError};
use crate::protocol::*;

/// Selects the alternate setting of the DFU interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltSetting {
    /// By `bAlternateSetting`
    Number(u8),
    /// By the alternate setting's name string
    Name(String),
}

impl Default for AltSetting {
    fn default() -> Self {
        AltSetting::Number(0)
    }
}

impl std::fmt::Display for AltSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AltSetting::Number(n) => write!(f, "{}", n),
            AltSetting::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Configuration for opening a DFU device
#[derive(Debug, Clone)]
pub struct DfuseUsbConfig {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Alternate setting to activate
    pub alt: AltSetting,
    /// Override for `wTransferSize`
    pub transfer_size: Option<u16>,
    /// Control transfer timeout
    pub timeout: Duration,
}

impl Default for DfuseUsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: ST_VENDOR_ID,
            product_id: ST_DFU_PRODUCT_ID,
            alt: AltSetting::default(),
            transfer_size: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Information about a connected device in DFU mode
#[derive(Debug, Clone)]
pub struct DfuDeviceInfo {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Bus identifier
    pub bus: String,
    /// Device address on the bus
    pub address: u8,
    /// Product string, if the device reports one
    pub product: Option<String>,
}

struct AltInfo {
    interface: u8,
    alt: u8,
    name: String,
    functional: Option<FunctionalDescriptor>,
}

/// A DfuSe device opened over USB
pub struct DfuseUsb {
    interface: Interface,
    interface_number: u8,
    alt_setting: u8,
    alt_name: String,
    transfer_size: u16,
    dfu_version: Option<u16>,
    timeout: Duration,
}

impl DfuseUsb {
    /// Open the first STM32 bootloader found
    pub fn open() -> Result<Self> {
        Self::open_with_config(DfuseUsbConfig::default())
    }

    /// Open a device with the specified configuration
    pub fn open_with_config(config: DfuseUsbConfig) -> Result<Self> {
        let device_info = nusb::list_devices()
            .wait()?
            .find(|d| d.vendor_id() == config.vendor_id && d.product_id() == config.product_id)
            .ok_or(UsbError::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            })?;

        log::info!(
            "Opening {:04x}:{:04x} at bus {} address {}",
            config.vendor_id,
            config.product_id,
            device_info.bus_id(),
            device_info.device_address()
        );

        let device = device_info.open().wait()?;
        let alts = dfu_alt_settings(&device, config.timeout)?;
        if alts.is_empty() {
            return Err(UsbError::NoDfuInterface);
        }

        let selected = alts
            .into_iter()
            .find(|a| match &config.alt {
                AltSetting::Number(n) => a.alt == *n,
                AltSetting::Name(name) => a.name == *name,
            })
            .ok_or_else(|| UsbError::AltSettingNotFound(config.alt.to_string()))?;
        if selected.name.is_empty() {
            return Err(UsbError::NoAltName(selected.alt));
        }

        let interface = device
            .claim_interface(selected.interface)
            .wait()
            .map_err(|e| UsbError::ClaimFailed {
                interface: selected.interface,
                reason: e.to_string(),
            })?;
        interface
            .set_alt_setting(selected.alt)
            .wait()
            .map_err(|e| UsbError::ClaimFailed {
                interface: selected.interface,
                reason: e.to_string(),
            })?;

        let functional = selected.functional;
        let transfer_size = match (config.transfer_size, functional) {
            (Some(size), _) => size,
            (None, Some(desc)) => desc.transfer_size,
            (None, None) => {
                log::warn!("No DFU functional descriptor, assuming 1024 byte transfers");
                1024
            }
        };
        if let Some(desc) = functional {
            if !desc.is_dfuse() {
                log::warn!(
                    "Device reports DFU version {:04x}, not DfuSe",
                    desc.dfu_version.unwrap_or(0x0100)
                );
            }
            if !desc.can_download() {
                log::warn!(
                    "Device does not advertise download support (bmAttributes 0x{:02x})",
                    desc.attributes
                );
            }
        }

        let mut dfu = Self {
            interface,
            interface_number: selected.interface,
            alt_setting: selected.alt,
            alt_name: selected.name,
            transfer_size,
            dfu_version: functional.and_then(|d| d.dfu_version),
            timeout: config.timeout,
        };

        log::info!(
            "Claimed interface {} alt {} \"{}\", transfer size {}",
            dfu.interface_number,
            dfu.alt_setting,
            dfu.alt_name,
            dfu.transfer_size
        );

        rdfuse_core::ensure_idle(&mut dfu)?;
        Ok(dfu)
    }

    /// List all connected devices with an interface in DFU mode
    pub fn list_devices() -> Result<Vec<DfuDeviceInfo>> {
        let devices = nusb::list_devices()
            .wait()?
            .filter(|d| {
                d.interfaces().any(|i| {
                    i.class() == DFU_INTERFACE_CLASS && i.subclass() == DFU_INTERFACE_SUBCLASS
                })
            })
            .map(|d| DfuDeviceInfo {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                bus: d.bus_id().to_string(),
                address: d.device_address(),
                product: d.product_string().map(str::to_string),
            })
            .collect();
        Ok(devices)
    }

    /// Negotiated transfer size
    pub fn transfer_size(&self) -> usize {
        usize::from(self.transfer_size)
    }

    /// `bcdDFUVersion` of the functional descriptor
    pub fn dfu_version(&self) -> Option<u16> {
        self.dfu_version
    }

    fn class_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: u16::from(self.interface_number),
                    data,
                },
                self.timeout,
            )
            .wait()?;
        Ok(())
    }

    fn class_in(&mut self, request: u8, length: u16) -> Result<Vec<u8>> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value: 0,
                    index: u16::from(self.interface_number),
                    length,
                },
                self.timeout,
            )
            .wait()?;
        Ok(data)
    }
}

impl DfuDevice for DfuseUsb {
    fn alt_name(&self) -> &str {
        &self.alt_name
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> rdfuse_core::Result<usize> {
        log::trace!("DFU_DNLOAD wValue {} length {}", transaction, data.len());
        self.class_out(DFU_DNLOAD, transaction, data)?;
        Ok(data.len())
    }

    fn get_status(&mut self) -> rdfuse_core::Result<DeviceStatus> {
        let data = self.class_in(DFU_GETSTATUS, rdfuse_core::protocol::STATUS_LEN as u16)?;
        DeviceStatus::from_bytes(&data)
    }

    fn clear_status(&mut self) -> rdfuse_core::Result<()> {
        Ok(self.class_out(DFU_CLRSTATUS, 0, &[])?)
    }

    fn abort(&mut self) -> rdfuse_core::Result<()> {
        Ok(self.class_out(DFU_ABORT, 0, &[])?)
    }
}

/// Collect every alternate setting of every DFU-mode interface
fn dfu_alt_settings(device: &nusb::Device, timeout: Duration) -> Result<Vec<AltInfo>> {
    let config = device
        .active_configuration()
        .map_err(|e| UsbError::OpenFailed(e.to_string()))?;

    let mut alts = Vec::new();
    for desc in config.interface_alt_settings() {
        if desc.class() != DFU_INTERFACE_CLASS
            || desc.subclass() != DFU_INTERFACE_SUBCLASS
            || desc.protocol() != DFU_MODE_PROTOCOL
        {
            continue;
        }
        let name = match desc.string_index() {
            Some(index) => read_string(device, index, timeout),
            None => String::new(),
        };
        let functional = desc
            .descriptors()
            .find_map(|d| FunctionalDescriptor::parse(&d));
        log::debug!(
            "DFU interface {} alt {}: \"{}\"",
            desc.interface_number(),
            desc.alternate_setting(),
            name
        );
        alts.push(AltInfo {
            interface: desc.interface_number(),
            alt: desc.alternate_setting(),
            name,
            functional,
        });
    }
    Ok(alts)
}

fn read_string(device: &nusb::Device, index: NonZeroU8, timeout: Duration) -> String {
    match device
        .get_string_descriptor(index, US_ENGLISH, timeout)
        .wait()
    {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read string descriptor {}: {}", index, e);
            String::new()
        }
    }
}
