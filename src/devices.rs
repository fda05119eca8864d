//! Device backend registration and dispatch
//!
//! Backends are feature-gated: `usb` talks to real hardware through nusb,
//! `dummy` runs against the in-memory emulator.

use crate::cli::DeviceArgs;
use rdfuse_core::DfuDevice;

/// Information about a device backend
pub struct BackendInfo {
    /// Name used on the command line
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// Get information about all backends enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "usb")]
    backends.push(BackendInfo {
        name: "VID:PID",
        description: "DfuSe device over USB (default 0483:df11, STM32 bootloader)",
    });

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        description: "In-memory STM32F405 emulator for testing (--alt may give a layout string)",
    });

    backends
}

/// An opened device with its negotiated transfer size
pub struct OpenedDevice {
    pub device: Box<dyn DfuDevice>,
    pub transfer_size: usize,
}

/// Open the device selected on the command line
pub fn open_device(args: &DeviceArgs) -> Result<OpenedDevice, Box<dyn std::error::Error>> {
    if args.device == "dummy" {
        return open_dummy(args);
    }
    open_usb(args)
}

#[cfg(feature = "dummy")]
fn open_dummy(args: &DeviceArgs) -> Result<OpenedDevice, Box<dyn std::error::Error>> {
    use rdfuse_dummy::{DummyConfig, DummyDfuse};

    let mut config = DummyConfig::default();
    if let Some(alt) = args.alt.as_deref().filter(|a| a.starts_with('@')) {
        config.alt_name = alt.to_string();
    }
    if let Some(size) = args.transfer_size {
        config.transfer_size = usize::from(size);
    }
    let transfer_size = config.transfer_size;
    log::info!("Using emulated device \"{}\"", config.alt_name);

    Ok(OpenedDevice {
        device: Box::new(DummyDfuse::new(config)?),
        transfer_size,
    })
}

#[cfg(not(feature = "dummy"))]
fn open_dummy(_args: &DeviceArgs) -> Result<OpenedDevice, Box<dyn std::error::Error>> {
    Err("dummy device support not compiled in (enable the 'dummy' feature)".into())
}

#[cfg(feature = "usb")]
fn open_usb(args: &DeviceArgs) -> Result<OpenedDevice, Box<dyn std::error::Error>> {
    use rdfuse_usb::{parse_device_id, AltSetting, DfuseUsb, DfuseUsbConfig};

    let (vendor_id, product_id) = parse_device_id(&args.device)?;
    let alt = match args.alt.as_deref() {
        None => AltSetting::default(),
        Some(alt) => match alt.parse::<u8>() {
            Ok(number) => AltSetting::Number(number),
            Err(_) => AltSetting::Name(alt.to_string()),
        },
    };

    let usb = DfuseUsb::open_with_config(DfuseUsbConfig {
        vendor_id,
        product_id,
        alt,
        transfer_size: args.transfer_size,
        ..Default::default()
    })?;
    let transfer_size = usb.transfer_size();

    Ok(OpenedDevice {
        device: Box::new(usb),
        transfer_size,
    })
}

#[cfg(not(feature = "usb"))]
fn open_usb(args: &DeviceArgs) -> Result<OpenedDevice, Box<dyn std::error::Error>> {
    Err(format!(
        "cannot open {}: USB support not compiled in (enable the 'usb' feature)",
        args.device
    )
    .into())
}
