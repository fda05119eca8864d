//! List command implementation

use crate::devices;

/// List connected devices in DFU mode and the available backends
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "usb")]
    {
        let found = rdfuse_usb::DfuseUsb::list_devices()?;
        if found.is_empty() {
            println!("No devices in DFU mode found");
        }
        for dev in found {
            println!(
                "Found DFU: [{:04x}:{:04x}] bus {} address {} \"{}\"",
                dev.vendor_id,
                dev.product_id,
                dev.bus,
                dev.address,
                dev.product.as_deref().unwrap_or("")
            );
        }
        println!();
    }

    println!("Device backends:");
    for backend in devices::available_backends() {
        println!("  {:<8} - {}", backend.name, backend.description);
    }
    Ok(())
}
