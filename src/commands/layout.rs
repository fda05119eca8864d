//! Layout command implementation

use rdfuse_core::MemoryLayout;

use crate::cli::DeviceArgs;
use crate::devices;

/// Show the memory layout advertised by the selected alternate setting
pub fn cmd_show(args: &DeviceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opened = devices::open_device(args)?;
    let layout = MemoryLayout::parse(opened.device.alt_name())?;
    println!("Transfer size: {} bytes", opened.transfer_size);
    print_layout(&layout);
    Ok(())
}

fn print_layout(layout: &MemoryLayout) {
    println!("Memory: {}", layout.name);
    println!("{}", "-".repeat(72));
    for segment in &layout.segments {
        println!("  {}  ({})", segment, format_size(segment.size()));
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}
