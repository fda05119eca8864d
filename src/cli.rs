//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a transfer size, which must fit `wTransferSize`
fn parse_transfer_size(s: &str) -> Result<u16, String> {
    let size = parse_hex_u32(s)?;
    match u16::try_from(size) {
        Ok(0) => Err("Transfer size must not be zero".to_string()),
        Ok(size) => Ok(size),
        Err(_) => Err(format!("Transfer size {} exceeds 65535", size)),
    }
}

#[derive(Parser)]
#[command(name = "rdfuse")]
#[command(author, version, about = "DfuSe firmware downloader for STM32 bootloaders", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Device selection shared across commands
#[derive(clap::Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Device to open: VID:PID in hex, or "dummy" for the emulator
    #[arg(short, long, default_value = "0483:df11")]
    pub device: String,

    /// Alternate setting of the DFU interface, by number or name
    #[arg(short, long)]
    pub alt: Option<String>,

    /// Override the device's transfer size (hex or decimal)
    #[arg(short, long, value_parser = parse_transfer_size)]
    pub transfer_size: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a binary image to the device
    Download {
        #[command(flatten)]
        device: DeviceArgs,

        /// Binary image to write
        #[arg(short = 'D', long = "download")]
        input: PathBuf,

        /// DfuSe options: address[:force][:leave][:mass-erase][:unprotect][:will-reset]
        #[arg(short = 's', long = "dfuse-address")]
        dfuse_address: Option<String>,

        /// Give up after this many status requests per command
        #[arg(long)]
        max_polls: Option<u32>,

        /// Give up after waiting this long per command, in milliseconds
        #[arg(long)]
        max_wait_ms: Option<u64>,

        /// Do not show progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Show the memory layout of the selected alternate setting
    Layout {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// List devices in DFU mode
    List,
}
