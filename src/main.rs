//! rdfuse - DfuSe firmware downloader
//!
//! Writes a binary image into an STM32 (or other DfuSe capable) device
//! sitting in its DFU bootloader, following ST's DfuSe extension of the
//! USB DFU class: page erase and addressed writes driven by the memory
//! layout the device advertises in its alternate setting name.
//!
//! The engine lives in `rdfuse-core`; this binary picks a device backend
//! (USB or the in-memory emulator) and drives it.

mod cli;
mod commands;
mod devices;

use clap::Parser;
use cli::{Cli, Commands};
use rdfuse_core::PollLimit;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Verbosity sets the default filter, RUST_LOG still overrides it
    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Download {
            device,
            input,
            dfuse_address,
            max_polls,
            max_wait_ms,
            no_progress,
        } => commands::download::run_download(
            &device,
            &input,
            dfuse_address.as_deref(),
            PollLimit {
                max_polls,
                max_wait_ms,
            },
            !no_progress,
        ),
        Commands::Layout { device } => commands::layout::cmd_show(&device),
        Commands::List => commands::list_devices(),
    }
}
