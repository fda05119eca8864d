//! Download command implementation

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rdfuse_core::{download_with, DownloadOutcome, DownloadProgress, DownloadRequest, PollLimit};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cli::DeviceArgs;
use crate::devices;

/// Progress reporter using indicatif progress bars
struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                    phase
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl DownloadProgress for IndicatifProgress {
    fn erasing(&mut self, bytes_to_erase: usize) {
        self.create_spinner(format!("Erasing pages for {} bytes...", bytes_to_erase));
    }

    fn page_erased(&mut self, page: u32, pages_erased: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_message(format!(
                "Erased {} pages (last at 0x{:08X})...",
                pages_erased, page
            ));
        }
    }

    fn writing(&mut self, bytes_to_write: usize) {
        self.finish("Erase complete");
        self.create_bar(bytes_to_write as u64, "Downloading");
    }

    fn write_progress(&mut self, bytes_written: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_written as u64);
        }
    }

    fn complete(&mut self, _outcome: &DownloadOutcome) {
        self.finish("Download complete");
    }
}

/// Run the download command
pub fn run_download(
    args: &DeviceArgs,
    input: &Path,
    dfuse_address: Option<&str>,
    poll_limit: PollLimit,
    show_progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let firmware = fs::read(input)?;
    log::info!("Read {} bytes from {}", firmware.len(), input.display());

    if dfuse_address.is_none() {
        log::warn!("No DfuSe address given (-s), nothing will be written");
    }

    let mut opened = devices::open_device(args)?;
    let request = DownloadRequest {
        chunk_size: opened.transfer_size,
        firmware: &firmware,
        options: dfuse_address,
        poll_limit,
    };

    let outcome = if show_progress {
        download_with(opened.device.as_mut(), &request, &mut IndicatifProgress::new())?
    } else {
        download_with(opened.device.as_mut(), &request, &mut rdfuse_core::NoProgress)?
    };

    println!("Downloaded {} bytes", outcome.bytes_written);
    if outcome.device_reset {
        println!("Device is leaving DFU mode");
    }

    Ok(())
}
