//! Top-level download sequencing
//!
//! [`download`] runs one complete DfuSe session against a device: the
//! destructive options first (read-unprotect, mass erase), then the
//! addressed element download, then the return to dfuIDLE and the optional
//! jump to the new firmware.

use crate::device::DfuDevice;
use crate::error::{Error, Result};
use crate::memory::MemoryLayout;
use crate::options::{parse_options, TransferConfig};
use crate::protocol::{DfuseCommand, TRANSACTION_NO_OFFSET};
use crate::session::{DfuseSession, PollLimit};

/// Progress callback for download operations
pub trait DownloadProgress {
    /// Called when starting the erase pass
    fn erasing(&mut self, bytes_to_erase: usize);

    /// Called after each page erase
    fn page_erased(&mut self, page: u32, pages_erased: usize);

    /// Called when starting the write pass
    fn writing(&mut self, bytes_to_write: usize);

    /// Called after each chunk is written
    fn write_progress(&mut self, bytes_written: usize);

    /// Called when the session is over
    fn complete(&mut self, outcome: &DownloadOutcome);
}

/// A no-op progress reporter
pub struct NoProgress;

impl DownloadProgress for NoProgress {
    fn erasing(&mut self, _bytes_to_erase: usize) {}
    fn page_erased(&mut self, _page: u32, _pages_erased: usize) {}
    fn writing(&mut self, _bytes_to_write: usize) {}
    fn write_progress(&mut self, _bytes_written: usize) {}
    fn complete(&mut self, _outcome: &DownloadOutcome) {}
}

/// Parameters of one download session
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    /// Transfer size negotiated with the device
    pub chunk_size: usize,
    /// Image to write at the configured address
    pub firmware: &'a [u8],
    /// DfuSe option string, e.g. `0x08000000:leave`
    pub options: Option<&'a str>,
    /// Bound on every status polling loop
    pub poll_limit: PollLimit,
}

impl<'a> DownloadRequest<'a> {
    /// Create a request with unbounded polling
    pub fn new(chunk_size: usize, firmware: &'a [u8], options: Option<&'a str>) -> Self {
        Self {
            chunk_size,
            firmware,
            options,
            poll_limit: PollLimit::default(),
        }
    }
}

/// Result of a successful session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes written to the device
    pub bytes_written: usize,
    /// The device resets or leaves DFU mode on its own
    pub device_reset: bool,
}

/// Run a DfuSe download session
///
/// Returns the number of bytes written.
pub fn download<D: DfuDevice + ?Sized>(
    device: &mut D,
    chunk_size: usize,
    firmware: &[u8],
    options: Option<&str>,
) -> Result<usize> {
    let request = DownloadRequest::new(chunk_size, firmware, options);
    download_with(device, &request, &mut NoProgress).map(|outcome| outcome.bytes_written)
}

/// Run a DfuSe download session with progress reporting
pub fn download_with<D, P>(
    device: &mut D,
    request: &DownloadRequest<'_>,
    progress: &mut P,
) -> Result<DownloadOutcome>
where
    D: DfuDevice + ?Sized,
    P: DownloadProgress + ?Sized,
{
    let config = request.options.map(parse_options).unwrap_or_default();
    let layout = MemoryLayout::parse(device.alt_name())?;

    let mut session =
        DfuseSession::new(device, layout, config.clone()).with_poll_limit(request.poll_limit);
    let mut outcome = DownloadOutcome::default();

    if config.unprotect {
        require_force(&config, "unprotect")?;
        session.special_command(DfuseCommand::ReadUnprotect, 0)?;
        log::info!("Device disconnects, erases flash and resets now");
        outcome.device_reset = true;
        progress.complete(&outcome);
        return Ok(outcome);
    }

    if config.mass_erase {
        require_force(&config, "mass-erase")?;
        log::info!("Performing mass erase, this can take a moment");
        session.special_command(DfuseCommand::MassErase, 0)?;
    }

    match config.address {
        Some(address) => {
            log::info!(
                "Downloading element to address = 0x{:08X}, size = {}",
                address,
                request.firmware.len()
            );
            outcome.bytes_written = session.download_element(
                address,
                request.firmware,
                request.chunk_size,
                progress,
            )?;
        }
        None => log::debug!("No DfuSe address given, skipping download"),
    }

    session.release_layout();

    if config.will_reset {
        outcome.device_reset = true;
    } else {
        session.abort_to_idle()?;
    }

    if config.leave {
        let address = config.address.unwrap_or(0);
        log::info!("Submitting leave request at 0x{:08X}", address);
        session.special_command(DfuseCommand::SetAddress, address)?;
        session.download_chunk(&[], TRANSACTION_NO_OFFSET)?;
        outcome.device_reset = true;
    }

    log::info!("File downloaded successfully");
    progress.complete(&outcome);
    Ok(outcome)
}

fn require_force(config: &TransferConfig, option: &'static str) -> Result<()> {
    if config.forced() {
        Ok(())
    } else {
        log::error!("The {} option requires force", option);
        Err(Error::UnsafeOperation(option))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockDevice};
    use crate::protocol::{DfuState, DfuStatusCode};

    const LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

    #[test]
    fn test_unprotect_requires_force() {
        let mut dev = MockDevice::new(LAYOUT);
        let err = download(&mut dev, 2048, &[0u8; 16], Some("0x08000000:unprotect")).unwrap_err();
        assert_eq!(err, Error::UnsafeOperation("unprotect"));
        assert!(dev.events.is_empty());
        assert_eq!(dev.polls, 0);
    }

    #[test]
    fn test_unprotect_ends_session() {
        let mut dev = MockDevice::new(LAYOUT);
        let request = DownloadRequest::new(2048, &[0u8; 16], Some("0x08000000:unprotect:force"));
        let outcome = download_with(&mut dev, &request, &mut NoProgress).unwrap();
        assert_eq!(
            outcome,
            DownloadOutcome {
                bytes_written: 0,
                device_reset: true
            }
        );
        assert_eq!(dev.events, vec![Event::Command(DfuseCommand::ReadUnprotect, 0)]);
    }

    #[test]
    fn test_mass_erase_requires_force() {
        let mut dev = MockDevice::new(LAYOUT);
        let err = download(&mut dev, 2048, &[0u8; 16], Some(":mass-erase")).unwrap_err();
        assert_eq!(err, Error::UnsafeOperation("mass-erase"));
        assert!(dev.events.is_empty());
    }

    #[test]
    fn test_mass_erase_then_write() {
        let mut dev = MockDevice::new(LAYOUT);
        let written = download(
            &mut dev,
            1024,
            &[0u8; 2048],
            Some("0x08000000:mass-erase:force"),
        )
        .unwrap();
        assert_eq!(written, 2048);
        assert_eq!(
            dev.events,
            vec![
                Event::Command(DfuseCommand::MassErase, 0),
                Event::Command(DfuseCommand::SetAddress, 0x0800_0000),
                Event::Chunk { transaction: 2, len: 1024 },
                Event::Command(DfuseCommand::SetAddress, 0x0800_0400),
                Event::Chunk { transaction: 2, len: 1024 },
                Event::Abort,
            ]
        );
    }

    #[test]
    fn test_leave_after_idle_restore() {
        let mut dev = MockDevice::new(LAYOUT);
        let written = download(&mut dev, 2048, &[0u8; 2048], Some("0x08000000:leave")).unwrap();
        assert_eq!(written, 2048);

        let abort = dev.events.iter().position(|e| *e == Event::Abort).unwrap();
        assert_eq!(
            &dev.events[abort..],
            &[
                Event::Abort,
                Event::Command(DfuseCommand::SetAddress, 0x0800_0000),
                Event::Chunk { transaction: 2, len: 0 },
            ]
        );
    }

    #[test]
    fn test_leave_without_address() {
        let mut dev = MockDevice::new(LAYOUT);
        let outcome = download_with(
            &mut dev,
            &DownloadRequest::new(2048, &[0u8; 64], Some(":leave")),
            &mut NoProgress,
        )
        .unwrap();
        assert_eq!(outcome.bytes_written, 0);
        assert!(outcome.device_reset);
        assert_eq!(
            dev.events,
            vec![
                Event::Abort,
                Event::Command(DfuseCommand::SetAddress, 0),
                Event::Chunk { transaction: 2, len: 0 },
            ]
        );
    }

    #[test]
    fn test_will_reset_skips_abort() {
        let mut dev = MockDevice::new(LAYOUT);
        download(&mut dev, 2048, &[0u8; 512], Some("0x08000000:will-reset")).unwrap();
        assert_eq!(dev.aborts, 0);
    }

    #[test]
    fn test_no_options() {
        let mut dev = MockDevice::new(LAYOUT);
        assert_eq!(download(&mut dev, 2048, &[0u8; 512], None), Ok(0));
        assert_eq!(dev.events, vec![Event::Abort]);
    }

    #[test]
    fn test_invalid_layout() {
        let mut dev = MockDevice::new("Not a layout");
        let err = download(&mut dev, 2048, &[0u8; 512], Some("0x08000000")).unwrap_err();
        assert!(matches!(err, Error::InvalidLayout(_)));
        assert!(dev.events.is_empty());
    }

    #[test]
    fn test_idle_restore_failure() {
        let mut dev = MockDevice::new(LAYOUT);
        dev.push_status(DfuState::DfuError, DfuStatusCode::ErrUnknown, 0);
        let err = download(&mut dev, 2048, &[], None).unwrap_err();
        assert_eq!(err, Error::NotIdle(DfuState::DfuError));
    }

    #[derive(Default)]
    struct Recorder {
        erased: Vec<u32>,
        written: Vec<usize>,
        outcome: Option<DownloadOutcome>,
    }

    impl DownloadProgress for Recorder {
        fn erasing(&mut self, _bytes_to_erase: usize) {}
        fn page_erased(&mut self, page: u32, _pages_erased: usize) {
            self.erased.push(page);
        }
        fn writing(&mut self, _bytes_to_write: usize) {}
        fn write_progress(&mut self, bytes_written: usize) {
            self.written.push(bytes_written);
        }
        fn complete(&mut self, outcome: &DownloadOutcome) {
            self.outcome = Some(*outcome);
        }
    }

    #[test]
    fn test_progress_reporting() {
        // Crosses from the last 16 KiB sector into the 64 KiB one
        let mut dev = MockDevice::new(LAYOUT);
        let mut progress = Recorder::default();
        let request = DownloadRequest::new(4096, &[0u8; 12288], Some("0x0800E000"));
        download_with(&mut dev, &request, &mut progress).unwrap();

        assert_eq!(progress.erased, vec![0x0800_C000, 0x0801_0000]);
        assert_eq!(progress.written, vec![4096, 8192, 12288]);
        assert_eq!(
            progress.outcome,
            Some(DownloadOutcome {
                bytes_written: 12288,
                device_reset: false
            })
        );
    }
}
