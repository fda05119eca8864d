//! DfuSe download session
//!
//! A [`DfuseSession`] owns everything that must persist between commands
//! of one download: the device borrow, the memory layout, the transfer
//! configuration and the last erased page. Creating a new session resets
//! the erase cache.

use crate::device::{abort_to_idle, DfuDevice};
use crate::download::DownloadProgress;
use crate::error::{Error, Result};
use crate::memory::{MemoryLayout, MemorySegment};
use crate::options::TransferConfig;
use crate::protocol::{
    DeviceStatus, DfuState, DfuseCommand, MASS_ERASE_FALSE_TIMEOUT_MS, MASS_ERASE_TIMEOUT_MS,
    TRANSACTION_COMMAND, TRANSACTION_NO_OFFSET,
};

/// Erase cache value that cannot equal a page base
const NO_PAGE_ERASED: u32 = 1;

/// Bound on a status polling loop
///
/// Both limits are optional; with neither set a device that stays busy is
/// polled forever. The limits are checked before every status request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollLimit {
    /// Maximum number of status requests per command
    pub max_polls: Option<u32>,
    /// Maximum accumulated poll-timeout wait per command, in milliseconds
    pub max_wait_ms: Option<u64>,
}

impl PollLimit {
    /// No bound at all
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Accounting for one polling loop
struct PollBudget {
    limit: PollLimit,
    polls: u32,
    waited_ms: u64,
}

impl PollBudget {
    fn new(limit: PollLimit) -> Self {
        Self {
            limit,
            polls: 0,
            waited_ms: 0,
        }
    }

    fn check(&self) -> Result<()> {
        let polls_exceeded = self.limit.max_polls.is_some_and(|max| self.polls >= max);
        let wait_exceeded = self
            .limit
            .max_wait_ms
            .is_some_and(|max| self.waited_ms > max);
        if polls_exceeded || wait_exceeded {
            return Err(Error::Timeout {
                polls: self.polls,
                waited_ms: self.waited_ms,
            });
        }
        Ok(())
    }

    /// Account for a delay before it is slept
    fn spend(&mut self, ms: u32) -> Result<()> {
        let waited_ms = self.waited_ms + u64::from(ms);
        if self.limit.max_wait_ms.is_some_and(|max| waited_ms > max) {
            return Err(Error::Timeout {
                polls: self.polls,
                waited_ms: self.waited_ms,
            });
        }
        self.waited_ms = waited_ms;
        Ok(())
    }
}

/// State of one DfuSe download session
pub struct DfuseSession<'a, D: DfuDevice + ?Sized> {
    device: &'a mut D,
    layout: Option<MemoryLayout>,
    config: TransferConfig,
    poll_limit: PollLimit,
    last_erased_page: u32,
}

impl<'a, D: DfuDevice + ?Sized> DfuseSession<'a, D> {
    /// Start a session
    pub fn new(device: &'a mut D, layout: MemoryLayout, config: TransferConfig) -> Self {
        Self {
            device,
            layout: Some(layout),
            config,
            poll_limit: PollLimit::default(),
            last_erased_page: NO_PAGE_ERASED,
        }
    }

    /// Bound every polling loop of this session
    pub fn with_poll_limit(mut self, limit: PollLimit) -> Self {
        self.poll_limit = limit;
        self
    }

    /// Transfer configuration of this session
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Memory layout, until released
    pub fn layout(&self) -> Option<&MemoryLayout> {
        self.layout.as_ref()
    }

    /// Drop the memory layout; page erases fail afterwards
    pub fn release_layout(&mut self) -> Option<MemoryLayout> {
        self.layout.take()
    }

    /// Base address of the last erased page, if any
    pub fn last_erased_page(&self) -> Option<u32> {
        (self.last_erased_page != NO_PAGE_ERASED).then_some(self.last_erased_page)
    }

    /// Abort any pending transfer and return the device to dfuIDLE
    pub fn abort_to_idle(&mut self) -> Result<()> {
        abort_to_idle(&mut *self.device)
    }

    fn segment_at(&self, address: u32) -> Option<MemorySegment> {
        self.layout
            .as_ref()
            .and_then(|layout| layout.resolve(address))
            .copied()
    }

    fn poll(&mut self, budget: &mut PollBudget) -> Result<DeviceStatus> {
        budget.check()?;
        budget.polls += 1;
        let status = self.device.get_status()?;
        log::trace!(
            "status: state {}, status {}, poll timeout {} ms",
            status.state,
            status.status,
            status.poll_timeout
        );
        Ok(status)
    }

    fn wait(&mut self, budget: &mut PollBudget, ms: u32) -> Result<()> {
        if ms > 0 {
            budget.spend(ms)?;
            self.device.delay_ms(ms);
        }
        Ok(())
    }

    /// Send a DfuSe special command and wait for it to complete
    ///
    /// Leaves the device in dfuDNLOAD-IDLE on success.
    pub fn special_command(&mut self, command: DfuseCommand, address: u32) -> Result<()> {
        let erase_base = if command == DfuseCommand::ErasePage {
            let segment = self
                .segment_at(address)
                .filter(MemorySegment::is_erasable)
                .ok_or(Error::PageNotErasable { address })?;
            Some(segment.page_base(address))
        } else {
            None
        };

        log::debug!("{} 0x{:08X}", command, address);
        let buf = command.encode(address);
        let payload = &buf[..command.payload_len()];
        log::trace!("command buffer {:02X?}", payload);

        self.device
            .download(TRANSACTION_COMMAND, payload)
            .map_err(|e| {
                log::error!("Error during special command \"{}\" download", command);
                e
            })?;

        let mut budget = PollBudget::new(self.poll_limit);
        let mut first_poll = true;
        let status = loop {
            let mut status = self.poll(&mut budget)?;
            if first_poll {
                first_poll = false;
                if status.state != DfuState::DfuDnBusy {
                    return Err(Error::UnexpectedState {
                        command,
                        state: status.state,
                        status: status.status,
                    });
                }
                if command == DfuseCommand::MassErase
                    && status.poll_timeout == MASS_ERASE_FALSE_TIMEOUT_MS
                {
                    log::warn!(
                        "Device reports a {} ms mass erase timeout, using {} ms",
                        MASS_ERASE_FALSE_TIMEOUT_MS,
                        MASS_ERASE_TIMEOUT_MS
                    );
                    status.poll_timeout = MASS_ERASE_TIMEOUT_MS;
                }
                // The device disconnects right away
                if command == DfuseCommand::ReadUnprotect {
                    return Ok(());
                }
            }
            self.wait(&mut budget, status.poll_timeout)?;
            if status.state != DfuState::DfuDnBusy {
                break status;
            }
        };

        if !status.status.is_ok() {
            return Err(Error::CommandFailed {
                command,
                state: status.state,
                status: status.status,
            });
        }

        if let Some(base) = erase_base {
            self.last_erased_page = base;
        }
        Ok(())
    }

    /// Send one block of data and wait until the device has processed it
    ///
    /// An empty `data` sends a zero-length request. Returns the number of
    /// bytes the device accepted.
    pub fn download_chunk(&mut self, data: &[u8], transaction: u16) -> Result<usize> {
        let sent = self.device.download(transaction, data).map_err(|e| {
            log::error!("Error during download");
            e
        })?;

        let will_reset = self.config.will_reset;
        let mut budget = PollBudget::new(self.poll_limit);
        let status = loop {
            let status = self.poll(&mut budget)?;
            self.wait(&mut budget, status.poll_timeout)?;
            if status.state.download_settled()
                || (will_reset && status.state == DfuState::DfuDnBusy)
            {
                break status;
            }
        };

        if status.state == DfuState::DfuManifest {
            log::debug!("Transitioning to {}", status.state);
        }

        if !status.status.is_ok() {
            return Err(Error::ChunkWriteFailed {
                state: status.state,
                status: status.status,
            });
        }
        Ok(sent)
    }

    /// Erase and write one contiguous element
    ///
    /// The first pass erases every page the element touches, the second
    /// writes it in `chunk_size` pieces, each after a SET_ADDRESS. Returns
    /// the number of bytes written.
    pub fn download_element<P: DownloadProgress + ?Sized>(
        &mut self,
        address: u32,
        data: &[u8],
        chunk_size: usize,
        progress: &mut P,
    ) -> Result<usize> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let last_address = u64::from(address) + data.len() as u64 - 1;
        if last_address > u64::from(u32::MAX) {
            return Err(Error::ElementOutOfRange {
                address,
                size: data.len(),
            });
        }
        let last_address = last_address as u32;

        match self.segment_at(last_address) {
            Some(segment) if segment.is_writable() => {}
            _ if self.config.forced() => {}
            _ => log::warn!("Last page at 0x{:08X} is not writeable", last_address),
        }

        // Window offsets fit in u32: the whole element does
        let windows = move || {
            data.chunks(chunk_size)
                .enumerate()
                .map(move |(i, chunk)| (address + (i * chunk_size) as u32, chunk))
        };

        progress.erasing(data.len());
        let mut pages_erased = 0;
        for (window, chunk) in windows() {
            // Without a segment the page size is unknown, so writes go
            // ahead unerased
            let Some(segment) = self.segment_at(window) else {
                continue;
            };
            if !segment.is_erasable() || self.config.mass_erase {
                continue;
            }

            let end = u64::from(window) + chunk.len() as u64;
            let mut erase_address = u64::from(window);
            while erase_address < end {
                let page = erase_address as u32;
                if segment.page_base(page) != self.last_erased_page {
                    self.special_command(DfuseCommand::ErasePage, page)?;
                    pages_erased += 1;
                    progress.page_erased(segment.page_base(page), pages_erased);
                }
                erase_address += u64::from(segment.page_size);
            }

            // Stepping by page size from an unaligned start can skip the
            // page holding the last byte
            let last = window + (chunk.len() - 1) as u32;
            if segment.page_base(last) != self.last_erased_page {
                self.special_command(DfuseCommand::ErasePage, last)?;
                pages_erased += 1;
                progress.page_erased(segment.page_base(last), pages_erased);
            }
        }
        log::info!("Erased {} pages", pages_erased);

        progress.writing(data.len());
        let mut written = 0;
        for (window, chunk) in windows() {
            self.special_command(DfuseCommand::SetAddress, window)?;
            let sent = self.download_chunk(chunk, TRANSACTION_NO_OFFSET)?;
            if sent != chunk.len() {
                return Err(Error::ShortWrite {
                    address: window,
                    sent,
                    expected: chunk.len(),
                });
            }
            written += sent;
            progress.write_progress(written);
        }

        Ok(written)
    }
}
