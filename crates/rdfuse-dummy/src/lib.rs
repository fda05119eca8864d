//! rdfuse-dummy - In-memory DfuSe device emulator for testing
//!
//! This crate provides a device that speaks the DfuSe download protocol
//! against emulated memory. It executes special commands, programs
//! written chunks, and walks the DFU state machine the way an STM32
//! bootloader does. Quirks seen on real parts can be switched on to
//! exercise the engine's error paths without hardware.

use rdfuse_core::error::{Error, Result};
use rdfuse_core::protocol::{
    DeviceStatus, DfuState, DfuStatusCode, DfuseCommand, MASS_ERASE_FALSE_TIMEOUT_MS,
};
use rdfuse_core::{DfuDevice, MemoryLayout, MemorySegment};

/// Value of erased flash
pub const ERASED: u8 = 0xFF;

/// STM32F405 internal flash
pub const STM32F4_LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

/// Configuration for the emulated device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Alternate setting name, holding the memory layout
    pub alt_name: String,
    /// `wTransferSize` of the functional descriptor
    pub transfer_size: usize,
    /// Number of dfuDNBUSY replies before a request completes
    pub busy_polls: u32,
    /// Poll-timeout reported while executing SET_ADDRESS
    pub command_timeout_ms: u32,
    /// Poll-timeout reported while erasing a page
    pub erase_timeout_ms: u32,
    /// Poll-timeout reported while programming a chunk
    pub write_timeout_ms: u32,
    /// Poll-timeout reported while mass erasing
    pub mass_erase_timeout_ms: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            alt_name: STM32F4_LAYOUT.to_string(),
            transfer_size: 2048,
            busy_polls: 1,
            command_timeout_ms: 0,
            erase_timeout_ms: 25,
            write_timeout_ms: 5,
            mass_erase_timeout_ms: 25_000,
        }
    }
}

/// Misbehaviour to inject
#[derive(Debug, Clone, Default)]
pub struct DummyQuirks {
    /// Accept at most this many bytes of each data chunk
    pub short_write: Option<usize>,
    /// Complete requests without ever reporting dfuDNBUSY
    pub skip_busy: bool,
    /// Report a 100 ms poll-timeout on the first mass erase poll
    pub mass_erase_false_timeout: bool,
    /// Finish every data chunk in dfuERROR with this status
    pub fail_writes: Option<DfuStatusCode>,
    /// Stay in dfuDNBUSY forever once a request is received
    pub endless_busy: bool,
}

/// A request seen by the emulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// DfuSe special command with its address (0 when none)
    Command(DfuseCommand, u32),
    /// Data chunk programmed at an address
    Write {
        /// Target address
        address: u32,
        /// Bytes accepted
        len: usize,
    },
    /// Zero-length download, jumping to the address pointer
    Leave {
        /// Address pointer at the time of the request
        address: u32,
    },
    /// `DFU_CLRSTATUS`
    ClearStatus,
    /// `DFU_ABORT`
    Abort,
}

struct Region {
    segment: MemorySegment,
    data: Vec<u8>,
}

struct Pending {
    polls_left: u32,
    poll_timeout: u32,
    first_timeout: Option<u32>,
    outcome: (DfuState, DfuStatusCode),
}

/// Emulated DfuSe device
pub struct DummyDfuse {
    config: DummyConfig,
    quirks: DummyQuirks,
    regions: Vec<Region>,
    state: DfuState,
    status: DfuStatusCode,
    address_pointer: u32,
    pending: Option<Pending>,
    requests: Vec<Request>,
    delays: Vec<u32>,
    polls: u32,
    unprotected: bool,
}

impl DummyDfuse {
    /// Create a device whose memory follows the layout in `config.alt_name`
    ///
    /// `DummyDfuse::new(DummyConfig::default())` emulates an STM32F405.
    pub fn new(config: DummyConfig) -> Result<Self> {
        let layout = MemoryLayout::parse(&config.alt_name)?;
        let regions = layout
            .segments
            .iter()
            .map(|segment| Region {
                segment: *segment,
                data: vec![ERASED; segment.size() as usize],
            })
            .collect();
        Ok(Self {
            config,
            quirks: DummyQuirks::default(),
            regions,
            state: DfuState::DfuIdle,
            status: DfuStatusCode::Ok,
            address_pointer: 0,
            pending: None,
            requests: Vec::new(),
            delays: Vec::new(),
            polls: 0,
            unprotected: false,
        })
    }

    /// Enable quirks
    pub fn with_quirks(mut self, quirks: DummyQuirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Delays requested through [`DfuDevice::delay_ms`]
    pub fn delays(&self) -> &[u32] {
        &self.delays
    }

    /// Number of `DFU_GETSTATUS` requests received
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Current DFU state
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Whether read protection was removed
    pub fn unprotected(&self) -> bool {
        self.unprotected
    }

    /// Read emulated memory
    ///
    /// Returns `None` unless the whole range lies within one segment.
    pub fn memory(&self, address: u32, len: usize) -> Option<&[u8]> {
        let region = self.region(address)?;
        let offset = (address - region.segment.start) as usize;
        region.data.get(offset..offset.checked_add(len)?)
    }

    fn region(&self, address: u32) -> Option<&Region> {
        self.regions.iter().find(|r| r.segment.contains(address))
    }

    fn region_mut(&mut self, address: u32) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.segment.contains(address))
    }

    fn stall(&mut self, reason: &str) -> Error {
        log::debug!("dummy: stalling request: {}", reason);
        self.pending = None;
        self.state = DfuState::DfuError;
        self.status = DfuStatusCode::ErrStalledPkt;
        Error::Transport(format!("request stalled: {}", reason))
    }

    fn start(&mut self, poll_timeout: u32, first_timeout: Option<u32>, outcome: DfuStatusCode) {
        let state = if outcome.is_ok() {
            DfuState::DfuDnloadIdle
        } else {
            DfuState::DfuError
        };
        self.start_with(poll_timeout, first_timeout, (state, outcome));
    }

    fn start_with(
        &mut self,
        poll_timeout: u32,
        first_timeout: Option<u32>,
        outcome: (DfuState, DfuStatusCode),
    ) {
        let polls_left = if self.quirks.skip_busy {
            0
        } else {
            self.config.busy_polls
        };
        self.state = DfuState::DfuDnBusy;
        self.pending = Some(Pending {
            polls_left,
            poll_timeout,
            first_timeout,
            outcome,
        });
    }

    fn erase_page(&mut self, address: u32) -> DfuStatusCode {
        let Some(region) = self.region_mut(address) else {
            return DfuStatusCode::ErrTarget;
        };
        if !region.segment.is_erasable() {
            return DfuStatusCode::ErrTarget;
        }
        let base = region.segment.page_base(address).max(region.segment.start);
        let start = (base - region.segment.start) as usize;
        let end = (start + region.segment.page_size as usize).min(region.data.len());
        region.data[start..end].fill(ERASED);
        log::trace!("dummy: erased page 0x{:08X}", base);
        DfuStatusCode::Ok
    }

    fn erase_all(&mut self) {
        for region in self.regions.iter_mut() {
            if region.segment.is_erasable() {
                region.data.fill(ERASED);
            }
        }
    }

    fn program(&mut self, address: u32, data: &[u8]) -> DfuStatusCode {
        for (offset, byte) in data.iter().enumerate() {
            let Some(addr) = address.checked_add(offset as u32) else {
                return DfuStatusCode::ErrAddress;
            };
            let Some(region) = self.region_mut(addr) else {
                return DfuStatusCode::ErrAddress;
            };
            if !region.segment.is_writable() {
                return DfuStatusCode::ErrWrite;
            }
            let erasable = region.segment.is_erasable();
            let cell = &mut region.data[(addr - region.segment.start) as usize];
            // Flash bits only go from 1 to 0 without an erase
            if erasable && *cell != ERASED && *cell != *byte {
                return DfuStatusCode::ErrProg;
            }
            *cell = *byte;
        }
        DfuStatusCode::Ok
    }

    fn execute(&mut self, command: DfuseCommand, address: u32) {
        log::debug!("dummy: {} 0x{:08X}", command, address);
        self.requests.push(Request::Command(command, address));
        match command {
            DfuseCommand::SetAddress => {
                self.address_pointer = address;
                self.start(self.config.command_timeout_ms, None, DfuStatusCode::Ok);
            }
            DfuseCommand::ErasePage => {
                let status = self.erase_page(address);
                self.start(self.config.erase_timeout_ms, None, status);
            }
            DfuseCommand::MassErase => {
                self.erase_all();
                let first = self
                    .quirks
                    .mass_erase_false_timeout
                    .then_some(MASS_ERASE_FALSE_TIMEOUT_MS);
                self.start(self.config.mass_erase_timeout_ms, first, DfuStatusCode::Ok);
            }
            DfuseCommand::ReadUnprotect => {
                self.erase_all();
                self.unprotected = true;
                self.start_with(
                    self.config.mass_erase_timeout_ms,
                    None,
                    (DfuState::DfuManifestWaitReset, DfuStatusCode::Ok),
                );
            }
        }
    }

    fn write(&mut self, transaction: u16, data: &[u8]) -> Result<usize> {
        let address = u32::try_from(self.config.transfer_size)
            .ok()
            .and_then(|size| u32::from(transaction - 2).checked_mul(size))
            .and_then(|offset| self.address_pointer.checked_add(offset));
        let Some(address) = address else {
            let reason = format!("transaction {} is beyond the address space", transaction);
            return Err(self.stall(&reason));
        };
        let accepted = self
            .quirks
            .short_write
            .map_or(data.len(), |max| max.min(data.len()));

        self.requests.push(Request::Write {
            address,
            len: accepted,
        });
        let status = match self.quirks.fail_writes {
            Some(status) => status,
            None => self.program(address, &data[..accepted]),
        };
        log::trace!(
            "dummy: wrote {} bytes at 0x{:08X}: {}",
            accepted,
            address,
            status
        );
        self.start(self.config.write_timeout_ms, None, status);
        Ok(accepted)
    }
}

impl DfuDevice for DummyDfuse {
    fn alt_name(&self) -> &str {
        &self.config.alt_name
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<usize> {
        if self.pending.is_some() {
            return Err(self.stall("download while busy"));
        }
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle) {
            let reason = format!("download in state {}", self.state);
            return Err(self.stall(&reason));
        }

        if data.is_empty() {
            log::debug!("dummy: leaving DFU mode at 0x{:08X}", self.address_pointer);
            self.requests.push(Request::Leave {
                address: self.address_pointer,
            });
            self.start_with(0, None, (DfuState::DfuManifest, DfuStatusCode::Ok));
            return Ok(0);
        }

        match transaction {
            0 => {
                let Ok((command, address)) = DfuseCommand::decode(data) else {
                    let reason = format!("unsupported command 0x{:02X}", data[0]);
                    return Err(self.stall(&reason));
                };
                self.execute(command, address);
                Ok(data.len())
            }
            1 => Err(self.stall("transaction 1")),
            n => self.write(n, data),
        }
    }

    fn get_status(&mut self) -> Result<DeviceStatus> {
        self.polls += 1;
        let endless = self.quirks.endless_busy;
        if let Some(pending) = self.pending.as_mut() {
            if endless || pending.polls_left > 0 {
                if !endless {
                    pending.polls_left -= 1;
                }
                let timeout = pending.first_timeout.take().unwrap_or(pending.poll_timeout);
                return Ok(DeviceStatus::new(
                    DfuState::DfuDnBusy,
                    DfuStatusCode::Ok,
                    timeout,
                ));
            }
            let (state, status) = pending.outcome;
            self.pending = None;
            self.state = state;
            self.status = status;
        }
        Ok(DeviceStatus::new(self.state, self.status, 0))
    }

    fn clear_status(&mut self) -> Result<()> {
        self.requests.push(Request::ClearStatus);
        if self.state == DfuState::DfuError {
            self.state = DfuState::DfuIdle;
            self.status = DfuStatusCode::Ok;
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.requests.push(Request::Abort);
        if self.state == DfuState::DfuError {
            return Err(self.stall("abort in dfuERROR"));
        }
        self.pending = None;
        self.state = DfuState::DfuIdle;
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }
}

#[cfg(test)]
mod tests;
