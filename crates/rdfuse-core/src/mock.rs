//! Scripted device for unit tests

use std::collections::VecDeque;

use crate::device::DfuDevice;
use crate::error::{Error, Result};
use crate::protocol::{DeviceStatus, DfuState, DfuStatusCode, DfuseCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Command(DfuseCommand, u32),
    Chunk { transaction: u16, len: usize },
    Abort,
    Clear,
}

/// Replies with queued statuses, or with a plausible default once the
/// queue is empty: dfuDNBUSY once after each download, then dfuDNLOAD-IDLE
/// (dfuIDLE after an abort).
pub(crate) struct MockDevice {
    alt_name: String,
    statuses: VecDeque<DeviceStatus>,
    busy_pending: bool,
    aborted: bool,
    pub events: Vec<Event>,
    pub polls: u32,
    pub delays: Vec<u32>,
    pub aborts: u32,
    pub clears: u32,
    /// Maximum bytes accepted per data chunk
    pub accept_limit: Option<usize>,
    /// Fail the Nth download request (0-based)
    pub fail_download: Option<usize>,
    downloads: usize,
}

impl MockDevice {
    pub fn new(alt_name: &str) -> Self {
        Self {
            alt_name: alt_name.to_string(),
            statuses: VecDeque::new(),
            busy_pending: false,
            aborted: false,
            events: Vec::new(),
            polls: 0,
            delays: Vec::new(),
            aborts: 0,
            clears: 0,
            accept_limit: None,
            fail_download: None,
            downloads: 0,
        }
    }

    pub fn push_status(&mut self, state: DfuState, status: DfuStatusCode, poll_timeout: u32) {
        self.statuses
            .push_back(DeviceStatus::new(state, status, poll_timeout));
    }

    pub fn commands(&self) -> Vec<(DfuseCommand, u32)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Command(cmd, addr) => Some((*cmd, *addr)),
                _ => None,
            })
            .collect()
    }
}

impl DfuDevice for MockDevice {
    fn alt_name(&self) -> &str {
        &self.alt_name
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<usize> {
        let index = self.downloads;
        self.downloads += 1;
        if self.fail_download == Some(index) {
            return Err(Error::Transport("pipe error".into()));
        }

        self.busy_pending = true;
        self.aborted = false;
        if transaction == 0 && !data.is_empty() {
            let (cmd, addr) = DfuseCommand::decode(data)?;
            self.events.push(Event::Command(cmd, addr));
            Ok(data.len())
        } else {
            self.events.push(Event::Chunk {
                transaction,
                len: data.len(),
            });
            Ok(self.accept_limit.map_or(data.len(), |l| l.min(data.len())))
        }
    }

    fn get_status(&mut self) -> Result<DeviceStatus> {
        self.polls += 1;
        if let Some(status) = self.statuses.pop_front() {
            return Ok(status);
        }
        let state = if self.aborted {
            DfuState::DfuIdle
        } else if self.busy_pending {
            self.busy_pending = false;
            DfuState::DfuDnBusy
        } else {
            DfuState::DfuDnloadIdle
        };
        Ok(DeviceStatus::new(state, DfuStatusCode::Ok, 0))
    }

    fn clear_status(&mut self) -> Result<()> {
        self.clears += 1;
        self.events.push(Event::Clear);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.aborts += 1;
        self.aborted = true;
        self.busy_pending = false;
        self.events.push(Event::Abort);
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }
}
