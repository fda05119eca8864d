//! Device trait
//!
//! [`DfuDevice`] is the command/status channel the engine drives. A USB
//! implementation maps each method onto a DFU class request on the DFU
//! interface; the emulator in `rdfuse-dummy` executes them in memory.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{DeviceStatus, DfuState};

/// A device in DFU mode with an active DfuSe alternate setting
pub trait DfuDevice {
    /// Name string of the active alternate setting (the memory layout)
    fn alt_name(&self) -> &str;

    /// Send a `DFU_DNLOAD` request
    ///
    /// `transaction` goes into `wValue`. An empty `data` sends a
    /// zero-length request. Returns the number of bytes the device
    /// accepted.
    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<usize>;

    /// Send a `DFU_GETSTATUS` request
    fn get_status(&mut self) -> Result<DeviceStatus>;

    /// Send a `DFU_CLRSTATUS` request
    fn clear_status(&mut self) -> Result<()>;

    /// Send a `DFU_ABORT` request
    fn abort(&mut self) -> Result<()>;

    /// Block for the given number of milliseconds
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

impl<T: DfuDevice + ?Sized> DfuDevice for &mut T {
    fn alt_name(&self) -> &str {
        (**self).alt_name()
    }

    fn download(&mut self, transaction: u16, data: &[u8]) -> Result<usize> {
        (**self).download(transaction, data)
    }

    fn get_status(&mut self) -> Result<DeviceStatus> {
        (**self).get_status()
    }

    fn clear_status(&mut self) -> Result<()> {
        (**self).clear_status()
    }

    fn abort(&mut self) -> Result<()> {
        (**self).abort()
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Abort any pending transfer and verify the device is back in dfuIDLE
pub fn abort_to_idle<D: DfuDevice + ?Sized>(device: &mut D) -> Result<()> {
    device.abort()?;
    let status = device.get_status()?;
    if status.state != DfuState::DfuIdle {
        return Err(Error::NotIdle(status.state));
    }
    if status.poll_timeout > 0 {
        device.delay_ms(status.poll_timeout);
    }
    log::debug!("Device back in {}", status.state);
    Ok(())
}

/// Bring a device out of dfuERROR and back to dfuIDLE
///
/// Devices left in an error state by a previous session reject downloads
/// until the error is cleared.
pub fn ensure_idle<D: DfuDevice + ?Sized>(device: &mut D) -> Result<()> {
    let status = device.get_status()?;
    match status.state {
        DfuState::DfuIdle => Ok(()),
        DfuState::DfuError => {
            log::warn!(
                "Device is in {} with status {}, clearing",
                status.state,
                status.status
            );
            device.clear_status()?;
            let status = device.get_status()?;
            if status.state != DfuState::DfuIdle {
                return Err(Error::NotIdle(status.state));
            }
            Ok(())
        }
        state => {
            log::debug!("Device is in {}, aborting to idle", state);
            abort_to_idle(device)
        }
    }
}
