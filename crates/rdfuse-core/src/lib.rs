//! rdfuse-core - DfuSe download engine
//!
//! This crate drives a device implementing ST's DfuSe extension of the USB
//! DFU class through an addressed download: optional read-unprotect or mass
//! erase, page erase of every page the firmware touches, then chunked writes
//! each preceded by a SET_ADDRESS command.
//!
//! The USB transport is not part of this crate. Anything that can issue
//! `DFU_DNLOAD`/`DFU_GETSTATUS` style requests implements [`DfuDevice`].
//!
//! # Example
//!
//! ```ignore
//! use rdfuse_core::download;
//!
//! fn flash<D: rdfuse_core::DfuDevice>(dev: &mut D, image: &[u8]) {
//!     match download(dev, 2048, image, Some("0x08000000:leave")) {
//!         Ok(n) => println!("Downloaded {} bytes", n),
//!         Err(e) => println!("Download failed: {}", e),
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod download;
pub mod error;
pub mod memory;
pub mod options;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{abort_to_idle, ensure_idle, DfuDevice};
pub use download::{
    download, download_with, DownloadOutcome, DownloadProgress, DownloadRequest, NoProgress,
};
pub use error::{Error, Result};
pub use memory::{MemoryLayout, MemorySegment, SegmentFlags};
pub use options::{parse_options, TransferConfig};
pub use protocol::{DeviceStatus, DfuState, DfuStatusCode, DfuseCommand};
pub use session::{DfuseSession, PollLimit};
