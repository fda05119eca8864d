//! Error types for rdfuse-core
//!
//! Every failure of the download engine is fatal to the operation in
//! progress. Nothing here is retried internally; the caller decides whether
//! to start a new session.

use thiserror::Error;

use crate::protocol::{DfuState, DfuStatusCode, DfuseCommand};

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The command/status channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// ERASE_PAGE targeted an address with no erasable segment
    #[error("page at 0x{address:08X} can not be erased")]
    PageNotErasable {
        /// Address passed to the erase command
        address: u32,
    },

    /// The device did not enter dfuDNBUSY after a special command
    #[error("wrong state after command \"{command}\": state = {state}, status = {status}")]
    UnexpectedState {
        /// Command that was sent
        command: DfuseCommand,
        /// State reported on the first poll
        state: DfuState,
        /// Status reported on the first poll
        status: DfuStatusCode,
    },

    /// A special command finished with a non-OK status
    #[error("{command} not correctly executed: state = {state}, status = {status}")]
    CommandFailed {
        /// Command that was sent
        command: DfuseCommand,
        /// Final state
        state: DfuState,
        /// Final status
        status: DfuStatusCode,
    },

    /// A firmware chunk finished with a non-OK status
    #[error("chunk write failed: state = {state}, status = {status}")]
    ChunkWriteFailed {
        /// Final state
        state: DfuState,
        /// Final status
        status: DfuStatusCode,
    },

    /// The device accepted fewer bytes than were sent
    #[error("failed to write whole chunk at 0x{address:08X}: {sent} of {expected} bytes")]
    ShortWrite {
        /// Start address of the chunk
        address: u32,
        /// Bytes the device accepted
        sent: usize,
        /// Bytes in the chunk
        expected: usize,
    },

    /// A destructive option was requested without `force`
    #[error("{0} is destructive and requires the force option")]
    UnsafeOperation(&'static str),

    /// A special command op-code this implementation does not know
    #[error("non-supported special command 0x{0:02X}")]
    UnsupportedCommand(u8),

    /// A polling loop exceeded its configured bound
    #[error("device still busy after {polls} status requests ({waited_ms} ms)")]
    Timeout {
        /// Status requests issued
        polls: u32,
        /// Total time spent waiting on poll-timeouts
        waited_ms: u64,
    },

    /// The memory layout string could not be parsed
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),

    /// The device did not return to dfuIDLE after an abort
    #[error("failed to enter idle state on abort: state = {0}")]
    NotIdle(DfuState),

    /// The transfer size is zero
    #[error("invalid transfer size 0")]
    InvalidChunkSize,

    /// The element does not fit in the 32-bit address space
    #[error("element of {size} bytes at 0x{address:08X} exceeds the address space")]
    ElementOutOfRange {
        /// Element start address
        address: u32,
        /// Element size
        size: usize,
    },
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
