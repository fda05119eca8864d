//! CLI command implementations

pub mod download;
pub mod layout;
mod list;

pub use list::list_devices;
