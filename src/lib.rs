//! USB mass-storage Bulk-Only Transport device
//!
//! Terminates the USB Bulk-Only Transport protocol for an emulated mass-storage
//! device and forwards the carried SCSI commands to a [`ScsiBackend`].
//!
//! The USB framework hands transfers to [`MsdDevice::dispatch`] and collects them
//! again with [`MsdDevice::reap`]. SCSI commands run asynchronously: the backend
//! receives a [`ScsiCommand`] and calls [`ScsiCommand::complete`] from whatever
//! thread it likes.
//!

mod config;
mod control;
mod device;
mod diag;
mod error;
mod request;
mod reset;
mod save;
mod scsi;
pub mod urb;
pub mod wire;

pub use config::MsdConfig;
pub use control::DescriptorCache;
pub use device::MsdDevice;
pub use diag::MsdStats;
pub use error::{Error, Result};
pub use request::RequestState;
pub use save::{SavedRequest, SavedState};
pub use scsi::{sense, ScsiBackend, ScsiCommand, ScsiOutcome, ScsiStatus};
pub use urb::{SetupPacket, Urb, UrbId, UrbQueue, UrbStatus};

/// Control endpoint address.
pub const EP_CONTROL: u8 = 0x00;

/// Bulk-in endpoint address (device to host).
pub const EP_BULK_IN: u8 = 0x81;

/// Bulk-out endpoint address (host to device).
pub const EP_BULK_OUT: u8 = 0x02;

/// Class request: Bulk-Only Mass Storage Reset.
pub const REQ_BULK_ONLY_RESET: u8 = 0xff;

/// Class request: Get Max LUN.
pub const REQ_GET_MAX_LUN: u8 = 0xfe;

/// Transfer direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// What happened to a dispatched URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Completed successfully and placed on the done queue.
    Completed,
    /// Stalled and placed on the done queue.
    Stalled,
    /// Parked until a SCSI command or a pending reset finishes.
    Queued,
}
