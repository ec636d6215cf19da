//! SCSI backend interface.

use std::{fmt, sync::Weak};

use crate::{device::Shared, request::Request, Direction};

/// SCSI status code, as returned by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScsiStatus(pub u8);

impl ScsiStatus {
    /// Command completed successfully.
    pub const GOOD: Self = Self(0x00);
    /// Command failed, sense data describes why.
    pub const CHECK_CONDITION: Self = Self(0x02);
    /// Target is busy.
    pub const BUSY: Self = Self(0x08);

    /// Whether this is [`GOOD`](Self::GOOD).
    pub fn is_good(self) -> bool {
        self == Self::GOOD
    }
}

/// Result of a SCSI command, reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiOutcome {
    /// SCSI status.
    pub status: ScsiStatus,
    /// Number of data bytes transferred.
    pub transferred: u32,
    /// Backend suggests retrying; retries are the backend's own business.
    pub retry: bool,
}

impl ScsiOutcome {
    /// Successful completion that transferred `transferred` bytes.
    pub fn good(transferred: u32) -> Self {
        Self { status: ScsiStatus::GOOD, transferred, retry: false }
    }

    /// Failed completion with check condition status.
    pub fn check_condition(transferred: u32) -> Self {
        Self { status: ScsiStatus::CHECK_CONDITION, transferred, retry: false }
    }
}

/// Executes SCSI commands on behalf of the device.
pub trait ScsiBackend: Send + Sync {
    /// Starts executing a command.
    ///
    /// Must not block. The command is completed later by calling
    /// [`ScsiCommand::complete`], possibly from another thread, possibly before
    /// this function returns.
    fn submit(&self, command: ScsiCommand);

    /// Location of the SCSI device, used in log messages.
    fn location(&self) -> String {
        String::from("lun0")
    }
}

/// A SCSI command in flight.
///
/// Owns the request it belongs to until it is completed. If a reset gave up on
/// the command, completing it merely releases the request.
///
/// Dropping a command without completing it completes it as failed with
/// ABORTED COMMAND sense.
pub struct ScsiCommand {
    request: Option<Box<Request>>,
    generation: u64,
    device: Weak<Shared>,
}

impl fmt::Debug for ScsiCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScsiCommand")
            .field("generation", &self.generation)
            .field("cdb", &self.cdb())
            .field("direction", &self.direction())
            .field("transfer_len", &self.transfer_len())
            .finish()
    }
}

impl ScsiCommand {
    pub(crate) fn new(request: Box<Request>, generation: u64, device: Weak<Shared>) -> Self {
        Self { request: Some(request), generation, device }
    }

    fn request(&self) -> &Request {
        self.request.as_deref().expect("command already completed")
    }

    fn request_mut(&mut self) -> &mut Request {
        self.request.as_deref_mut().expect("command already completed")
    }

    /// Command descriptor block.
    pub fn cdb(&self) -> &[u8] {
        self.request().cbw.cdb()
    }

    /// SCSI operation code.
    pub fn opcode(&self) -> u8 {
        self.request().cbw.opcode()
    }

    /// Data direction.
    pub fn direction(&self) -> Direction {
        self.request().scsi.direction
    }

    /// Number of data bytes to transfer.
    ///
    /// May be shorter than the CBW declared if the host ended the data phase early.
    pub fn transfer_len(&self) -> u32 {
        self.request().scsi.length
    }

    /// Data received from the host, for writes.
    pub fn data(&self) -> &[u8] {
        let req = self.request();
        &req.buf[..req.scsi.length as usize]
    }

    /// Buffer to fill with data for the host, for reads.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let req = self.request_mut();
        let len = req.scsi.length as usize;
        &mut req.buf[..len]
    }

    /// Sense buffer, to be filled when the command fails.
    pub fn sense_mut(&mut self) -> &mut [u8; sense::SENSE_LEN] {
        &mut self.request_mut().sense
    }

    /// Completes the command.
    pub fn complete(mut self, outcome: ScsiOutcome) {
        if let Some(request) = self.request.take() {
            Shared::complete_scsi(&self.device, self.generation, request, outcome);
        }
    }
}

impl Drop for ScsiCommand {
    fn drop(&mut self) {
        if let Some(mut request) = self.request.take() {
            tracing::warn!("SCSI command {:#04x} dropped without completion", request.cbw.opcode());
            request.sense = sense::fixed(sense::KEY_ABORTED_COMMAND, 0, 0);
            Shared::complete_scsi(&self.device, self.generation, request, ScsiOutcome::check_condition(0));
        }
    }
}

/// Fixed-format sense data.
pub mod sense {
    /// Length of fixed-format sense data.
    pub const SENSE_LEN: usize = 18;

    /// No sense.
    pub const KEY_NO_SENSE: u8 = 0x00;
    /// Not ready.
    pub const KEY_NOT_READY: u8 = 0x02;
    /// Medium error.
    pub const KEY_MEDIUM_ERROR: u8 = 0x03;
    /// Illegal request.
    pub const KEY_ILLEGAL_REQUEST: u8 = 0x05;
    /// Unit attention.
    pub const KEY_UNIT_ATTENTION: u8 = 0x06;
    /// Aborted command.
    pub const KEY_ABORTED_COMMAND: u8 = 0x0b;

    const RESPONSE_CURRENT: u8 = 0x70;
    const ADDITIONAL_LEN: u8 = (SENSE_LEN - 8) as u8;

    /// REQUEST SENSE operation code.
    pub const OP_REQUEST_SENSE: u8 = 0x03;

    /// Builds fixed-format sense data.
    pub fn fixed(key: u8, asc: u8, ascq: u8) -> [u8; SENSE_LEN] {
        let mut sense = [0; SENSE_LEN];
        sense[0] = RESPONSE_CURRENT;
        sense[2] = key & 0x0f;
        sense[7] = ADDITIONAL_LEN;
        sense[12] = asc;
        sense[13] = ascq;
        sense
    }

    /// Sense data reporting no error.
    pub fn no_sense() -> [u8; SENSE_LEN] {
        fixed(KEY_NO_SENSE, 0, 0)
    }

    /// Sense key of fixed-format sense data.
    pub fn key(sense: &[u8]) -> u8 {
        sense.get(2).map_or(0, |key| key & 0x0f)
    }

    /// Additional sense code and qualifier of fixed-format sense data.
    pub fn code(sense: &[u8]) -> (u8, u8) {
        (sense.get(12).copied().unwrap_or(0), sense.get(13).copied().unwrap_or(0))
    }
}
