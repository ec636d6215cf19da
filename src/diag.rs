//! Counters and rate-limited warnings.

/// Kinds of guest misbehavior that are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Complaint {
    BadCbw,
    WrongState,
    Overrun,
    Underrun,
    BadStatusRead,
    UnsupportedRequest,
    Halted,
    ResetRace,
}

impl Complaint {
    const COUNT: usize = 8;
}

/// Limits how often each kind of guest misbehavior is logged at warning level.
///
/// Owned by one device, so a noisy guest cannot silence another device's log.
#[derive(Debug)]
pub(crate) struct LogLimiter {
    limit: u32,
    counts: [u32; Complaint::COUNT],
}

impl LogLimiter {
    pub fn new(limit: u32) -> Self {
        Self { limit, counts: [0; Complaint::COUNT] }
    }

    /// Records an occurrence and returns whether it should be logged as a warning.
    pub fn allow(&mut self, kind: Complaint) -> bool {
        let count = &mut self.counts[kind as usize];
        *count = count.saturating_add(1);
        *count <= self.limit
    }
}

/// Device statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsdStats {
    /// SCSI commands submitted to the backend.
    pub commands: u64,
    /// URBs completed with a stall.
    pub stalls: u64,
    /// URBs cancelled by the framework.
    pub cancelled: u64,
    /// Device, set-configuration and Bulk-Only resets performed.
    pub resets: u64,
    /// Requests abandoned by a reset because their SCSI command did not finish in time.
    pub abandoned: u64,
    /// Abandoned requests released by their late SCSI completion.
    pub reclaimed: u64,
}
