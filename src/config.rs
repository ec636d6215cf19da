//! Device configuration.

use std::time::Duration;

/// Configuration of an emulated mass-storage device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsdConfig {
    /// Largest data transfer length accepted in a CBW.
    pub max_transfer_length: u32,
    /// How long a device reset waits for an executing SCSI command.
    pub reset_timeout: Duration,
    /// Number of guest-triggered warnings of each kind logged before they are
    /// demoted to trace level.
    pub log_limit: u32,
}

impl Default for MsdConfig {
    fn default() -> Self {
        Self { max_transfer_length: 4 * 1024 * 1024, reset_timeout: Duration::from_millis(20), log_limit: 10 }
    }
}

impl MsdConfig {
    /// Sets the largest data transfer length accepted in a CBW.
    #[must_use]
    pub fn with_max_transfer_length(mut self, max_transfer_length: u32) -> Self {
        self.max_transfer_length = max_transfer_length;
        self
    }

    /// Sets the bounded wait of a device reset.
    #[must_use]
    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Sets the per-kind warning limit.
    #[must_use]
    pub fn with_log_limit(mut self, log_limit: u32) -> Self {
        self.log_limit = log_limit;
        self
    }
}
