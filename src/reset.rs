//! Device reset and Bulk-Only Mass Storage Reset.
//!
//! Neither flavor waits unconditionally for the SCSI backend. A Bulk-Only reset
//! arriving while a command executes is parked and finished by the command's
//! completion. A device reset waits for a bounded time and then abandons the
//! request: the in-flight [`ScsiCommand`](crate::ScsiCommand) keeps sole
//! ownership and releases it whenever the backend completes it.

use std::sync::MutexGuard;

use crate::{
    device::{Disposition, Halt, Inner, MsdDevice, Shared, ENDPOINTS},
    diag::Complaint,
    urb::UrbStatus,
    Result, EP_CONTROL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetKind {
    /// Bus reset; the configuration returns to its default.
    Device,
    /// SET_CONFIGURATION of the active configuration.
    SetConfiguration(u8),
    /// Class-specific Bulk-Only Mass Storage Reset.
    BulkOnly,
}

impl Inner {
    /// Brings the device back to a consistent idle state.
    ///
    /// Must only be called when no command is executing.
    pub fn finish_reset(&mut self, kind: ResetKind) {
        self.halted = [false; ENDPOINTS];
        match kind {
            ResetKind::Device => self.configuration = 0,
            ResetKind::SetConfiguration(value) => self.configuration = value,
            ResetKind::BulkOnly => (),
        }

        if let Some(req) = self.request.as_mut() {
            req.rewind();
        }

        let parked: Vec<_> = self.to_host.take_all().collect();
        if !parked.is_empty() {
            tracing::debug!(location = %self.location, "aborting {} parked transfers", parked.len());
        }
        for urb in parked {
            self.complete(urb, UrbStatus::TransportError);
        }

        if let Some(urb) = self.reset_urb.take() {
            self.complete(urb, UrbStatus::Ok);
        }

        self.stats.resets += 1;
        tracing::debug!(location = %self.location, "{kind:?} reset done");
    }

    /// Handles a Bulk-Only Mass Storage Reset request.
    pub fn bulk_only_reset(&mut self, urb: crate::Urb) -> Disposition {
        if self.executing.is_none() {
            self.finish_reset(ResetKind::BulkOnly);
            return Disposition::Complete(urb);
        }

        if self.reset_urb.is_some() {
            self.complain(
                Complaint::ResetRace,
                format_args!("Bulk-Only reset {} while another is pending", urb.id),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_CONTROL));
        }

        tracing::debug!(location = %self.location, "deferring Bulk-Only reset until SCSI command completes");
        self.reset_urb = Some(urb);
        Disposition::Hold
    }
}

impl Shared {
    /// Resets the device, waiting a bounded time for an executing command.
    pub fn reset_locked<'a>(
        &'a self, mut inner: MutexGuard<'a, Inner>, kind: ResetKind,
    ) -> Result<MutexGuard<'a, Inner>> {
        if inner.executing.is_some() {
            inner = self
                .scsi_done
                .wait_timeout_while(inner, self.reset_timeout, |inner| inner.executing.is_some())?
                .0;

            if let Some(generation) = inner.executing.take() {
                // The command owns the request now and releases it on completion.
                inner.stats.abandoned += 1;
                tracing::warn!(
                    location = %inner.location,
                    generation,
                    "SCSI command did not complete within {:?}, abandoning request",
                    self.reset_timeout
                );
            }
        }

        inner.finish_reset(kind);
        Ok(inner)
    }
}

impl MsdDevice {
    /// Performs a device (bus) reset.
    ///
    /// Blocks for at most the configured reset timeout if a SCSI command is executing.
    pub fn reset(&self) -> Result<()> {
        tracing::debug!("device reset");
        let inner = self.shared.lock()?;
        let inner = self.shared.reset_locked(inner, ResetKind::Device)?;
        self.shared.release(inner);
        Ok(())
    }

    /// Applies a configuration selected by the framework.
    ///
    /// Selecting the active configuration again resets the device.
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        let mut inner = self.shared.lock()?;
        if inner.configuration == value {
            inner = self.shared.reset_locked(inner, ResetKind::SetConfiguration(value))?;
        } else {
            inner.configuration = value;
        }
        self.shared.release(inner);
        Ok(())
    }
}
