//! Save/restore support.

use crate::{
    device::{halt_index, MsdDevice},
    request::{Request, RequestState, ScsiParams},
    scsi::{sense::SENSE_LEN, ScsiStatus},
    wire::{Cbw, CB_MAX_LEN},
    Direction, Error, Result, EP_BULK_IN, EP_BULK_OUT,
};

/// Saved state of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    /// Configuration value.
    pub configuration: u8,
    /// Bulk-in endpoint halted.
    pub bulk_in_halted: bool,
    /// Bulk-out endpoint halted.
    pub bulk_out_halted: bool,
    /// Current request, if one is allocated.
    pub request: Option<SavedRequest>,
}

/// Saved state of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRequest {
    /// Transaction state.
    pub state: RequestState,
    /// Data buffer.
    pub buffer: Vec<u8>,
    /// Data phase offset.
    pub offset: usize,
    /// Originating CBW.
    pub cbw: Cbw,
    /// SCSI data direction.
    pub scsi_direction: Direction,
    /// SCSI transfer length.
    pub scsi_length: u32,
    /// SCSI status.
    pub scsi_status: ScsiStatus,
    /// Bytes transferred by the SCSI backend.
    pub scsi_transferred: u32,
    /// Backend transferred more than requested.
    pub phase_error: bool,
    /// Retained sense data.
    pub sense: [u8; SENSE_LEN],
}

impl SavedRequest {
    fn save(req: &Request) -> Self {
        Self {
            state: req.state,
            buffer: req.buf.clone(),
            offset: req.offset,
            cbw: req.cbw,
            scsi_direction: req.scsi.direction,
            scsi_length: req.scsi.length,
            scsi_status: req.scsi.status,
            scsi_transferred: req.scsi.transferred,
            phase_error: req.scsi.phase_error,
            sense: req.sense,
        }
    }

    fn validate(&self) -> Result<()> {
        match self.state {
            RequestState::Ready
            | RequestState::DataFromHost
            | RequestState::DataToHost
            | RequestState::Status => (),
            RequestState::Executing | RequestState::DestroyOnCompletion => {
                return Err(Error::InvalidSavedState("request state"))
            }
        }
        if self.buffer.len() != self.cbw.data_transfer_length as usize {
            return Err(Error::InvalidSavedState("buffer length"));
        }
        if self.offset > self.buffer.len() {
            return Err(Error::InvalidSavedState("data offset"));
        }
        if self.cbw.cb_length == 0 || usize::from(self.cbw.cb_length) > CB_MAX_LEN {
            return Err(Error::InvalidSavedState("command block length"));
        }
        if self.scsi_transferred > self.scsi_length || self.scsi_length as usize > self.buffer.len() {
            return Err(Error::InvalidSavedState("SCSI transfer length"));
        }
        Ok(())
    }

    fn restore(&self) -> Box<Request> {
        Box::new(Request {
            state: self.state,
            buf: self.buffer.clone(),
            offset: self.offset,
            cbw: self.cbw,
            scsi: ScsiParams {
                direction: self.scsi_direction,
                length: self.scsi_length,
                status: self.scsi_status,
                transferred: self.scsi_transferred,
                phase_error: self.phase_error,
            },
            sense: self.sense,
        })
    }
}

impl MsdDevice {
    /// Saves the device state.
    ///
    /// Fails with [`Error::Busy`] while a SCSI command executes; use
    /// [`wait_idle`](Self::wait_idle) to quiesce the device first.
    pub fn save(&self) -> Result<SavedState> {
        let inner = self.shared.lock()?;
        if inner.executing.is_some() {
            return Err(Error::Busy);
        }

        let halted = |endpoint| halt_index(endpoint).is_some_and(|idx| inner.halted[idx]);
        Ok(SavedState {
            configuration: inner.configuration,
            bulk_in_halted: halted(EP_BULK_IN),
            bulk_out_halted: halted(EP_BULK_OUT),
            // A request whose first CBW was never accepted carries nothing to resume.
            request: inner.request.as_deref().filter(|req| req.cbw.cb_length > 0).map(SavedRequest::save),
        })
    }

    /// Restores a saved device state.
    pub fn restore(&self, state: &SavedState) -> Result<()> {
        if let Some(req) = &state.request {
            req.validate()?;
        }

        let mut inner = self.shared.lock()?;
        if inner.executing.is_some() {
            return Err(Error::Busy);
        }

        inner.configuration = state.configuration;
        for (endpoint, halted) in [(EP_BULK_IN, state.bulk_in_halted), (EP_BULK_OUT, state.bulk_out_halted)] {
            if let Some(idx) = halt_index(endpoint) {
                inner.halted[idx] = halted;
            }
        }
        inner.request = state.request.as_ref().map(SavedRequest::restore);
        tracing::debug!(location = %inner.location, "restored state {:?}", inner.state());
        Ok(())
    }
}
