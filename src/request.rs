//! The single Bulk-Only transaction in flight.

use std::collections::TryReserveError;

use crate::{
    scsi::{sense, ScsiOutcome, ScsiStatus},
    wire::{Cbw, Csw, CswStatus},
    Direction,
};

/// State of the Bulk-Only transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestState {
    /// Waiting for a CBW.
    #[default]
    Ready,
    /// Receiving the data phase from the host.
    DataFromHost,
    /// The SCSI backend is executing the command.
    Executing,
    /// Sending the data phase to the host.
    DataToHost,
    /// Waiting for the host to read the CSW.
    Status,
    /// Abandoned by a reset; released when its SCSI command completes.
    ///
    /// Such a request belongs to its [`ScsiCommand`](crate::ScsiCommand) alone and is
    /// never reported by the device; the command's generation number identifies it.
    /// Saved states carrying it are rejected.
    DestroyOnCompletion,
}

/// SCSI-side parameters of the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScsiParams {
    pub direction: Direction,
    /// Bytes handed to or expected from the backend.
    pub length: u32,
    pub status: ScsiStatus,
    /// Bytes the backend reported as transferred.
    pub transferred: u32,
    /// Backend transferred more than it was asked to.
    pub phase_error: bool,
}

impl Default for ScsiParams {
    fn default() -> Self {
        Self {
            direction: Direction::Out,
            length: 0,
            status: ScsiStatus::GOOD,
            transferred: 0,
            phase_error: false,
        }
    }
}

/// Result of storing data from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// More data is expected.
    Partial,
    /// The declared length has been reached.
    Complete,
    /// The host sent more than declared.
    Overrun,
}

#[derive(Debug, Default)]
pub(crate) struct Request {
    pub state: RequestState,
    /// Data buffer, sized to the declared transfer length of the current CBW.
    pub buf: Vec<u8>,
    /// Bytes received from the host, or delivered to it, in the data phase.
    pub offset: usize,
    pub cbw: Cbw,
    pub scsi: ScsiParams,
    /// Sense data of the last completed command.
    pub sense: [u8; sense::SENSE_LEN],
}

impl Request {
    /// Takes a new CBW and sizes the buffer for it.
    ///
    /// The allocation is kept between transactions; only its contents are cleared.
    pub fn prepare(&mut self, cbw: Cbw) -> Result<(), TryReserveError> {
        let len = cbw.data_transfer_length as usize;
        self.buf.try_reserve(len.saturating_sub(self.buf.len()))?;
        self.buf.clear();
        self.buf.resize(len, 0);
        self.offset = 0;
        self.cbw = cbw;
        self.scsi = ScsiParams { direction: cbw.direction(), ..ScsiParams::default() };
        Ok(())
    }

    /// Declared transfer length of the current CBW.
    pub fn declared(&self) -> usize {
        self.cbw.data_transfer_length as usize
    }

    /// Stores data received from the host.
    pub fn receive(&mut self, data: &[u8]) -> Received {
        let end = self.offset + data.len();
        if end > self.declared() {
            return Received::Overrun;
        }
        self.buf[self.offset..end].copy_from_slice(data);
        self.offset = end;
        if self.offset == self.declared() {
            Received::Complete
        } else {
            Received::Partial
        }
    }

    /// Sets up the backend side of the command and enters [`RequestState::Executing`].
    pub fn start(&mut self, length: u32) {
        self.scsi.length = length;
        self.scsi.status = ScsiStatus::GOOD;
        self.scsi.transferred = 0;
        self.scsi.phase_error = false;
        self.sense = [0; sense::SENSE_LEN];
        self.state = RequestState::Executing;
    }

    /// Whether the command is a REQUEST SENSE that is answered locally.
    pub fn is_request_sense(&self) -> bool {
        self.cbw.opcode() == sense::OP_REQUEST_SENSE
            && (self.cbw.direction() == Direction::In || self.cbw.data_transfer_length == 0)
    }

    /// Answers REQUEST SENSE from the sense data retained from the previous command.
    ///
    /// The retained sense data is consumed.
    pub fn answer_request_sense(&mut self) {
        let retained = self.sense;
        let data = if retained.iter().all(|&b| b == 0) { sense::no_sense() } else { retained };
        let allocation = usize::from(self.cbw.cb[4]);
        let len = self.declared().min(allocation).min(data.len());
        self.buf[..len].copy_from_slice(&data[..len]);

        self.scsi = ScsiParams {
            direction: Direction::In,
            length: len as u32,
            status: ScsiStatus::GOOD,
            transferred: len as u32,
            phase_error: false,
        };
        self.sense = [0; sense::SENSE_LEN];
        self.offset = 0;
        self.state = self.state_after_execution();
    }

    /// Records the backend's result and leaves [`RequestState::Executing`].
    pub fn finish(&mut self, outcome: ScsiOutcome) {
        self.scsi.status = outcome.status;
        self.scsi.phase_error = outcome.transferred > self.scsi.length;
        self.scsi.transferred = outcome.transferred.min(self.scsi.length);
        if outcome.status.is_good() {
            self.sense = [0; sense::SENSE_LEN];
        }
        if self.scsi.direction == Direction::In {
            self.offset = 0;
        }
        self.state = self.state_after_execution();
    }

    fn state_after_execution(&self) -> RequestState {
        if self.scsi.direction == Direction::In && self.declared() > 0 {
            RequestState::DataToHost
        } else {
            RequestState::Status
        }
    }

    /// Copies the next chunk of the data phase into `out`.
    ///
    /// Returns the number of bytes copied.
    pub fn deliver(&mut self, out: &mut [u8]) -> usize {
        let n = self.remaining_to_host().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
        self.offset += n;
        n
    }

    /// Bytes produced by the backend that the host has not read yet.
    pub fn remaining_to_host(&self) -> usize {
        (self.scsi.transferred as usize).min(self.buf.len()).saturating_sub(self.offset)
    }

    /// Bytes of the declared length that were not transferred.
    pub fn residue(&self) -> u32 {
        let transferred = match self.scsi.direction {
            Direction::In => self.offset,
            Direction::Out if self.scsi.status.is_good() => self.offset,
            Direction::Out => self.offset.min(self.scsi.transferred as usize),
        };
        self.cbw.data_transfer_length.saturating_sub(transferred as u32)
    }

    /// Builds the status wrapper of the completed command.
    pub fn csw(&self) -> Csw {
        let status = if self.scsi.phase_error {
            CswStatus::PhaseError
        } else if self.scsi.status.is_good() {
            CswStatus::Ok
        } else {
            CswStatus::Failed
        };
        Csw { tag: self.cbw.tag, data_residue: self.residue(), status }
    }

    /// Returns to [`RequestState::Ready`], keeping the buffer allocation.
    pub fn rewind(&mut self) {
        self.state = RequestState::Ready;
        self.offset = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(cbw: Cbw) -> Request {
        let mut req = Request::default();
        req.prepare(cbw).unwrap();
        req
    }

    #[test]
    fn write_data_phase() {
        let mut req = request(Cbw::new(3, 8, Direction::Out, &[0x2a; 10]));
        assert_eq!(req.receive(&[1; 5]), Received::Partial);
        assert_eq!(req.receive(&[2; 4]), Received::Overrun);
        assert_eq!(req.receive(&[2; 3]), Received::Complete);
        assert_eq!(&req.buf, &[1, 1, 1, 1, 1, 2, 2, 2]);

        req.start(8);
        assert_eq!(req.state, RequestState::Executing);
        req.finish(ScsiOutcome::good(8));
        assert_eq!(req.state, RequestState::Status);
        assert_eq!(req.csw(), Csw { tag: 3, data_residue: 0, status: CswStatus::Ok });
    }

    #[test]
    fn failed_write_reports_backend_residue() {
        let mut req = request(Cbw::new(4, 1024, Direction::Out, &[0x2a; 10]));
        req.receive(&[0; 1024]);
        req.start(1024);
        req.finish(ScsiOutcome::check_condition(512));
        let csw = req.csw();
        assert_eq!(csw.status, CswStatus::Failed);
        assert_eq!(csw.data_residue, 512);
    }

    #[test]
    fn read_data_phase() {
        let mut req = request(Cbw::new(5, 16, Direction::In, &[0x28; 10]));
        req.start(16);
        req.buf.copy_from_slice(&[7; 16]);
        req.finish(ScsiOutcome::good(16));
        assert_eq!(req.state, RequestState::DataToHost);

        let mut out = [0; 10];
        assert_eq!(req.deliver(&mut out), 10);
        assert_eq!(req.remaining_to_host(), 6);
        assert_eq!(req.deliver(&mut out), 6);
        assert_eq!(req.residue(), 0);
    }

    #[test]
    fn backend_overrun_is_phase_error() {
        let mut req = request(Cbw::new(6, 4, Direction::In, &[0x28; 10]));
        req.start(4);
        req.finish(ScsiOutcome::good(8));
        assert_eq!(req.csw().status, CswStatus::PhaseError);
        assert_eq!(req.remaining_to_host(), 4);
    }

    #[test]
    fn request_sense_consumes_retained_sense() {
        let mut req = request(Cbw::new(7, 18, Direction::In, &[sense::OP_REQUEST_SENSE, 0, 0, 0, 18, 0]));
        req.sense = sense::fixed(sense::KEY_MEDIUM_ERROR, 0x11, 0);
        assert!(req.is_request_sense());
        req.answer_request_sense();
        assert_eq!(req.state, RequestState::DataToHost);
        assert_eq!(sense::key(&req.buf), sense::KEY_MEDIUM_ERROR);
        assert_eq!(req.sense, [0; sense::SENSE_LEN]);
    }

    #[test]
    fn buffer_is_reused() {
        let mut req = request(Cbw::new(1, 4096, Direction::In, &[0x28; 10]));
        req.buf.fill(0xff);
        let capacity = req.buf.capacity();
        req.prepare(Cbw::new(2, 512, Direction::In, &[0x28; 10])).unwrap();
        assert_eq!(req.buf.len(), 512);
        assert_eq!(req.buf.capacity(), capacity);
        assert!(req.buf.iter().all(|&b| b == 0));
    }
}
