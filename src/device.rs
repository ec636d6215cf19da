//! Emulated mass-storage device.

use futures::{stream, Stream};
use std::{
    fmt,
    mem::take,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tokio::sync::Notify;

use crate::{
    config::MsdConfig,
    control::DescriptorCache,
    diag::{Complaint, LogLimiter, MsdStats},
    request::{Received, Request, RequestState},
    scsi::{ScsiBackend, ScsiCommand, ScsiOutcome},
    urb::{Urb, UrbId, UrbQueue, UrbStatus},
    wire::{Cbw, CSW_LEN},
    Direction, Outcome, Result, EP_BULK_IN, EP_BULK_OUT, EP_CONTROL,
};

/// Endpoints that can be halted, indexed by [`halt_index`].
pub(crate) const ENDPOINTS: usize = 3;

/// Index of an endpoint's halted flag.
pub(crate) fn halt_index(endpoint: u8) -> Option<usize> {
    match endpoint {
        EP_CONTROL | 0x80 => Some(0),
        EP_BULK_IN => Some(1),
        EP_BULK_OUT => Some(2),
        _ => None,
    }
}

/// Which halted flags a stall sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    None,
    Endpoint(u8),
    /// Both bulk pipes.
    Bulk,
}

/// Where a transfer goes after a handler has looked at it.
#[derive(Debug)]
pub(crate) enum Disposition {
    Complete(Urb),
    Stall(Urb, Halt),
    /// Wait on the pending-to-host queue for the executing command.
    Park(Urb),
    /// Kept by the reset coordinator.
    Hold,
    /// SET_CONFIGURATION of the current configuration, which resets the device first.
    Reconfigure(Urb, u8),
}

/// Device state protected by the device lock.
pub(crate) struct Inner {
    /// Current request, unless it is executing or not allocated yet.
    pub request: Option<Box<Request>>,
    /// Generation of the executing command.
    pub executing: Option<u64>,
    pub next_generation: u64,
    pub to_host: UrbQueue,
    pub done: UrbQueue,
    /// Bulk-Only reset waiting for the executing command.
    pub reset_urb: Option<Urb>,
    pub halted: [bool; ENDPOINTS],
    pub configuration: u8,
    pub descriptors: Option<Arc<dyn DescriptorCache>>,
    pub max_transfer_length: u32,
    pub location: String,
    pub stats: MsdStats,
    limiter: LogLimiter,
    /// Requests to hand to the backend once the lock is released.
    submissions: Vec<(u64, Box<Request>)>,
    done_added: bool,
    wakeup: bool,
}

impl Inner {
    pub fn state(&self) -> RequestState {
        match (&self.executing, &self.request) {
            (Some(_), _) => RequestState::Executing,
            (None, Some(req)) => req.state,
            (None, None) => RequestState::Ready,
        }
    }

    pub fn complain(&mut self, kind: Complaint, msg: fmt::Arguments) {
        if self.limiter.allow(kind) {
            tracing::warn!(location = %self.location, "{msg}");
        } else {
            tracing::trace!(location = %self.location, "{msg}");
        }
    }

    pub fn complete(&mut self, mut urb: Urb, status: UrbStatus) {
        #[cfg(feature = "trace-transfers")]
        tracing::trace!("completing {} with {status:?}, {} bytes", urb.id, urb.len);
        urb.status = status;
        self.done.append(urb);
        self.done_added = true;
    }

    pub fn stall(&mut self, urb: Urb, halt: Halt) {
        match halt {
            Halt::None => (),
            Halt::Endpoint(endpoint) => {
                if let Some(idx) = halt_index(endpoint) {
                    self.halted[idx] = true;
                }
            }
            Halt::Bulk => {
                self.halted[1] = true;
                self.halted[2] = true;
            }
        }
        self.stats.stalls += 1;
        self.complete(urb, UrbStatus::Stall);
    }

    pub fn apply(&mut self, disposition: Disposition) -> Outcome {
        match disposition {
            Disposition::Complete(urb) => {
                self.complete(urb, UrbStatus::Ok);
                Outcome::Completed
            }
            Disposition::Stall(urb, halt) => {
                self.stall(urb, halt);
                Outcome::Stalled
            }
            Disposition::Park(urb) => {
                self.to_host.append(urb);
                Outcome::Queued
            }
            Disposition::Hold => Outcome::Queued,
            Disposition::Reconfigure(urb, value) => {
                // Only reachable without an executing command.
                self.finish_reset(crate::reset::ResetKind::SetConfiguration(value));
                self.complete(urb, UrbStatus::Ok);
                Outcome::Completed
            }
        }
    }

    fn is_halted(&self, endpoint: u8) -> bool {
        halt_index(endpoint).is_some_and(|idx| self.halted[idx])
    }

    /// Hands the current request to the backend, or answers it locally.
    fn start_command(&mut self, length: u32) {
        let Some(mut req) = self.request.take() else { return };

        if req.is_request_sense() {
            req.answer_request_sense();
            tracing::debug!(
                location = %self.location,
                tag = req.cbw.tag,
                "answered REQUEST SENSE from retained sense data"
            );
            self.request = Some(req);
            return;
        }

        req.start(length);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.executing = Some(generation);
        self.stats.commands += 1;
        self.submissions.push((generation, req));
    }

    pub fn bulk_out(&mut self, urb: Urb) -> Disposition {
        if urb.direction != Direction::Out {
            self.complain(
                Complaint::WrongState,
                format_args!("device-to-host transfer {} on bulk-out pipe", urb.id),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT));
        }
        if self.is_halted(EP_BULK_OUT) {
            self.complain(Complaint::Halted, format_args!("transfer {} on halted bulk-out pipe", urb.id));
            return Disposition::Stall(urb, Halt::None);
        }

        match self.state() {
            RequestState::Ready => self.receive_cbw(urb),
            RequestState::DataFromHost => self.receive_data(urb),
            state => {
                self.complain(
                    Complaint::WrongState,
                    format_args!("bulk-out transfer {} in state {state:?}", urb.id),
                );
                Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT))
            }
        }
    }

    fn receive_cbw(&mut self, urb: Urb) -> Disposition {
        let cbw = match Cbw::parse(urb.payload()) {
            Ok(cbw) => cbw,
            Err(err) => {
                self.complain(Complaint::BadCbw, format_args!("rejecting CBW: {err}"));
                return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT));
            }
        };
        let max = self.max_transfer_length;
        if cbw.data_transfer_length > max {
            self.complain(
                Complaint::BadCbw,
                format_args!("rejecting CBW with transfer length {} above {max}", cbw.data_transfer_length),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT));
        }

        let req = self.request.get_or_insert_with(Box::default);
        if let Err(err) = req.prepare(cbw) {
            tracing::warn!(
                location = %self.location,
                "cannot allocate {} byte buffer: {err}",
                cbw.data_transfer_length
            );
            return Disposition::Stall(urb, Halt::Bulk);
        }

        tracing::debug!(
            location = %self.location,
            tag = cbw.tag,
            length = cbw.data_transfer_length,
            direction = ?cbw.direction(),
            "CBW with opcode {:#04x}",
            cbw.opcode()
        );

        if cbw.direction() == Direction::Out && cbw.data_transfer_length > 0 {
            req.state = RequestState::DataFromHost;
        } else {
            self.start_command(cbw.data_transfer_length);
        }
        Disposition::Complete(urb)
    }

    fn receive_data(&mut self, urb: Urb) -> Disposition {
        let Some(req) = self.request.as_mut() else {
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT));
        };

        match req.receive(urb.payload()) {
            Received::Partial => Disposition::Complete(urb),
            Received::Complete => {
                let length = req.cbw.data_transfer_length;
                self.start_command(length);
                Disposition::Complete(urb)
            }
            Received::Overrun => {
                let (offset, declared) = (req.offset, req.declared());
                self.complain(
                    Complaint::Overrun,
                    format_args!("{} bytes overrun data phase at {offset} of {declared} bytes", urb.len),
                );
                Disposition::Stall(urb, Halt::Endpoint(EP_BULK_OUT))
            }
        }
    }

    pub fn bulk_in(&mut self, urb: Urb) -> Disposition {
        if urb.direction != Direction::In {
            self.complain(
                Complaint::WrongState,
                format_args!("host-to-device transfer {} on bulk-in pipe", urb.id),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        }
        if self.is_halted(EP_BULK_IN) {
            self.complain(Complaint::Halted, format_args!("transfer {} on halted bulk-in pipe", urb.id));
            return Disposition::Stall(urb, Halt::None);
        }

        match self.state() {
            RequestState::Executing => Disposition::Park(urb),
            RequestState::DataToHost => self.send_data(urb),
            RequestState::Status => self.send_status(urb),
            RequestState::DataFromHost => self.early_status(urb),
            state => {
                self.complain(
                    Complaint::WrongState,
                    format_args!("bulk-in transfer {} in state {state:?}", urb.id),
                );
                Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN))
            }
        }
    }

    fn send_data(&mut self, mut urb: Urb) -> Disposition {
        let Some(req) = self.request.as_mut() else {
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        };

        let requested = urb.len.min(urb.data.len());
        let available = req.remaining_to_host();
        if available < requested && urb.short_not_ok {
            // The data phase ends with the stall; the host reads the CSW after clearing it.
            req.state = RequestState::Status;
            self.complain(
                Complaint::Underrun,
                format_args!("host wants {requested} bytes, only {available} available"),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        }

        let n = req.deliver(&mut urb.data[..requested]);
        urb.len = n;
        if n < requested || req.offset >= req.declared() {
            req.state = RequestState::Status;
        }
        Disposition::Complete(urb)
    }

    fn send_status(&mut self, mut urb: Urb) -> Disposition {
        let Some(req) = self.request.as_mut() else {
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        };

        let requested = urb.len.min(urb.data.len());
        if requested < CSW_LEN || (requested > CSW_LEN && urb.short_not_ok) {
            self.complain(Complaint::BadStatusRead, format_args!("status read of {requested} bytes"));
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        }

        let csw = req.csw();
        urb.data[..CSW_LEN].copy_from_slice(&csw.to_bytes());
        urb.len = CSW_LEN;
        req.rewind();

        tracing::debug!(
            location = %self.location,
            tag = csw.tag,
            residue = csw.data_residue,
            "CSW with status {:?}",
            csw.status
        );
        Disposition::Complete(urb)
    }

    /// Status read while the host has not finished the data-out phase.
    ///
    /// Some guest drivers do this; the data received so far is taken as the
    /// whole command. Only a read sized for exactly one CSW counts as such.
    fn early_status(&mut self, urb: Urb) -> Disposition {
        let requested = urb.len.min(urb.data.len());
        if requested != CSW_LEN {
            self.complain(
                Complaint::WrongState,
                format_args!("bulk-in transfer {} of {requested} bytes during data-out phase", urb.id),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        }

        let Some(req) = self.request.as_mut() else {
            return Disposition::Stall(urb, Halt::Endpoint(EP_BULK_IN));
        };

        let received = req.offset;
        tracing::debug!(
            location = %self.location,
            "status read after {received} of {} data-out bytes, truncating command",
            req.declared()
        );

        if received == 0 {
            req.start(0);
            req.finish(ScsiOutcome::good(0));
            return self.send_status(urb);
        }

        self.start_command(received as u32);
        Disposition::Park(urb)
    }
}

/// State shared between the device handle and in-flight SCSI commands.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when a SCSI command completes.
    pub scsi_done: Condvar,
    /// Signalled when a URB lands on the done queue.
    urb_done: Condvar,
    urb_notify: Notify,
    backend: Arc<dyn ScsiBackend>,
    pub reset_timeout: Duration,
    this: Weak<Shared>,
}

impl Shared {
    pub fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    /// Releases the device lock, then wakes reapers and submits queued commands.
    pub fn release(&self, mut inner: MutexGuard<'_, Inner>) {
        let submissions = take(&mut inner.submissions);
        let notify = take(&mut inner.done_added);
        drop(inner);

        if notify {
            self.urb_done.notify_all();
            self.urb_notify.notify_one();
        }

        for (generation, request) in submissions {
            let command = ScsiCommand::new(request, generation, self.this.clone());
            tracing::trace!("submitting {command:?}");
            self.backend.submit(command);
        }
    }

    /// Completion of a SCSI command.
    pub fn complete_scsi(
        device: &Weak<Shared>, generation: u64, mut request: Box<Request>, outcome: ScsiOutcome,
    ) {
        let Some(shared) = device.upgrade() else {
            tracing::trace!("SCSI command completed after device was dropped");
            return;
        };
        let mut inner = match shared.lock() {
            Ok(inner) => inner,
            Err(err) => {
                tracing::error!("cannot complete SCSI command: {err}");
                return;
            }
        };

        if inner.executing != Some(generation) {
            // Abandoned by a reset: the request is dropped here and nowhere else.
            inner.stats.reclaimed += 1;
            tracing::debug!(location = %inner.location, generation, "releasing request abandoned by reset");
            return;
        }

        if outcome.retry {
            tracing::trace!(location = %inner.location, "backend suggests retry, ignored");
        }
        request.finish(outcome);
        tracing::debug!(
            location = %inner.location,
            tag = request.cbw.tag,
            transferred = request.scsi.transferred,
            "SCSI command completed with status {:#04x}",
            request.scsi.status.0
        );

        inner.executing = None;
        inner.request = Some(request);
        shared.scsi_done.notify_all();

        let parked: Vec<Urb> = inner.to_host.take_all().collect();
        for urb in parked {
            let disposition = inner.bulk_in(urb);
            inner.apply(disposition);
        }

        if inner.reset_urb.is_some() {
            inner.finish_reset(crate::reset::ResetKind::BulkOnly);
        }

        shared.release(inner);
    }
}

/// Emulated USB mass-storage device using the Bulk-Only Transport.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct MsdDevice {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for MsdDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("MsdDevice");
        if let Ok(inner) = self.shared.inner.try_lock() {
            s.field("location", &inner.location).field("state", &inner.state());
        }
        s.finish()
    }
}

impl MsdDevice {
    /// Creates a device forwarding SCSI commands to `backend`.
    pub fn new(backend: Arc<dyn ScsiBackend>, config: MsdConfig) -> Self {
        let location = backend.location();
        tracing::debug!(%location, "creating mass-storage device");

        let inner = Inner {
            request: None,
            executing: None,
            next_generation: 0,
            to_host: UrbQueue::new(),
            done: UrbQueue::new(),
            reset_urb: None,
            halted: [false; ENDPOINTS],
            configuration: 0,
            descriptors: None,
            max_transfer_length: config.max_transfer_length,
            location,
            stats: MsdStats::default(),
            limiter: LogLimiter::new(config.log_limit),
            submissions: Vec::new(),
            done_added: false,
            wakeup: false,
        };

        let shared = Arc::new_cyclic(|this| Shared {
            inner: Mutex::new(inner),
            scsi_done: Condvar::new(),
            urb_done: Condvar::new(),
            urb_notify: Notify::new(),
            backend,
            reset_timeout: config.reset_timeout,
            this: this.clone(),
        });

        Self { shared }
    }

    /// Sets the cache answering standard GET_DESCRIPTOR requests.
    pub fn set_descriptor_cache(&self, cache: Arc<dyn DescriptorCache>) -> Result<()> {
        self.shared.lock()?.descriptors = Some(cache);
        Ok(())
    }

    /// Processes a transfer on the given endpoint.
    ///
    /// Never blocks. The URB ends up on the done queue, unless it is parked
    /// until a SCSI command completes.
    pub fn dispatch(&self, endpoint: u8, urb: Urb) -> Result<Outcome> {
        #[cfg(feature = "trace-transfers")]
        tracing::trace!("dispatching {urb:?} on endpoint {endpoint:#04x}");

        let mut inner = self.shared.lock()?;
        let disposition = match endpoint {
            EP_CONTROL | 0x80 => inner.control(urb),
            EP_BULK_OUT => inner.bulk_out(urb),
            EP_BULK_IN => inner.bulk_in(urb),
            other => {
                inner.complain(
                    Complaint::WrongState,
                    format_args!("transfer {} on unknown endpoint {other:#04x}", urb.id),
                );
                Disposition::Stall(urb, Halt::None)
            }
        };

        let outcome = match disposition {
            Disposition::Reconfigure(urb, value) if inner.executing.is_some() => {
                inner = self.shared.reset_locked(inner, crate::reset::ResetKind::SetConfiguration(value))?;
                inner.apply(Disposition::Complete(urb))
            }
            disposition => inner.apply(disposition),
        };

        self.shared.release(inner);
        Ok(outcome)
    }

    /// Cancels a URB.
    ///
    /// A URB that is not parked is either completed already or unknown; then
    /// this does nothing.
    pub fn cancel(&self, id: UrbId) -> Result<()> {
        let mut inner = self.shared.lock()?;

        let urb = match inner.to_host.remove(id) {
            Some(urb) => Some(urb),
            None => inner.reset_urb.take_if(|urb| urb.id == id),
        };

        match urb {
            Some(urb) => {
                tracing::debug!(location = %inner.location, "cancelling {id}");
                inner.stats.cancelled += 1;
                inner.complete(urb, UrbStatus::Cancelled);
            }
            None => tracing::trace!(location = %inner.location, "{id} not queued, nothing to cancel"),
        }

        self.shared.release(inner);
        Ok(())
    }

    /// Takes the next completed URB.
    ///
    /// With a timeout, waits up to that long for one to arrive or for [`wakeup`](Self::wakeup).
    pub fn reap(&self, timeout: Option<Duration>) -> Result<Option<Urb>> {
        let mut inner = self.shared.lock()?;
        if let Some(timeout) = timeout {
            inner = self
                .shared
                .urb_done
                .wait_timeout_while(inner, timeout, |inner| inner.done.is_empty() && !inner.wakeup)?
                .0;
        }
        inner.wakeup = false;
        Ok(inner.done.remove_head())
    }

    /// Wakes a thread blocked in [`reap`](Self::reap).
    pub fn wakeup(&self) -> Result<()> {
        self.shared.lock()?.wakeup = true;
        self.shared.urb_done.notify_all();
        Ok(())
    }

    /// Waits for the next completed URB.
    pub async fn reap_async(&self) -> Result<Urb> {
        loop {
            let notified = self.shared.urb_notify.notified();
            let urb = self.shared.lock()?.done.remove_head();
            if let Some(urb) = urb {
                return Ok(urb);
            }
            notified.await;
        }
    }

    /// Stream of completed URBs.
    pub fn done_stream(&self) -> impl Stream<Item = Result<Urb>> {
        stream::unfold(Some(self.clone()), |this| async move {
            let this = this?;
            match this.reap_async().await {
                Ok(urb) => Some((Ok(urb), Some(this))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// State of the current request, or `None` if no request is allocated.
    pub fn state(&self) -> Result<Option<RequestState>> {
        let inner = self.shared.lock()?;
        Ok(match (&inner.executing, &inner.request) {
            (None, None) => None,
            _ => Some(inner.state()),
        })
    }

    /// Device statistics.
    pub fn stats(&self) -> Result<MsdStats> {
        Ok(self.shared.lock()?.stats)
    }

    /// Waits up to `timeout` for the executing SCSI command, if any, to complete.
    ///
    /// Returns whether the device is idle.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let inner = self.shared.lock()?;
        let (inner, _) =
            self.shared.scsi_done.wait_timeout_while(inner, timeout, |inner| inner.executing.is_some())?;
        Ok(inner.executing.is_none())
    }

    /// Whether an endpoint is halted.
    pub fn is_halted(&self, endpoint: u8) -> Result<bool> {
        Ok(self.shared.lock()?.is_halted(endpoint))
    }

    /// Clears the halted flag of an endpoint, as done by CLEAR_FEATURE(ENDPOINT_HALT).
    pub fn clear_halted_endpoint(&self, endpoint: u8) -> Result<()> {
        let mut inner = self.shared.lock()?;
        if let Some(idx) = halt_index(endpoint) {
            tracing::debug!(location = %inner.location, "clearing halt on endpoint {endpoint:#04x}");
            inner.halted[idx] = false;
        }
        Ok(())
    }

    /// Current configuration value.
    pub fn configuration(&self) -> Result<u8> {
        Ok(self.shared.lock()?.configuration)
    }
}
