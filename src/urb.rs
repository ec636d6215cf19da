//! USB request blocks and the queues the device parks them on.

use bytes::{Buf, BufMut};
use std::{collections::VecDeque, fmt};

use crate::{Direction, EP_BULK_IN, EP_BULK_OUT, EP_CONTROL};

/// Size of a control setup packet.
pub const SETUP_LEN: usize = 8;

/// Identifies a URB for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrbId(pub u64);

impl fmt::Display for UrbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "urb#{}", self.0)
    }
}

/// Completion status of a URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UrbStatus {
    /// Not completed yet.
    #[default]
    Pending,
    /// Transfer succeeded.
    Ok,
    /// Endpoint stalled.
    Stall,
    /// Transfer was aborted by a reset, as if the device had been unplugged.
    TransportError,
    /// Transfer was cancelled by the framework.
    Cancelled,
}

/// A transfer handed to the device by the USB framework.
///
/// The device never allocates URBs. It takes ownership on dispatch and hands
/// every URB back through the done queue.
pub struct Urb {
    /// Identifier used for cancellation.
    pub id: UrbId,
    /// Endpoint address, including the direction bit.
    pub endpoint: u8,
    /// Transfer direction.
    pub direction: Direction,
    /// Transfer buffer. Control transfers start with the setup packet.
    pub data: Vec<u8>,
    /// Transfer length. Requested length on submission, actual length on completion.
    pub len: usize,
    /// Whether a short transfer is an error.
    pub short_not_ok: bool,
    /// Completion status.
    pub status: UrbStatus,
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Urb")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("direction", &self.direction)
            .field("len", &self.len)
            .field("short_not_ok", &self.short_not_ok)
            .field("status", &self.status)
            .finish()
    }
}

impl Urb {
    /// Creates a host-to-device transfer on the bulk-out endpoint.
    pub fn bulk_out(id: UrbId, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            id,
            endpoint: EP_BULK_OUT,
            direction: Direction::Out,
            data,
            len,
            short_not_ok: false,
            status: UrbStatus::Pending,
        }
    }

    /// Creates a device-to-host transfer of `len` bytes on the bulk-in endpoint.
    pub fn bulk_in(id: UrbId, len: usize) -> Self {
        Self {
            id,
            endpoint: EP_BULK_IN,
            direction: Direction::In,
            data: vec![0; len],
            len,
            short_not_ok: false,
            status: UrbStatus::Pending,
        }
    }

    /// Creates a control transfer.
    ///
    /// For host-to-device requests `payload` is the data stage; for device-to-host
    /// requests room for `w_length` response bytes is reserved behind the setup packet.
    pub fn control(id: UrbId, setup: SetupPacket, payload: &[u8]) -> Self {
        let mut data = setup.to_bytes().to_vec();
        let direction = setup.direction();
        match direction {
            Direction::Out => data.extend_from_slice(payload),
            Direction::In => data.resize(SETUP_LEN + usize::from(setup.length), 0),
        }
        let len = data.len();
        Self { id, endpoint: EP_CONTROL, direction, data, len, short_not_ok: false, status: UrbStatus::Pending }
    }

    /// Sets whether a short transfer is an error.
    #[must_use]
    pub fn with_short_not_ok(mut self, short_not_ok: bool) -> Self {
        self.short_not_ok = short_not_ok;
        self
    }

    /// Transferred bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(self.data.len())]
    }

    /// Response of a completed device-to-host control transfer.
    pub fn control_response(&self) -> &[u8] {
        self.payload().get(SETUP_LEN..).unwrap_or_default()
    }
}

/// FIFO of URBs.
///
/// Holds no lock of its own; callers serialize access through the device lock.
#[derive(Debug, Default)]
pub struct UrbQueue {
    urbs: VecDeque<Urb>,
}

impl UrbQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.urbs.is_empty()
    }

    /// Number of queued URBs.
    pub fn len(&self) -> usize {
        self.urbs.len()
    }

    /// Appends a URB at the tail.
    pub fn append(&mut self, urb: Urb) {
        self.urbs.push_back(urb);
    }

    /// Removes the URB at the head.
    pub fn remove_head(&mut self) -> Option<Urb> {
        self.urbs.pop_front()
    }

    /// Removes the URB with the given id, wherever it is queued.
    pub fn remove(&mut self, id: UrbId) -> Option<Urb> {
        let pos = self.urbs.iter().position(|urb| urb.id == id)?;
        self.urbs.remove(pos)
    }

    /// Whether a URB with the given id is queued.
    pub fn contains(&self, id: UrbId) -> bool {
        self.urbs.iter().any(|urb| urb.id == id)
    }

    /// Takes all queued URBs, leaving the queue empty.
    pub fn take_all(&mut self) -> impl Iterator<Item = Urb> {
        std::mem::take(&mut self.urbs).into_iter()
    }
}

/// Control transfer setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    /// Direction, type and recipient.
    pub request_type: u8,
    /// Request code.
    pub request: u8,
    /// Request-specific value.
    pub value: u16,
    /// Request-specific index, usually an interface or endpoint.
    pub index: u16,
    /// Length of the data stage.
    pub length: u16,
}

impl SetupPacket {
    /// Direction bit of `request_type`.
    pub const DIR_IN: u8 = 0x80;
    /// Standard request type.
    pub const TYPE_STANDARD: u8 = 0x00;
    /// Class request type.
    pub const TYPE_CLASS: u8 = 0x20;
    /// Mask of the type bits.
    pub const TYPE_MASK: u8 = 0x60;
    /// Device recipient.
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    /// Interface recipient.
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    /// Endpoint recipient.
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    /// Mask of the recipient bits.
    pub const RECIPIENT_MASK: u8 = 0x1f;

    /// Creates a setup packet.
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self { request_type, request, value, index, length }
    }

    /// Parses the setup packet at the start of a control transfer.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut buf = data.get(..SETUP_LEN)?;
        Some(Self {
            request_type: buf.get_u8(),
            request: buf.get_u8(),
            value: buf.get_u16_le(),
            index: buf.get_u16_le(),
            length: buf.get_u16_le(),
        })
    }

    /// Encodes the setup packet.
    pub fn to_bytes(&self) -> [u8; SETUP_LEN] {
        let mut out = [0; SETUP_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(self.request_type);
        buf.put_u8(self.request);
        buf.put_u16_le(self.value);
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.length);
        out
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        if self.request_type & Self::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Request type bits.
    pub fn kind(&self) -> u8 {
        self.request_type & Self::TYPE_MASK
    }

    /// Recipient bits.
    pub fn recipient(&self) -> u8 {
        self.request_type & Self::RECIPIENT_MASK
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(queue: &UrbQueue) -> Vec<u64> {
        queue.urbs.iter().map(|urb| urb.id.0).collect()
    }

    #[test]
    fn fifo_order() {
        let mut queue = UrbQueue::new();
        assert!(queue.is_empty());
        for n in 0..3 {
            queue.append(Urb::bulk_in(UrbId(n), 13));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.remove_head().map(|urb| urb.id), Some(UrbId(0)));
        queue.append(Urb::bulk_in(UrbId(3), 13));
        assert_eq!(ids(&queue), [1, 2, 3]);
    }

    #[test]
    fn remove_arbitrary() {
        let mut queue = UrbQueue::new();
        for n in 0..4 {
            queue.append(Urb::bulk_in(UrbId(n), 13));
        }
        assert_eq!(queue.remove(UrbId(2)).map(|urb| urb.id), Some(UrbId(2)));
        assert!(queue.remove(UrbId(2)).is_none());
        assert_eq!(ids(&queue), [0, 1, 3]);

        // Removing the tail must leave appends working.
        assert!(queue.remove(UrbId(3)).is_some());
        queue.append(Urb::bulk_in(UrbId(4), 13));
        assert_eq!(ids(&queue), [0, 1, 4]);

        let drained: Vec<_> = queue.take_all().map(|urb| urb.id.0).collect();
        assert_eq!(drained, [0, 1, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn control_urb_layout() {
        let setup = SetupPacket::new(0xa1, 0xfe, 0, 0, 1);
        let urb = Urb::control(UrbId(9), setup, &[]);
        assert_eq!(urb.direction, Direction::In);
        assert_eq!(urb.data.len(), SETUP_LEN + 1);
        assert_eq!(SetupPacket::parse(&urb.data), Some(setup));
        assert_eq!(setup.kind(), SetupPacket::TYPE_CLASS);
        assert_eq!(setup.recipient(), SetupPacket::RECIPIENT_INTERFACE);
    }
}
