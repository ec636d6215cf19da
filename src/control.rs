//! Control pipe requests.

use crate::{
    device::{halt_index, Disposition, Halt, Inner},
    diag::Complaint,
    urb::{SetupPacket, Urb, SETUP_LEN},
    EP_CONTROL, REQ_BULK_ONLY_RESET, REQ_GET_MAX_LUN,
};

const REQ_GET_STATUS: u8 = 0x00;
const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const REQ_GET_DESCRIPTOR: u8 = 0x06;
const REQ_GET_CONFIGURATION: u8 = 0x08;
const REQ_SET_CONFIGURATION: u8 = 0x09;
const REQ_GET_INTERFACE: u8 = 0x0a;
const REQ_SET_INTERFACE: u8 = 0x0b;

const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_REMOTE_WAKEUP: u16 = 1;

const CLASS_INTERFACE_OUT: u8 = SetupPacket::TYPE_CLASS | SetupPacket::RECIPIENT_INTERFACE;
const CLASS_INTERFACE_IN: u8 = SetupPacket::DIR_IN | CLASS_INTERFACE_OUT;

/// Provides the device's USB descriptors.
pub trait DescriptorCache: Send + Sync {
    /// Returns the descriptor of the given type and index.
    fn descriptor(&self, kind: u8, index: u8, language: u16) -> Option<Vec<u8>>;
}

/// Writes a device-to-host response behind the setup packet.
fn respond(mut urb: Urb, setup: &SetupPacket, data: &[u8]) -> Disposition {
    let room = urb.data.len().saturating_sub(SETUP_LEN).min(usize::from(setup.length));
    let n = data.len().min(room);
    urb.data[SETUP_LEN..SETUP_LEN + n].copy_from_slice(&data[..n]);
    urb.len = SETUP_LEN + n;
    Disposition::Complete(urb)
}

impl Inner {
    pub fn control(&mut self, urb: Urb) -> Disposition {
        // A control pipe stall only lasts until the next setup packet.
        if let Some(idx) = halt_index(EP_CONTROL) {
            self.halted[idx] = false;
        }

        let Some(setup) = SetupPacket::parse(urb.payload()) else {
            self.complain(
                Complaint::UnsupportedRequest,
                format_args!("control transfer {} without setup packet", urb.id),
            );
            return Disposition::Stall(urb, Halt::Endpoint(EP_CONTROL));
        };
        tracing::trace!(location = %self.location, "control request {setup:?}");

        match setup.kind() {
            SetupPacket::TYPE_CLASS => self.class_request(urb, setup),
            SetupPacket::TYPE_STANDARD => self.standard_request(urb, setup),
            _ => self.unsupported(urb, setup),
        }
    }

    fn unsupported(&mut self, urb: Urb, setup: SetupPacket) -> Disposition {
        self.complain(Complaint::UnsupportedRequest, format_args!("unsupported control request {setup:?}"));
        Disposition::Stall(urb, Halt::Endpoint(EP_CONTROL))
    }

    fn class_request(&mut self, urb: Urb, setup: SetupPacket) -> Disposition {
        match (setup.request_type, setup.request) {
            (CLASS_INTERFACE_OUT, REQ_BULK_ONLY_RESET) if setup.value == 0 && setup.length == 0 => {
                tracing::debug!(location = %self.location, "Bulk-Only Mass Storage Reset");
                self.bulk_only_reset(urb)
            }
            (CLASS_INTERFACE_IN, REQ_GET_MAX_LUN) if setup.value == 0 && setup.length >= 1 => {
                respond(urb, &setup, &[0])
            }
            _ => self.unsupported(urb, setup),
        }
    }

    fn standard_request(&mut self, urb: Urb, setup: SetupPacket) -> Disposition {
        let endpoint = setup.index as u8;
        match (setup.request, setup.recipient()) {
            (REQ_GET_STATUS, SetupPacket::RECIPIENT_DEVICE | SetupPacket::RECIPIENT_INTERFACE) => {
                respond(urb, &setup, &[0, 0])
            }
            (REQ_GET_STATUS, SetupPacket::RECIPIENT_ENDPOINT) => match halt_index(endpoint) {
                Some(idx) => {
                    let status = [u8::from(self.halted[idx]), 0];
                    respond(urb, &setup, &status)
                }
                None => self.unsupported(urb, setup),
            },
            (REQ_CLEAR_FEATURE | REQ_SET_FEATURE, SetupPacket::RECIPIENT_ENDPOINT)
                if setup.value == FEATURE_ENDPOINT_HALT =>
            {
                let Some(idx) = halt_index(endpoint) else { return self.unsupported(urb, setup) };
                let halt = setup.request == REQ_SET_FEATURE;
                tracing::debug!(location = %self.location, "endpoint {endpoint:#04x} halted: {halt}");
                self.halted[idx] = halt;
                Disposition::Complete(urb)
            }
            (REQ_CLEAR_FEATURE | REQ_SET_FEATURE, SetupPacket::RECIPIENT_DEVICE)
                if setup.value == FEATURE_REMOTE_WAKEUP =>
            {
                Disposition::Complete(urb)
            }
            (REQ_GET_DESCRIPTOR, SetupPacket::RECIPIENT_DEVICE) => {
                let [index, kind] = setup.value.to_le_bytes();
                match self.descriptors.as_ref().and_then(|cache| cache.descriptor(kind, index, setup.index)) {
                    Some(desc) => respond(urb, &setup, &desc),
                    None => self.unsupported(urb, setup),
                }
            }
            (REQ_GET_CONFIGURATION, SetupPacket::RECIPIENT_DEVICE) => {
                let configuration = [self.configuration];
                respond(urb, &setup, &configuration)
            }
            (REQ_SET_CONFIGURATION, SetupPacket::RECIPIENT_DEVICE) => {
                let value = setup.value as u8;
                if value == self.configuration {
                    // Selecting the active configuration again acts as a reset.
                    Disposition::Reconfigure(urb, value)
                } else {
                    tracing::debug!(location = %self.location, "configuration {value}");
                    self.configuration = value;
                    Disposition::Complete(urb)
                }
            }
            (REQ_GET_INTERFACE, SetupPacket::RECIPIENT_INTERFACE) => respond(urb, &setup, &[0]),
            (REQ_SET_INTERFACE, SetupPacket::RECIPIENT_INTERFACE) if setup.value == 0 => {
                Disposition::Complete(urb)
            }
            _ => self.unsupported(urb, setup),
        }
    }
}
