mod util;

use std::{sync::Arc, time::Duration};

use usb_msd_bot::{
    wire::{Cbw, Csw, CswStatus},
    DescriptorCache, Direction, MsdConfig, Outcome, RequestState, ScsiOutcome, SetupPacket, Urb, UrbStatus,
    EP_BULK_IN, EP_BULK_OUT, EP_CONTROL,
};
use util::*;

const DEVICE_DESCRIPTOR: [u8; 18] =
    [18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1];

struct Descriptors;

impl DescriptorCache for Descriptors {
    fn descriptor(&self, kind: u8, index: u8, _language: u16) -> Option<Vec<u8>> {
        match (kind, index) {
            (1, 0) => Some(DEVICE_DESCRIPTOR.to_vec()),
            _ => None,
        }
    }
}

#[test]
fn get_max_lun() {
    let mut host = Host::new(MockScsi::new());

    let urb = host.control(SetupPacket::new(0xa1, 0xfe, 0, 0, 1), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert_eq!(urb.control_response(), &[0]);

    // Malformed variants are refused.
    let urb = host.control(SetupPacket::new(0xa1, 0xfe, 1, 0, 1), &[]);
    assert_eq!(urb.status, UrbStatus::Stall);
    let urb = host.control(SetupPacket::new(0x21, 0xff, 0, 0, 4), &[0; 4]);
    assert_eq!(urb.status, UrbStatus::Stall);
}

#[test]
fn endpoint_halt() {
    let mut host = Host::new(MockScsi::new());

    assert_eq!(host.read(13).status, UrbStatus::Stall);
    let urb = host.control(SetupPacket::new(0x82, 0x00, 0, u16::from(EP_BULK_IN), 2), &[]);
    assert_eq!(urb.control_response(), &[1, 0]);
    let urb = host.control(SetupPacket::new(0x82, 0x00, 0, u16::from(EP_BULK_OUT), 2), &[]);
    assert_eq!(urb.control_response(), &[0, 0]);

    let urb = host.control(SetupPacket::new(0x02, 0x01, 0, u16::from(EP_BULK_IN), 0), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert!(!host.dev.is_halted(EP_BULK_IN).unwrap());

    let urb = host.control(SetupPacket::new(0x02, 0x03, 0, u16::from(EP_BULK_OUT), 0), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert!(host.dev.is_halted(EP_BULK_OUT).unwrap());
}

#[test]
fn get_descriptor() {
    let mut host = Host::new(MockScsi::new());

    // Without a cache there is nothing to answer with.
    let urb = host.control(SetupPacket::new(0x80, 0x06, 0x0100, 0, 18), &[]);
    assert_eq!(urb.status, UrbStatus::Stall);

    host.dev.set_descriptor_cache(Arc::new(Descriptors)).unwrap();
    let urb = host.control(SetupPacket::new(0x80, 0x06, 0x0100, 0, 18), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert_eq!(urb.control_response(), &DEVICE_DESCRIPTOR);

    // Truncated to the requested length.
    let urb = host.control(SetupPacket::new(0x80, 0x06, 0x0100, 0, 8), &[]);
    assert_eq!(urb.control_response(), &DEVICE_DESCRIPTOR[..8]);

    let urb = host.control(SetupPacket::new(0x80, 0x06, 0x0300, 0, 255), &[]);
    assert_eq!(urb.status, UrbStatus::Stall);
}

#[test]
fn configuration_requests() {
    let scsi = MockScsi::new();
    let mut host = Host::new(scsi.clone());

    let urb = host.control(SetupPacket::new(0x00, 0x09, 1, 0, 0), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    let urb = host.control(SetupPacket::new(0x80, 0x08, 0, 0, 1), &[]);
    assert_eq!(urb.control_response(), &[1]);
    assert_eq!(host.dev.stats().unwrap().resets, 0);

    // Selecting the same configuration during a data phase resets the transport.
    host.cbw(&Cbw::new(1, 1024, Direction::Out, &write_10(0, 2)));
    host.write(vec![0; 512]);
    let urb = host.control(SetupPacket::new(0x00, 0x09, 1, 0, 0), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert_eq!(host.dev.stats().unwrap().resets, 1);
    assert_eq!(host.dev.configuration().unwrap(), 1);

    assert_eq!(scsi.submitted(), 0);

    host.cbw(&Cbw::new(2, 0, Direction::Out, &[OP_TEST_UNIT_READY; 6]));
    scsi.take().complete(ScsiOutcome::good(0));
    assert_eq!(host.csw(), Csw { tag: 2, data_residue: 0, status: CswStatus::Ok });
}

#[test]
fn interface_requests() {
    let mut host = Host::new(MockScsi::new());

    let urb = host.control(SetupPacket::new(0x81, 0x0a, 0, 0, 1), &[]);
    assert_eq!(urb.control_response(), &[0]);
    assert_eq!(host.control(SetupPacket::new(0x01, 0x0b, 0, 0, 0), &[]).status, UrbStatus::Ok);
    assert_eq!(host.control(SetupPacket::new(0x01, 0x0b, 1, 0, 0), &[]).status, UrbStatus::Stall);
}

#[test]
fn unsupported_request_stalls_until_next_setup() {
    let mut host = Host::new(MockScsi::new());

    let urb = host.control(SetupPacket::new(0x40, 0x42, 0, 0, 0), &[]);
    assert_eq!(urb.status, UrbStatus::Stall);
    assert!(host.dev.is_halted(0x00).unwrap());

    let urb = host.control(SetupPacket::new(0x80, 0x00, 0, 0, 2), &[]);
    assert_eq!(urb.status, UrbStatus::Ok);
    assert_eq!(urb.control_response(), &[0, 0]);
    assert!(!host.dev.is_halted(0x00).unwrap());
}

#[test]
fn unknown_endpoint_stalls_without_halt() {
    let mut host = Host::new(MockScsi::new());

    let id = host.id();
    let outcome = host.dev.dispatch(0x83, Urb::bulk_in(id, 64)).unwrap();
    assert_eq!(outcome, Outcome::Stalled);
    let urb = host.reap();
    assert_eq!((urb.id, urb.status), (id, UrbStatus::Stall));

    for endpoint in [EP_CONTROL, EP_BULK_IN, EP_BULK_OUT, 0x83] {
        assert!(!host.dev.is_halted(endpoint).unwrap());
    }
}

#[test]
fn same_configuration_while_executing() {
    let scsi = MockScsi::new();
    let mut host =
        Host::with_config(scsi.clone(), MsdConfig::default().with_reset_timeout(Duration::from_millis(20)));

    host.control(SetupPacket::new(0x00, 0x09, 1, 0, 0), &[]);
    host.cbw(&Cbw::new(3, 512, Direction::In, &read_10(0, 1)));
    let (parked, _) = host.send_in(512, false);
    let stuck = scsi.take();

    // Blocks for the reset timeout, then abandons the command.
    let id = host.id();
    let urb = Urb::control(id, SetupPacket::new(0x00, 0x09, 1, 0, 0), &[]);
    let outcome = host.dev.dispatch(EP_CONTROL, urb).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let urb = host.reap();
    assert_eq!((urb.id, urb.status), (parked, UrbStatus::TransportError));
    let urb = host.reap();
    assert_eq!((urb.id, urb.status), (id, UrbStatus::Ok));

    assert_eq!(host.dev.configuration().unwrap(), 1);
    let stats = host.dev.stats().unwrap();
    assert_eq!((stats.resets, stats.abandoned), (1, 1));
    assert!(matches!(host.dev.state().unwrap(), None | Some(RequestState::Ready)));

    stuck.complete(ScsiOutcome::good(512));
    assert_eq!(host.dev.stats().unwrap().reclaimed, 1);

    host.cbw(&Cbw::new(4, 0, Direction::Out, &[OP_TEST_UNIT_READY; 6]));
    scsi.take().complete(ScsiOutcome::good(0));
    assert_eq!(host.csw(), Csw { tag: 4, data_residue: 0, status: CswStatus::Ok });
}
