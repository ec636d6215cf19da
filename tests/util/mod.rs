#![allow(dead_code)]

use rand::prelude::*;
use rand_xoshiro::Xoshiro128StarStar;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    thread,
    time::Duration,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usb_msd_bot::{
    sense,
    wire::{Cbw, Csw, CSW_LEN},
    Direction, MsdConfig, MsdDevice, Outcome, ScsiBackend, ScsiCommand, ScsiOutcome, SetupPacket, Urb, UrbId,
    UrbStatus, EP_BULK_IN, EP_BULK_OUT, EP_CONTROL,
};

pub const REAP_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEED: u64 = 12523;
pub const BLOCK_SIZE: usize = 512;

pub const OP_TEST_UNIT_READY: u8 = 0x00;
pub const OP_READ_10: u8 = 0x28;
pub const OP_WRITE_10: u8 = 0x2a;

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

pub fn read_10(lba: u32, blocks: u16) -> [u8; 10] {
    let [a, b, c, d] = lba.to_be_bytes();
    let [hi, lo] = blocks.to_be_bytes();
    [OP_READ_10, 0, a, b, c, d, 0, hi, lo, 0]
}

pub fn write_10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read_10(lba, blocks);
    cdb[0] = OP_WRITE_10;
    cdb
}

pub fn request_sense(allocation: u8) -> [u8; 6] {
    [sense::OP_REQUEST_SENSE, 0, 0, 0, allocation, 0]
}

pub struct TestData {
    rng: Xoshiro128StarStar,
}

impl TestData {
    pub fn new(seed: u64) -> Self {
        Self { rng: Xoshiro128StarStar::seed_from_u64(seed) }
    }

    pub fn generate(&mut self, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.rng.fill_bytes(&mut data);
        data
    }
}

/// Backend that keeps submitted commands until the test completes them.
#[derive(Default)]
pub struct MockScsi {
    commands: Mutex<VecDeque<ScsiCommand>>,
    submitted: AtomicUsize,
}

impl MockScsi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> ScsiCommand {
        self.commands.lock().unwrap().pop_front().expect("no SCSI command submitted")
    }

    pub fn pending(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl ScsiBackend for MockScsi {
    fn submit(&self, command: ScsiCommand) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push_back(command);
    }

    fn location(&self) -> String {
        "mock:0:0".into()
    }
}

/// Backend that drops every command without completing it.
pub struct DroppingScsi;

impl ScsiBackend for DroppingScsi {
    fn submit(&self, command: ScsiCommand) {
        drop(command);
    }
}

/// In-memory disk executing commands on worker threads.
pub struct RamDisk {
    blocks: Arc<Mutex<Vec<u8>>>,
}

impl RamDisk {
    pub fn new(block_count: usize) -> Arc<Self> {
        Arc::new(Self { blocks: Arc::new(Mutex::new(vec![0; block_count * BLOCK_SIZE])) })
    }

    fn execute(blocks: &Mutex<Vec<u8>>, command: &mut ScsiCommand) -> ScsiOutcome {
        let cdb = command.cdb().to_vec();
        match cdb[0] {
            OP_TEST_UNIT_READY => ScsiOutcome::good(0),
            OP_READ_10 | OP_WRITE_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                let start = lba * BLOCK_SIZE;
                let len = (count * BLOCK_SIZE).min(command.transfer_len() as usize);

                let mut disk = blocks.lock().unwrap();
                if start + len > disk.len() {
                    *command.sense_mut() = sense::fixed(sense::KEY_ILLEGAL_REQUEST, 0x21, 0);
                    return ScsiOutcome::check_condition(0);
                }
                if cdb[0] == OP_READ_10 {
                    command.data_mut()[..len].copy_from_slice(&disk[start..start + len]);
                } else {
                    disk[start..start + len].copy_from_slice(&command.data()[..len]);
                }
                ScsiOutcome::good(len as u32)
            }
            _ => {
                *command.sense_mut() = sense::fixed(sense::KEY_ILLEGAL_REQUEST, 0x20, 0);
                ScsiOutcome::check_condition(0)
            }
        }
    }
}

impl ScsiBackend for RamDisk {
    fn submit(&self, mut command: ScsiCommand) {
        let blocks = self.blocks.clone();
        thread::spawn(move || {
            let outcome = Self::execute(&blocks, &mut command);
            command.complete(outcome);
        });
    }

    fn location(&self) -> String {
        "ramdisk:0:0".into()
    }
}

/// Plays the USB host side against a device.
pub struct Host {
    pub dev: MsdDevice,
    next_id: u64,
}

impl Host {
    pub fn new(backend: Arc<dyn ScsiBackend>) -> Self {
        Self::with_config(backend, MsdConfig::default())
    }

    pub fn with_config(backend: Arc<dyn ScsiBackend>, config: MsdConfig) -> Self {
        init_log();
        Self { dev: MsdDevice::new(backend, config), next_id: 1 }
    }

    pub fn id(&mut self) -> UrbId {
        let id = UrbId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn reap(&self) -> Urb {
        self.dev.reap(Some(REAP_TIMEOUT)).unwrap().expect("no URB completed")
    }

    pub fn assert_nothing_done(&self) {
        let urb = self.dev.reap(None).unwrap();
        assert!(urb.is_none(), "unexpected completion: {urb:?}");
    }

    pub fn send_out(&mut self, data: Vec<u8>) -> Outcome {
        let urb = Urb::bulk_out(self.id(), data);
        self.dev.dispatch(EP_BULK_OUT, urb).unwrap()
    }

    /// Sends data on the bulk-out pipe and returns the completed URB.
    pub fn write(&mut self, data: Vec<u8>) -> Urb {
        self.send_out(data);
        self.reap()
    }

    pub fn cbw(&mut self, cbw: &Cbw) -> Urb {
        let urb = self.write(cbw.to_bytes().to_vec());
        assert_eq!(urb.status, UrbStatus::Ok, "CBW rejected");
        urb
    }

    pub fn send_in(&mut self, len: usize, short_not_ok: bool) -> (UrbId, Outcome) {
        let id = self.id();
        let urb = Urb::bulk_in(id, len).with_short_not_ok(short_not_ok);
        (id, self.dev.dispatch(EP_BULK_IN, urb).unwrap())
    }

    /// Reads from the bulk-in pipe and returns the completed URB.
    pub fn read(&mut self, len: usize) -> Urb {
        self.send_in(len, false);
        self.reap()
    }

    pub fn csw(&mut self) -> Csw {
        let urb = self.read(CSW_LEN);
        assert_eq!(urb.status, UrbStatus::Ok, "status read failed");
        Csw::parse(urb.payload()).expect("invalid CSW")
    }

    pub fn control(&mut self, setup: SetupPacket, payload: &[u8]) -> Urb {
        let urb = Urb::control(self.id(), setup, payload);
        self.dev.dispatch(EP_CONTROL, urb).unwrap();
        self.reap()
    }

    pub fn send_bulk_only_reset(&mut self) -> (UrbId, Outcome) {
        let id = self.id();
        let urb = Urb::control(id, SetupPacket::new(0x21, 0xff, 0, 0, 0), &[]);
        (id, self.dev.dispatch(EP_CONTROL, urb).unwrap())
    }

    /// Runs a complete read command and returns data and status.
    pub fn read_command(&mut self, tag: u32, cdb: &[u8], len: u32) -> (Vec<u8>, Csw) {
        self.cbw(&Cbw::new(tag, len, Direction::In, cdb));
        let data = if len > 0 { self.read(len as usize).payload().to_vec() } else { Vec::new() };
        (data, self.csw())
    }

    /// Runs a complete write command and returns the status.
    pub fn write_command(&mut self, tag: u32, cdb: &[u8], data: Vec<u8>) -> Csw {
        self.cbw(&Cbw::new(tag, data.len() as u32, Direction::Out, cdb));
        if !data.is_empty() {
            let urb = self.write(data);
            assert_eq!(urb.status, UrbStatus::Ok, "data-out rejected");
        }
        self.csw()
    }
}
