//! Bulk-Only Transport wire structures.
//!
//! Both wrappers are little-endian and packed. A [`Cbw`] is copied out of the
//! transfer buffer on receipt; nothing keeps a reference into the URB.

use bytes::{Buf, BufMut};

use crate::Direction;

/// Signature of a command block wrapper (`USBC`).
pub const CBW_SIGNATURE: u32 = 0x4342_5355;

/// Signature of a command status wrapper (`USBS`).
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Size of a complete command block wrapper.
pub const CBW_LEN: usize = 31;

/// Size of the command block wrapper without the command block.
pub const CBW_HEADER_LEN: usize = 15;

/// Size of a command status wrapper.
pub const CSW_LEN: usize = 13;

/// Maximum length of a SCSI command block inside a CBW.
pub const CB_MAX_LEN: usize = 16;

const CBW_FLAG_IN: u8 = 0x80;
const CBW_LUN_MASK: u8 = 0x1f;

/// Reasons for rejecting a command block wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CbwError {
    /// Transfer is too short or too long to hold a CBW.
    #[error("CBW transfer of {0} bytes has invalid size")]
    Size(usize),
    /// Signature mismatch.
    #[error("bad CBW signature {0:#010x}")]
    Signature(u32),
    /// A LUN other than 0 was addressed.
    #[error("CBW addresses unsupported LUN {0}")]
    Lun(u8),
    /// Command block length outside 1..=16.
    #[error("invalid command block length {0}")]
    CommandLength(u8),
}

/// Command block wrapper, received on the bulk-out pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cbw {
    /// Tag echoed back in the matching [`Csw`].
    pub tag: u32,
    /// Number of bytes the host expects to transfer in the data phase.
    pub data_transfer_length: u32,
    /// Bit 7 selects the data direction (set = device to host).
    pub flags: u8,
    /// Logical unit number.
    pub lun: u8,
    /// Number of significant bytes in `cb`.
    pub cb_length: u8,
    /// Command block.
    pub cb: [u8; CB_MAX_LEN],
}

impl Cbw {
    /// Creates a command block wrapper for LUN 0.
    ///
    /// # Panics
    /// Panics if `cdb` is empty or longer than [`CB_MAX_LEN`].
    pub fn new(tag: u32, data_transfer_length: u32, direction: Direction, cdb: &[u8]) -> Self {
        assert!(!cdb.is_empty() && cdb.len() <= CB_MAX_LEN, "invalid command block length");
        let mut cb = [0; CB_MAX_LEN];
        cb[..cdb.len()].copy_from_slice(cdb);
        let flags = match direction {
            Direction::In => CBW_FLAG_IN,
            Direction::Out => 0,
        };
        Self { tag, data_transfer_length, flags, lun: 0, cb_length: cdb.len() as u8, cb }
    }

    /// Parses and validates a command block wrapper.
    ///
    /// Hosts may omit trailing unused command block bytes, so any transfer that
    /// covers the significant part of the command block is accepted.
    pub fn parse(data: &[u8]) -> Result<Self, CbwError> {
        if data.len() <= CBW_HEADER_LEN || data.len() > CBW_LEN {
            return Err(CbwError::Size(data.len()));
        }

        let mut buf = data;
        let signature = buf.get_u32_le();
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }

        let tag = buf.get_u32_le();
        let data_transfer_length = buf.get_u32_le();
        let flags = buf.get_u8();
        let lun = buf.get_u8();
        let cb_length = buf.get_u8();

        if lun & CBW_LUN_MASK != 0 {
            return Err(CbwError::Lun(lun & CBW_LUN_MASK));
        }
        if cb_length == 0 || usize::from(cb_length) > CB_MAX_LEN {
            return Err(CbwError::CommandLength(cb_length));
        }
        if buf.remaining() < usize::from(cb_length) {
            return Err(CbwError::Size(data.len()));
        }

        let mut cb = [0; CB_MAX_LEN];
        let n = buf.remaining();
        buf.copy_to_slice(&mut cb[..n]);
        cb[usize::from(cb_length)..].fill(0);

        Ok(Self { tag, data_transfer_length, flags, lun, cb_length, cb })
    }

    /// Encodes the wrapper.
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut out = [0; CBW_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_le(CBW_SIGNATURE);
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.data_transfer_length);
        buf.put_u8(self.flags);
        buf.put_u8(self.lun);
        buf.put_u8(self.cb_length);
        buf.put_slice(&self.cb);
        out
    }

    /// Direction of the data phase.
    pub fn direction(&self) -> Direction {
        if self.flags & CBW_FLAG_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Significant part of the command block.
    pub fn cdb(&self) -> &[u8] {
        &self.cb[..usize::from(self.cb_length).min(CB_MAX_LEN)]
    }

    /// SCSI operation code.
    pub fn opcode(&self) -> u8 {
        self.cb[0]
    }
}

/// Status byte of a command status wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CswStatus {
    /// Command passed.
    #[default]
    Ok = 0,
    /// Command failed, sense data is available.
    Failed = 1,
    /// Phase error, host must reset the device.
    PhaseError = 2,
}

impl TryFrom<u8> for CswStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Failed),
            2 => Ok(Self::PhaseError),
            other => Err(other),
        }
    }
}

/// Command status wrapper, sent on the bulk-in pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csw {
    /// Tag of the originating CBW.
    pub tag: u32,
    /// Bytes requested by the host but not transferred.
    pub data_residue: u32,
    /// Command status.
    pub status: CswStatus,
}

impl Csw {
    /// Encodes the wrapper.
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut out = [0; CSW_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_le(CSW_SIGNATURE);
        buf.put_u32_le(self.tag);
        buf.put_u32_le(self.data_residue);
        buf.put_u8(self.status as u8);
        out
    }

    /// Decodes a wrapper as seen by the host.
    ///
    /// Returns `None` if the size, signature or status byte is invalid.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != CSW_LEN {
            return None;
        }

        let mut buf = data;
        if buf.get_u32_le() != CSW_SIGNATURE {
            return None;
        }
        let tag = buf.get_u32_le();
        let data_residue = buf.get_u32_le();
        let status = CswStatus::try_from(buf.get_u8()).ok()?;
        Some(Self { tag, data_residue, status })
    }
}
