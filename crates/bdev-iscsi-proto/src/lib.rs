#![no_std]

use core::{convert::TryFrom, fmt};

/// VPD page code for the Block Limits page.
pub const INQUIRY_PAGE_BLOCK_LIMITS: u8 = 0xB0;
/// VPD page code for the Logical Block Provisioning page.
pub const INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING: u8 = 0xB2;
/// Allocation length requested for VPD inquiries.
pub const INQUIRY_ALLOC_LEN: u16 = 255;
/// Number of bytes in READ CAPACITY(16) parameter data.
pub const READ_CAPACITY16_LEN: usize = 32;
/// Bytes of READ CAPACITY(16) data that carry fields we decode.
pub const READ_CAPACITY16_MIN_LEN: usize = 16;
/// Number of bytes in an encoded Block Limits VPD page.
pub const BLOCK_LIMITS_LEN: usize = 64;
/// Bytes of the Block Limits page that must be present to decode it.
pub const BLOCK_LIMITS_MIN_LEN: usize = 32;
/// Number of bytes in an encoded Logical Block Provisioning VPD page.
pub const LBP_LEN: usize = 8;
/// Number of bytes in one UNMAP block descriptor.
pub const UNMAP_DESCRIPTOR_LEN: usize = 16;
/// Number of bytes in fixed-format sense data emitted by [`Sense::encode_fixed`].
pub const FIXED_SENSE_LEN: usize = 18;
/// ASC/ASCQ pair reported with UNIT ATTENTION when the LUN was resized.
pub const ASCQ_CAPACITY_DATA_HAS_CHANGED: u16 = 0x2a09;

/// Errors surfaced while decoding SCSI parameter data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer was shorter than the format requires.
    InvalidLength { expected: usize, actual: usize },
    /// VPD page code did not match the decoder.
    InvalidPageCode { expected: u8, actual: u8 },
    /// Sense response code is not one we understand.
    InvalidResponseCode(u8),
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid data length {actual}, expected at least {expected}")
            }
            ProtoError::InvalidPageCode { expected, actual } => {
                write!(f, "invalid VPD page code {actual:#04x}, expected {expected:#04x}")
            }
            ProtoError::InvalidResponseCode(code) => {
                write!(f, "invalid sense response code {code:#04x}")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

/// Result alias for decoding operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

fn ensure_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(ProtoError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// SCSI status byte returned with every command completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScsiStatus(u8);

impl ScsiStatus {
    pub const GOOD: Self = Self(0x00);
    pub const CHECK_CONDITION: Self = Self(0x02);
    pub const CONDITION_MET: Self = Self(0x04);
    pub const BUSY: Self = Self(0x08);
    pub const RESERVATION_CONFLICT: Self = Self(0x18);
    pub const TASK_SET_FULL: Self = Self(0x28);
    pub const ACA_ACTIVE: Self = Self(0x30);
    pub const TASK_ABORTED: Self = Self(0x40);

    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    pub const fn is_good(self) -> bool {
        self.0 == Self::GOOD.0
    }
}

impl From<u8> for ScsiStatus {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Display for ScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::GOOD => "GOOD",
            Self::CHECK_CONDITION => "CHECK CONDITION",
            Self::CONDITION_MET => "CONDITION MET",
            Self::BUSY => "BUSY",
            Self::RESERVATION_CONFLICT => "RESERVATION CONFLICT",
            Self::TASK_SET_FULL => "TASK SET FULL",
            Self::ACA_ACTIVE => "ACA ACTIVE",
            Self::TASK_ABORTED => "TASK ABORTED",
            _ => return write!(f, "status {:#04x}", self.0),
        };
        f.write_str(name)
    }
}

/// Sense key carried in sense data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    Obsolete = 0xC,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
    Completed = 0xF,
}

impl From<u8> for SenseKey {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::NoSense,
            0x1 => Self::RecoveredError,
            0x2 => Self::NotReady,
            0x3 => Self::MediumError,
            0x4 => Self::HardwareError,
            0x5 => Self::IllegalRequest,
            0x6 => Self::UnitAttention,
            0x7 => Self::DataProtect,
            0x8 => Self::BlankCheck,
            0x9 => Self::VendorSpecific,
            0xA => Self::CopyAborted,
            0xB => Self::AbortedCommand,
            0xC => Self::Obsolete,
            0xD => Self::VolumeOverflow,
            0xE => Self::Miscompare,
            _ => Self::Completed,
        }
    }
}

impl From<SenseKey> for u8 {
    fn from(key: SenseKey) -> Self {
        key as u8
    }
}

/// Decoded sense data: key plus additional sense code and qualifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Self = Self::new(SenseKey::NoSense, 0, 0);

    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Build sense from the combined `ASC << 8 | ASCQ` word.
    pub const fn from_ascq_word(key: SenseKey, word: u16) -> Self {
        Self {
            key,
            asc: (word >> 8) as u8,
            ascq: (word & 0xFF) as u8,
        }
    }

    pub const fn ascq_word(&self) -> u16 {
        ((self.asc as u16) << 8) | self.ascq as u16
    }

    /// UNIT ATTENTION / CAPACITY DATA HAS CHANGED.
    pub fn is_capacity_data_changed(&self) -> bool {
        self.key == SenseKey::UnitAttention && self.ascq_word() == ASCQ_CAPACITY_DATA_HAS_CHANGED
    }

    /// Parse fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 1)?;
        match bytes[0] & 0x7F {
            0x70 | 0x71 => {
                ensure_len(bytes, 14)?;
                Ok(Self::new(SenseKey::from(bytes[2]), bytes[12], bytes[13]))
            }
            0x72 | 0x73 => {
                ensure_len(bytes, 4)?;
                Ok(Self::new(SenseKey::from(bytes[1]), bytes[2], bytes[3]))
            }
            other => Err(ProtoError::InvalidResponseCode(other)),
        }
    }

    pub fn encode_fixed(&self) -> [u8; FIXED_SENSE_LEN] {
        let mut buf = [0u8; FIXED_SENSE_LEN];
        buf[0] = 0x70;
        buf[2] = self.key as u8;
        buf[7] = (FIXED_SENSE_LEN - 8) as u8;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

impl Default for Sense {
    fn default() -> Self {
        Self::NONE
    }
}

/// READ CAPACITY(16) parameter data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadCapacity16 {
    /// Address of the last logical block.
    pub returned_lba: u64,
    pub block_length: u32,
    pub prot_en: bool,
    pub p_type: u8,
    /// Logical blocks per physical block exponent.
    pub lbppbe: u8,
    pub lbpme: bool,
    pub lbprz: bool,
    pub lowest_aligned_lba: u16,
}

impl ReadCapacity16 {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, READ_CAPACITY16_MIN_LEN)?;
        let block_length = be_u32(bytes, 8);
        if block_length == 0 {
            return Err(ProtoError::InvalidValue("block_length"));
        }
        Ok(Self {
            returned_lba: be_u64(bytes, 0),
            block_length,
            prot_en: bytes[12] & 0x01 != 0,
            p_type: (bytes[12] >> 1) & 0x07,
            lbppbe: bytes[13] & 0x0F,
            lbpme: bytes[14] & 0x80 != 0,
            lbprz: bytes[14] & 0x40 != 0,
            lowest_aligned_lba: be_u16(bytes, 14) & 0x3FFF,
        })
    }

    pub fn encode(&self) -> [u8; READ_CAPACITY16_LEN] {
        let mut buf = [0u8; READ_CAPACITY16_LEN];
        buf[0..8].copy_from_slice(&self.returned_lba.to_be_bytes());
        buf[8..12].copy_from_slice(&self.block_length.to_be_bytes());
        buf[12] = (self.p_type & 0x07) << 1 | self.prot_en as u8;
        buf[13] = self.lbppbe & 0x0F;
        let aligned = (self.lowest_aligned_lba & 0x3FFF).to_be_bytes();
        buf[14] = aligned[0] | (self.lbpme as u8) << 7 | (self.lbprz as u8) << 6;
        buf[15] = aligned[1];
        buf
    }

    /// Number of addressable blocks, `None` when the LBA space would overflow.
    pub fn num_blocks(&self) -> Option<u64> {
        self.returned_lba.checked_add(1)
    }

    pub fn physical_block_length(&self) -> Option<u32> {
        1u32.checked_shl(self.lbppbe as u32)
            .and_then(|factor| self.block_length.checked_mul(factor))
    }
}

/// Block Limits VPD page (0xB0).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InquiryBlockLimits {
    pub max_transfer_length: u32,
    pub optimal_transfer_length: u32,
    /// Maximum number of LBAs a single UNMAP may cover. Zero means unreported.
    pub max_unmap: u32,
    /// Maximum number of UNMAP block descriptors per command.
    pub max_unmap_bdc: u32,
    pub opt_unmap_gran: u32,
}

impl InquiryBlockLimits {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, BLOCK_LIMITS_MIN_LEN)?;
        if bytes[1] != INQUIRY_PAGE_BLOCK_LIMITS {
            return Err(ProtoError::InvalidPageCode {
                expected: INQUIRY_PAGE_BLOCK_LIMITS,
                actual: bytes[1],
            });
        }
        Ok(Self {
            max_transfer_length: be_u32(bytes, 8),
            optimal_transfer_length: be_u32(bytes, 12),
            max_unmap: be_u32(bytes, 20),
            max_unmap_bdc: be_u32(bytes, 24),
            opt_unmap_gran: be_u32(bytes, 28),
        })
    }

    pub fn encode(&self) -> [u8; BLOCK_LIMITS_LEN] {
        let mut buf = [0u8; BLOCK_LIMITS_LEN];
        buf[1] = INQUIRY_PAGE_BLOCK_LIMITS;
        buf[2..4].copy_from_slice(&((BLOCK_LIMITS_LEN - 4) as u16).to_be_bytes());
        buf[8..12].copy_from_slice(&self.max_transfer_length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.optimal_transfer_length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.max_unmap.to_be_bytes());
        buf[24..28].copy_from_slice(&self.max_unmap_bdc.to_be_bytes());
        buf[28..32].copy_from_slice(&self.opt_unmap_gran.to_be_bytes());
        buf
    }
}

/// Logical Block Provisioning VPD page (0xB2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InquiryLogicalBlockProvisioning {
    pub threshold_exponent: u8,
    /// UNMAP supported.
    pub lbpu: bool,
    pub lbpws: bool,
    pub lbpws10: bool,
    pub lbprz: bool,
    pub anc_sup: bool,
    pub dp: bool,
    pub provisioning_type: u8,
}

impl InquiryLogicalBlockProvisioning {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, LBP_LEN)?;
        if bytes[1] != INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING {
            return Err(ProtoError::InvalidPageCode {
                expected: INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING,
                actual: bytes[1],
            });
        }
        let flags = bytes[5];
        Ok(Self {
            threshold_exponent: bytes[4],
            lbpu: flags & 0x80 != 0,
            lbpws: flags & 0x40 != 0,
            lbpws10: flags & 0x20 != 0,
            lbprz: flags & 0x04 != 0,
            anc_sup: flags & 0x02 != 0,
            dp: flags & 0x01 != 0,
            provisioning_type: bytes[6] & 0x07,
        })
    }

    pub fn encode(&self) -> [u8; LBP_LEN] {
        let mut buf = [0u8; LBP_LEN];
        buf[1] = INQUIRY_PAGE_LOGICAL_BLOCK_PROVISIONING;
        buf[2..4].copy_from_slice(&((LBP_LEN - 4) as u16).to_be_bytes());
        buf[4] = self.threshold_exponent;
        buf[5] = (self.lbpu as u8) << 7
            | (self.lbpws as u8) << 6
            | (self.lbpws10 as u8) << 5
            | (self.lbprz as u8) << 2
            | (self.anc_sup as u8) << 1
            | self.dp as u8;
        buf[6] = self.provisioning_type & 0x07;
        buf
    }
}

/// One LBA range in an UNMAP parameter list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnmapDescriptor {
    pub lba: u64,
    pub num_blocks: u32,
}

impl UnmapDescriptor {
    pub const fn new(lba: u64, num_blocks: u32) -> Self {
        Self { lba, num_blocks }
    }

    pub fn encode(&self) -> [u8; UNMAP_DESCRIPTOR_LEN] {
        let mut buf = [0u8; UNMAP_DESCRIPTOR_LEN];
        buf[0..8].copy_from_slice(&self.lba.to_be_bytes());
        buf[8..12].copy_from_slice(&self.num_blocks.to_be_bytes());
        buf
    }
}

/// iSCSI task management function response codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TmfResponse {
    Complete = 0,
    TaskDoesNotExist = 1,
    LunDoesNotExist = 2,
    TaskStillAllegiant = 3,
    ReassignmentNotSupported = 4,
    NotSupported = 5,
    AuthorizationFailed = 6,
    Rejected = 255,
}

impl TryFrom<u32> for TmfResponse {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Complete),
            1 => Ok(Self::TaskDoesNotExist),
            2 => Ok(Self::LunDoesNotExist),
            3 => Ok(Self::TaskStillAllegiant),
            4 => Ok(Self::ReassignmentNotSupported),
            5 => Ok(Self::NotSupported),
            6 => Ok(Self::AuthorizationFailed),
            255 => Ok(Self::Rejected),
            _ => Err(ProtoError::InvalidValue("tmf response")),
        }
    }
}
