#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical device block size. The on-disk layout (inode table slots,
/// log header capacity, directory blocks) is defined in terms of this.
pub const BLOCK_SIZE: u32 = 4096;

/// Shift corresponding to [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;

/// On-disk inode record size. Eight records per block.
pub const INODE_RECORD_SIZE: usize = 512;

/// Inodes stored per inode-table block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_RECORD_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Logical allocator partition index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// A contiguous run of blocks `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub count: u64,
}

impl BlockRange {
    #[must_use]
    pub fn new(start: BlockNumber, count: u64) -> Self {
        Self { start, count }
    }

    /// Last block in the range (inclusive). Undefined for empty ranges.
    #[must_use]
    pub fn last(&self) -> BlockNumber {
        BlockNumber(self.start.0 + self.count.saturating_sub(1))
    }

    /// One-past-the-end block number.
    #[must_use]
    pub fn end(&self) -> BlockNumber {
        BlockNumber(self.start.0 + self.count)
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 >= self.start.0 && block.0 < self.start.0 + self.count
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockNumber> + use<> {
        (self.start.0..self.start.0 + self.count).map(BlockNumber)
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the canonical block size.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(u64::from(BLOCK_SIZE))
    }
}

impl InodeNumber {
    /// The root directory inode.
    pub const ROOT: Self = Self(1);
}

/// File type stored in the inode record's `itype` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InodeType {
    /// Free inode-table slot.
    None = 0,
    Dir = 1,
    File = 2,
    Dev = 3,
}

impl InodeType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::Dir,
            2 => Self::File,
            3 => Self::Dev,
            _ => Self::None,
        }
    }
}

/// Second/nanosecond timestamp as persisted in inode records and log
/// headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    #[must_use]
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Number of blocks needed to hold `bytes` bytes.
#[must_use]
pub fn blocks_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(BLOCK_SIZE))
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.start, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let bytes = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&bytes, 0),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
        assert!(read_le_u16(&bytes, 3).is_err());
    }

    #[test]
    fn test_block_range() {
        let r = BlockRange::new(BlockNumber(10), 5);
        assert_eq!(r.last(), BlockNumber(14));
        assert_eq!(r.end(), BlockNumber(15));
        assert!(r.contains(BlockNumber(10)));
        assert!(r.contains(BlockNumber(14)));
        assert!(!r.contains(BlockNumber(15)));
        assert_eq!(r.iter().count(), 5);
    }

    #[test]
    fn test_inode_type_round_trip() {
        for t in [InodeType::None, InodeType::Dir, InodeType::File, InodeType::Dev] {
            assert_eq!(InodeType::from_raw(t as u8), t);
        }
        assert_eq!(InodeType::from_raw(200), InodeType::None);
    }

    #[test]
    fn test_blocks_for_bytes() {
        assert_eq!(blocks_for_bytes(0), 0);
        assert_eq!(blocks_for_bytes(1), 1);
        assert_eq!(blocks_for_bytes(u64::from(BLOCK_SIZE)), 1);
        assert_eq!(blocks_for_bytes(u64::from(BLOCK_SIZE) + 1), 2);
    }

    #[test]
    fn test_block_number_checked_ops() {
        assert_eq!(BlockNumber(10).checked_add(5), Some(BlockNumber(15)));
        assert_eq!(BlockNumber(u64::MAX).checked_add(1), None);
        assert_eq!(BlockNumber(2).to_byte_offset(), Some(8192));
    }

    #[test]
    fn test_display() {
        assert_eq!(BlockNumber(42).to_string(), "42");
        assert_eq!(InodeNumber(7).to_string(), "7");
        assert_eq!(BlockRange::new(BlockNumber(3), 4).to_string(), "[3+4]");
    }
}
