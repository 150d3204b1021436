#![forbid(unsafe_code)]
//! On-disk formats.
//!
//! All structures are little-endian at fixed offsets. Reordering any
//! field breaks on-disk compatibility.
//!
//! # Device layout
//!
//! ```text
//! [ superblock ][ inode table ][ free bitmap ][ log region ][ data region ]
//! ```
//!
//! # Log header block
//!
//! ```text
//! +------------------+---------+
//! | n                | 1 byte  | entry count, <= MAX_LOG_ENTRIES
//! | (pad)            | 7 bytes |
//! | type[64]         | 64 B    | LogEntryType discriminants
//! | inode_no[64]     | 256 B   | u32 per entry
//! | data[64]         | 512 B   | opaque word (offset / child inum)
//! | length[64]       | 256 B   | u32 per entry
//! | blocks[64]       | 512 B   | log data block; 0 = inline payload
//! | next_loghdr      | 8 B     | 0 terminates the chain
//! | mtime            | 16 B    |
//! | inuse            | 2 B     | 1 = committed, not yet digested
//! | commit magic     | 2 B     | 0x1FB9; absent => end of valid log
//! | (pad)            | .. 2048 |
//! | extension area   | 2048 B  | inline payloads, in entry order
//! +------------------+---------+
//! ```

pub mod bitmap;

use serde::{Deserialize, Serialize};
use walfs_types::{
    BLOCK_SIZE, BlockNumber, INODE_RECORD_SIZE, INODES_PER_BLOCK, InodeNumber, InodeType,
    ParseError, Timespec, ensure_slice, read_fixed, read_le_i64, read_le_u16, read_le_u32,
    read_le_u64,
};

// ── Constants ───────────────────────────────────────────────────────────────

/// Superblock magic ("WALF").
pub const SUPERBLOCK_MAGIC: u32 = 0x5741_4C46;

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Trailing commit marker of a log header. A header without it is not
/// durable.
pub const LH_COMMIT_MAGIC: u16 = 0x1FB9;

/// Maximum entries per log header.
pub const MAX_LOG_ENTRIES: usize = 64;

/// Size of the inline extension area trailing the log header.
pub const LOG_EXT_AREA_SIZE: usize = 2048;

/// Byte offset of the extension area inside the header block.
pub const LOG_EXT_AREA_OFFSET: usize = 2048;

/// Largest payload that may be placed in the extension area instead of
/// consuming a log data block (directory names, inode records, small
/// writes).
pub const INLINE_PAYLOAD_MAX: usize = 512;

/// Magic of an address table / extent leaf header.
pub const ADDR_TABLE_MAGIC: u16 = 0xA17E;

/// Inline extent or index slots in a 64-byte address table.
pub const ADDR_TABLE_SLOTS: usize = 3;

/// Directory entry name capacity.
pub const DIRSIZ: usize = 28;

/// Directory entry size (inum + name).
pub const DIRENT_SIZE: usize = 32;

/// Directory entries per block.
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE as usize / DIRENT_SIZE;

/// Directory occupancy bitmap capacity (slots per directory).
pub const DIRBITMAP_SIZE: usize = 1024;

// ── Little-endian write helpers ─────────────────────────────────────────────

fn write_le_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_le_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_le_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_timespec(bytes: &[u8], off: usize) -> Result<Timespec, ParseError> {
    Ok(Timespec {
        sec: read_le_i64(bytes, off)?,
        nsec: read_le_u32(bytes, off + 8)?,
    })
}

fn write_timespec(buf: &mut [u8], off: usize, ts: Timespec) {
    buf[off..off + 8].copy_from_slice(&ts.sec.to_le_bytes());
    write_le_u32(buf, off + 8, ts.nsec);
    write_le_u32(buf, off + 12, 0);
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Persisted superblock. Written by `mkfs`; `loghead` is rewritten by the
/// digest as it reclaims log space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSuperblock {
    /// Size of the file system image in blocks.
    pub size: u64,
    /// Number of data blocks.
    pub ndatablocks: u64,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks.
    pub nlog: u64,
    /// Block number of the first inode-table block.
    pub inode_start: BlockNumber,
    /// Block number of the first free-bitmap block.
    pub bmap_start: BlockNumber,
    /// Block number of the first data block.
    pub datablock_start: BlockNumber,
    /// Block number of the first log block.
    pub log_start: BlockNumber,
    /// First undigested log header, 0 when the log is empty.
    pub loghead: BlockNumber,
}

impl DiskSuperblock {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, 0x00)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(bytes, 0x04)?;
        if version != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }

        let sb = Self {
            size: read_le_u64(bytes, 0x08)?,
            ndatablocks: read_le_u64(bytes, 0x10)?,
            ninodes: read_le_u32(bytes, 0x18)?,
            nlog: read_le_u64(bytes, 0x20)?,
            inode_start: BlockNumber(read_le_u64(bytes, 0x28)?),
            bmap_start: BlockNumber(read_le_u64(bytes, 0x30)?),
            datablock_start: BlockNumber(read_le_u64(bytes, 0x38)?),
            log_start: BlockNumber(read_le_u64(bytes, 0x40)?),
            loghead: BlockNumber(read_le_u64(bytes, 0x48)?),
        };

        if sb.size == 0 {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "zero-sized image",
            });
        }
        if sb.inode_start.0 == 0 || sb.inode_start.0 >= sb.size {
            return Err(ParseError::InvalidField {
                field: "inode_start",
                reason: "out of image range",
            });
        }
        if sb.log_start.0 >= sb.size || sb.datablock_start.0 >= sb.size {
            return Err(ParseError::InvalidField {
                field: "region_start",
                reason: "out of image range",
            });
        }

        Ok(sb)
    }

    /// Serialize into a block-sized buffer.
    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() < 0x50 {
            return Err(ParseError::InsufficientData {
                needed: 0x50,
                offset: 0,
                actual: buf.len(),
            });
        }
        write_le_u32(buf, 0x00, SUPERBLOCK_MAGIC);
        write_le_u32(buf, 0x04, FORMAT_VERSION);
        write_le_u64(buf, 0x08, self.size);
        write_le_u64(buf, 0x10, self.ndatablocks);
        write_le_u32(buf, 0x18, self.ninodes);
        write_le_u32(buf, 0x1C, 0);
        write_le_u64(buf, 0x20, self.nlog);
        write_le_u64(buf, 0x28, self.inode_start.0);
        write_le_u64(buf, 0x30, self.bmap_start.0);
        write_le_u64(buf, 0x38, self.datablock_start.0);
        write_le_u64(buf, 0x40, self.log_start.0);
        write_le_u64(buf, 0x48, self.loghead.0);
        Ok(())
    }

    /// Block and byte offset of an inode record inside the inode table.
    #[must_use]
    pub fn inode_location(&self, inum: InodeNumber) -> (BlockNumber, usize) {
        let block = self.inode_start.0 + u64::from(inum.0 / INODES_PER_BLOCK);
        let offset = (inum.0 % INODES_PER_BLOCK) as usize * INODE_RECORD_SIZE;
        (BlockNumber(block), offset)
    }
}

// ── Extents and address tables ──────────────────────────────────────────────

/// One contiguous logical-to-physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub len: u32,
    pub physical_start: u64,
}

impl Extent {
    /// One past the last logical block covered.
    #[must_use]
    pub fn logical_end(&self) -> u32 {
        self.logical_block + self.len
    }

    /// Physical block for `lblk`, when covered.
    #[must_use]
    pub fn map(&self, lblk: u32) -> Option<BlockNumber> {
        if lblk >= self.logical_block && lblk < self.logical_end() {
            Some(BlockNumber(
                self.physical_start + u64::from(lblk - self.logical_block),
            ))
        } else {
            None
        }
    }
}

/// Index entry pointing at an extent leaf block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// First logical block covered by the leaf.
    pub logical_block: u32,
    pub leaf_block: u64,
}

/// Tagged in-memory form of a 64-byte on-disk address table.
///
/// Depth 0 holds up to [`ADDR_TABLE_SLOTS`] extents inline; depth 1 holds
/// index entries pointing at extent leaf blocks. An all-zero table decodes
/// as an empty inline table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrTable {
    Inline(Vec<Extent>),
    Indexed(Vec<IndexEntry>),
}

impl AddrTable {
    #[must_use]
    pub fn empty() -> Self {
        Self::Inline(Vec::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Inline(extents) => extents.is_empty(),
            Self::Indexed(indexes) => indexes.is_empty(),
        }
    }
}

/// Size of an address-table or leaf header.
const EXT_HEADER_SIZE: usize = 8;
/// Size of one extent or index slot.
const EXT_SLOT_SIZE: usize = 16;

/// Extents per leaf block.
pub const EXTENTS_PER_LEAF: usize = (BLOCK_SIZE as usize - EXT_HEADER_SIZE) / EXT_SLOT_SIZE;

fn write_extent_slot(buf: &mut [u8], off: usize, ext: &Extent) {
    write_le_u32(buf, off, ext.logical_block);
    write_le_u32(buf, off + 4, ext.len);
    write_le_u64(buf, off + 8, ext.physical_start);
}

fn read_extent_slot(bytes: &[u8], off: usize) -> Result<Extent, ParseError> {
    Ok(Extent {
        logical_block: read_le_u32(bytes, off)?,
        len: read_le_u32(bytes, off + 4)?,
        physical_start: read_le_u64(bytes, off + 8)?,
    })
}

/// Decode a 64-byte address table.
pub fn parse_addr_table(bytes: &[u8]) -> Result<AddrTable, ParseError> {
    ensure_slice(bytes, 0, 64)?;
    let magic = read_le_u16(bytes, 0)?;
    if magic == 0 {
        return Ok(AddrTable::empty());
    }
    if magic != ADDR_TABLE_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(ADDR_TABLE_MAGIC),
            actual: u64::from(magic),
        });
    }
    let count = usize::from(read_le_u16(bytes, 2)?);
    let depth = read_le_u16(bytes, 4)?;
    if count > ADDR_TABLE_SLOTS {
        return Err(ParseError::InvalidField {
            field: "addr_table_count",
            reason: "exceeds slot capacity",
        });
    }

    match depth {
        0 => {
            let mut extents = Vec::with_capacity(count);
            for idx in 0..count {
                extents.push(read_extent_slot(bytes, EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE)?);
            }
            Ok(AddrTable::Inline(extents))
        }
        1 => {
            let mut indexes = Vec::with_capacity(count);
            for idx in 0..count {
                let off = EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE;
                indexes.push(IndexEntry {
                    logical_block: read_le_u32(bytes, off)?,
                    leaf_block: read_le_u64(bytes, off + 8)?,
                });
            }
            Ok(AddrTable::Indexed(indexes))
        }
        _ => Err(ParseError::InvalidField {
            field: "addr_table_depth",
            reason: "must be 0 or 1",
        }),
    }
}

/// Encode an address table into a 64-byte region.
pub fn write_addr_table(table: &AddrTable, buf: &mut [u8]) -> Result<(), ParseError> {
    if buf.len() < 64 {
        return Err(ParseError::InsufficientData {
            needed: 64,
            offset: 0,
            actual: buf.len(),
        });
    }
    buf[..64].fill(0);
    if table.is_empty() {
        return Ok(());
    }

    match table {
        AddrTable::Inline(extents) => {
            if extents.len() > ADDR_TABLE_SLOTS {
                return Err(ParseError::InvalidField {
                    field: "addr_table_count",
                    reason: "exceeds slot capacity",
                });
            }
            write_le_u16(buf, 0, ADDR_TABLE_MAGIC);
            write_le_u16(buf, 2, extents.len() as u16);
            write_le_u16(buf, 4, 0);
            for (idx, ext) in extents.iter().enumerate() {
                write_extent_slot(buf, EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE, ext);
            }
        }
        AddrTable::Indexed(indexes) => {
            if indexes.len() > ADDR_TABLE_SLOTS {
                return Err(ParseError::InvalidField {
                    field: "addr_table_count",
                    reason: "exceeds slot capacity",
                });
            }
            write_le_u16(buf, 0, ADDR_TABLE_MAGIC);
            write_le_u16(buf, 2, indexes.len() as u16);
            write_le_u16(buf, 4, 1);
            for (idx, entry) in indexes.iter().enumerate() {
                let off = EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE;
                write_le_u32(buf, off, entry.logical_block);
                write_le_u32(buf, off + 4, 0);
                write_le_u64(buf, off + 8, entry.leaf_block);
            }
        }
    }
    Ok(())
}

/// Decode an extent leaf block.
pub fn parse_extent_leaf(bytes: &[u8]) -> Result<Vec<Extent>, ParseError> {
    let magic = read_le_u16(bytes, 0)?;
    if magic != ADDR_TABLE_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(ADDR_TABLE_MAGIC),
            actual: u64::from(magic),
        });
    }
    let count = usize::from(read_le_u16(bytes, 2)?);
    if count > EXTENTS_PER_LEAF {
        return Err(ParseError::InvalidField {
            field: "leaf_count",
            reason: "exceeds leaf capacity",
        });
    }
    let mut extents = Vec::with_capacity(count);
    for idx in 0..count {
        extents.push(read_extent_slot(bytes, EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE)?);
    }
    Ok(extents)
}

/// Encode extents into a leaf block image.
pub fn write_extent_leaf(extents: &[Extent], block_size: u32) -> Result<Vec<u8>, ParseError> {
    if extents.len() > EXTENTS_PER_LEAF {
        return Err(ParseError::InvalidField {
            field: "leaf_count",
            reason: "exceeds leaf capacity",
        });
    }
    let mut buf = vec![0_u8; block_size as usize];
    write_le_u16(&mut buf, 0, ADDR_TABLE_MAGIC);
    write_le_u16(&mut buf, 2, extents.len() as u16);
    for (idx, ext) in extents.iter().enumerate() {
        write_extent_slot(&mut buf, EXT_HEADER_SIZE + idx * EXT_SLOT_SIZE, ext);
    }
    Ok(buf)
}

// ── Inode record ────────────────────────────────────────────────────────────

/// On-disk inode record (512 bytes).
///
/// The record is always written whole; there is no partial persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub itype: InodeType,
    pub nlink: u8,
    pub perms: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    /// Address tables l1, l2, l3.
    pub tables: [AddrTable; 3],
}

impl Dinode {
    #[must_use]
    pub fn empty(itype: InodeType) -> Self {
        Self {
            itype,
            nlink: 0,
            perms: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: Timespec::default(),
            ctime: Timespec::default(),
            mtime: Timespec::default(),
            tables: [AddrTable::empty(), AddrTable::empty(), AddrTable::empty()],
        }
    }

    /// Whether this record denotes a free inode-table slot.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.itype == InodeType::None
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;
        let l1 = parse_addr_table(&read_fixed::<64>(bytes, 0x048)?)?;
        let l2 = parse_addr_table(&read_fixed::<64>(bytes, 0x088)?)?;
        let l3 = parse_addr_table(&read_fixed::<64>(bytes, 0x0C8)?)?;
        Ok(Self {
            itype: InodeType::from_raw(bytes[0x000]),
            nlink: bytes[0x001],
            perms: read_le_u16(bytes, 0x002)?,
            uid: read_le_u32(bytes, 0x004)?,
            gid: read_le_u32(bytes, 0x008)?,
            size: read_le_u64(bytes, 0x010)?,
            atime: read_timespec(bytes, 0x018)?,
            ctime: read_timespec(bytes, 0x028)?,
            mtime: read_timespec(bytes, 0x038)?,
            tables: [l1, l2, l3],
        })
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        buf[..INODE_RECORD_SIZE].fill(0);
        buf[0x000] = self.itype as u8;
        buf[0x001] = self.nlink;
        write_le_u16(buf, 0x002, self.perms);
        write_le_u32(buf, 0x004, self.uid);
        write_le_u32(buf, 0x008, self.gid);
        write_le_u64(buf, 0x010, self.size);
        write_timespec(buf, 0x018, self.atime);
        write_timespec(buf, 0x028, self.ctime);
        write_timespec(buf, 0x038, self.mtime);
        write_addr_table(&self.tables[0], &mut buf[0x048..0x088])?;
        write_addr_table(&self.tables[1], &mut buf[0x088..0x0C8])?;
        write_addr_table(&self.tables[2], &mut buf[0x0C8..0x108])?;
        Ok(())
    }

    /// Serialize into an owned 512-byte record.
    pub fn to_record(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; INODE_RECORD_SIZE];
        self.write_to_bytes(&mut buf)?;
        Ok(buf)
    }
}

// ── Log header ──────────────────────────────────────────────────────────────

/// Log entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogEntryType {
    DirAdd = 1,
    DirRename = 2,
    DirDel = 3,
    InodeCreate = 4,
    InodeUpdate = 5,
    File = 6,
    Unlink = 7,
}

impl LogEntryType {
    #[must_use]
    pub fn from_raw(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::DirAdd),
            2 => Some(Self::DirRename),
            3 => Some(Self::DirDel),
            4 => Some(Self::InodeCreate),
            5 => Some(Self::InodeUpdate),
            6 => Some(Self::File),
            7 => Some(Self::Unlink),
            _ => None,
        }
    }
}

/// Typed interpretation of the opaque `data[]` word.
///
/// The on-disk word keeps the original type→meaning mapping: file offset
/// for `File`, child inode number for the directory entry types, zero
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    FileOffset(u64),
    DirChild(InodeNumber),
    None,
}

impl LogPayload {
    #[must_use]
    pub fn to_word(self) -> u64 {
        match self {
            Self::FileOffset(off) => off,
            Self::DirChild(inum) => u64::from(inum.0),
            Self::None => 0,
        }
    }

    #[must_use]
    pub fn from_word(entry_type: LogEntryType, word: u64) -> Self {
        match entry_type {
            LogEntryType::File => Self::FileOffset(word),
            LogEntryType::DirAdd | LogEntryType::DirRename | LogEntryType::DirDel => {
                Self::DirChild(InodeNumber(word as u32))
            }
            _ => Self::None,
        }
    }
}

/// One slot in a log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_type: LogEntryType,
    pub inode_no: InodeNumber,
    pub payload: LogPayload,
    pub length: u32,
    /// First log data block holding the payload; `BlockNumber(0)` means
    /// the payload lives in the inline extension area. Block 0 is the
    /// superblock and can never be a log data block, so the sentinel is
    /// unambiguous.
    pub block: BlockNumber,
}

impl LogEntry {
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.block.0 == 0
    }
}

/// Decoded log header block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub entries: Vec<LogEntry>,
    /// Block number of the next header, 0 if none.
    pub next_loghdr_blkno: BlockNumber,
    pub mtime: Timespec,
    /// Set on commit, cleared by the digest.
    pub inuse: bool,
    /// Extension-area content, inline payloads packed in entry order.
    pub ext: Vec<u8>,
}

const LH_OFF_N: usize = 0;
const LH_OFF_TYPE: usize = 8;
const LH_OFF_INODE: usize = LH_OFF_TYPE + MAX_LOG_ENTRIES;
const LH_OFF_DATA: usize = LH_OFF_INODE + 4 * MAX_LOG_ENTRIES;
const LH_OFF_LENGTH: usize = LH_OFF_DATA + 8 * MAX_LOG_ENTRIES;
const LH_OFF_BLOCKS: usize = LH_OFF_LENGTH + 4 * MAX_LOG_ENTRIES;
const LH_OFF_NEXT: usize = LH_OFF_BLOCKS + 8 * MAX_LOG_ENTRIES;
const LH_OFF_MTIME: usize = LH_OFF_NEXT + 8;
const LH_OFF_INUSE: usize = LH_OFF_MTIME + 16;
const LH_OFF_MAGIC: usize = LH_OFF_INUSE + 2;

const _: () = assert!(LH_OFF_MAGIC + 2 <= LOG_EXT_AREA_OFFSET);
const _: () = assert!(LOG_EXT_AREA_OFFSET + LOG_EXT_AREA_SIZE == BLOCK_SIZE as usize);

impl LogHeader {
    /// Encode into a block image. The commit magic is part of the image;
    /// the caller controls when the image reaches the device.
    pub fn write_to_block(&self, block_size: u32) -> Result<Vec<u8>, ParseError> {
        if self.entries.len() > MAX_LOG_ENTRIES {
            return Err(ParseError::InvalidField {
                field: "n",
                reason: "entry count exceeds header capacity",
            });
        }
        if self.ext.len() > LOG_EXT_AREA_SIZE {
            return Err(ParseError::InvalidField {
                field: "ext",
                reason: "extension area overflow",
            });
        }
        let mut buf = vec![0_u8; block_size as usize];
        buf[LH_OFF_N] = self.entries.len() as u8;
        for (idx, entry) in self.entries.iter().enumerate() {
            buf[LH_OFF_TYPE + idx] = entry.entry_type as u8;
            write_le_u32(&mut buf, LH_OFF_INODE + idx * 4, entry.inode_no.0);
            write_le_u64(&mut buf, LH_OFF_DATA + idx * 8, entry.payload.to_word());
            write_le_u32(&mut buf, LH_OFF_LENGTH + idx * 4, entry.length);
            write_le_u64(&mut buf, LH_OFF_BLOCKS + idx * 8, entry.block.0);
        }
        write_le_u64(&mut buf, LH_OFF_NEXT, self.next_loghdr_blkno.0);
        write_timespec(&mut buf, LH_OFF_MTIME, self.mtime);
        write_le_u16(&mut buf, LH_OFF_INUSE, u16::from(self.inuse));
        write_le_u16(&mut buf, LH_OFF_MAGIC, LH_COMMIT_MAGIC);
        buf[LOG_EXT_AREA_OFFSET..LOG_EXT_AREA_OFFSET + self.ext.len()].copy_from_slice(&self.ext);
        Ok(buf)
    }

    /// Decode a header block.
    ///
    /// Fails on a missing commit magic or an impossible entry count;
    /// the digest treats either as the end of valid log content.
    pub fn parse_from_block(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, LOG_EXT_AREA_OFFSET + LOG_EXT_AREA_SIZE)?;
        let magic = read_le_u16(bytes, LH_OFF_MAGIC)?;
        if magic != LH_COMMIT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(LH_COMMIT_MAGIC),
                actual: u64::from(magic),
            });
        }
        let n = usize::from(bytes[LH_OFF_N]);
        if n > MAX_LOG_ENTRIES {
            return Err(ParseError::InvalidField {
                field: "n",
                reason: "entry count exceeds header capacity",
            });
        }

        let mut entries = Vec::with_capacity(n);
        let mut ext_used = 0_usize;
        for idx in 0..n {
            let entry_type = LogEntryType::from_raw(bytes[LH_OFF_TYPE + idx]).ok_or(
                ParseError::InvalidField {
                    field: "type",
                    reason: "unknown log entry type",
                },
            )?;
            let word = read_le_u64(bytes, LH_OFF_DATA + idx * 8)?;
            let entry = LogEntry {
                entry_type,
                inode_no: InodeNumber(read_le_u32(bytes, LH_OFF_INODE + idx * 4)?),
                payload: LogPayload::from_word(entry_type, word),
                length: read_le_u32(bytes, LH_OFF_LENGTH + idx * 4)?,
                block: BlockNumber(read_le_u64(bytes, LH_OFF_BLOCKS + idx * 8)?),
            };
            if entry.is_inline() {
                ext_used += entry.length as usize;
            }
            entries.push(entry);
        }
        if ext_used > LOG_EXT_AREA_SIZE {
            return Err(ParseError::InvalidField {
                field: "ext",
                reason: "inline payloads exceed extension area",
            });
        }

        Ok(Self {
            entries,
            next_loghdr_blkno: BlockNumber(read_le_u64(bytes, LH_OFF_NEXT)?),
            mtime: read_timespec(bytes, LH_OFF_MTIME)?,
            inuse: read_le_u16(bytes, LH_OFF_INUSE)? != 0,
            ext: bytes[LOG_EXT_AREA_OFFSET..LOG_EXT_AREA_OFFSET + ext_used].to_vec(),
        })
    }
}

/// Patch the next-header pointer of an encoded header block in place.
///
/// Used when a later commit links itself behind an already-durable
/// header; the rest of the image is left untouched.
pub fn patch_next_loghdr(block: &mut [u8], next: BlockNumber) -> Result<(), ParseError> {
    ensure_slice(block, LH_OFF_NEXT, 8)?;
    write_le_u64(block, LH_OFF_NEXT, next.0);
    Ok(())
}

/// Patch the in-use flag of an encoded header block in place.
///
/// The digest clears the flag after applying a header; the commit magic
/// stays so the block still decodes (as already-digested) during a
/// recovery walk.
pub fn patch_inuse(block: &mut [u8], inuse: bool) -> Result<(), ParseError> {
    ensure_slice(block, LH_OFF_INUSE, 2)?;
    write_le_u16(block, LH_OFF_INUSE, u16::from(inuse));
    Ok(())
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Validate a directory entry name: non-empty, fits [`DIRSIZ`], no NUL.
pub fn validate_dirent_name(name: &[u8]) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "empty directory entry name",
        });
    }
    if name.len() > DIRSIZ {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "directory entry name too long",
        });
    }
    if name.contains(&0) {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "directory entry name contains NUL",
        });
    }
    Ok(())
}

/// Read the directory entry at slot `slot` of a directory block.
/// Returns `None` for a free slot (`inum == 0`).
pub fn read_dirent(block: &[u8], slot: usize) -> Result<Option<(InodeNumber, Vec<u8>)>, ParseError> {
    let off = slot * DIRENT_SIZE;
    let bytes = ensure_slice(block, off, DIRENT_SIZE)?;
    let inum = read_le_u32(bytes, 0)?;
    if inum == 0 {
        return Ok(None);
    }
    let name_area = &bytes[4..4 + DIRSIZ];
    let name_len = name_area.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    Ok(Some((InodeNumber(inum), name_area[..name_len].to_vec())))
}

/// Write a directory entry into slot `slot` of a directory block.
pub fn write_dirent(
    block: &mut [u8],
    slot: usize,
    inum: InodeNumber,
    name: &[u8],
) -> Result<(), ParseError> {
    validate_dirent_name(name)?;
    let off = slot * DIRENT_SIZE;
    if off + DIRENT_SIZE > block.len() {
        return Err(ParseError::InsufficientData {
            needed: DIRENT_SIZE,
            offset: off,
            actual: block.len().saturating_sub(off),
        });
    }
    write_le_u32(block, off, inum.0);
    block[off + 4..off + 4 + DIRSIZ].fill(0);
    block[off + 4..off + 4 + name.len()].copy_from_slice(name);
    Ok(())
}

/// Clear slot `slot` of a directory block.
pub fn clear_dirent(block: &mut [u8], slot: usize) -> Result<(), ParseError> {
    let off = slot * DIRENT_SIZE;
    if off + DIRENT_SIZE > block.len() {
        return Err(ParseError::InsufficientData {
            needed: DIRENT_SIZE,
            offset: off,
            actual: block.len().saturating_sub(off),
        });
    }
    block[off..off + DIRENT_SIZE].fill(0);
    Ok(())
}
