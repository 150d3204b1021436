#![forbid(unsafe_code)]
//! Write-ahead log manager.
//!
//! Owns the append-only log region of one device. Each transaction moves
//! `Active → (Committed | Aborted)`; the manager hands out reserved log
//! block runs at `begin`, buffers entries and payloads in memory, and
//! makes them durable at `commit`.
//!
//! # Durability protocol
//!
//! 1. write all log data blocks, sync;
//! 2. under the commit lock, link the chain (patch the previous committed
//!    header's next pointer, or persist the superblock's `loghead` for the
//!    first header);
//! 3. write this header (in-use flag and commit magic included) and
//!    sync.
//!
//! The final sync is the durability point. A crash before it leaves the
//! chain pointing at a block without a commit magic, which replay already
//! treats as end-of-log, so partially-committed transactions are never
//! observed.
//!
//! Commits are serialized by the chain lock; commit order is replay
//! order.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use walfs_alloc::{AllocRole, BlockAllocator};
use walfs_block::BlockDevice;
use walfs_error::{Result, WalfsError};
use walfs_ondisk::{
    DiskSuperblock, INLINE_PAYLOAD_MAX, LOG_EXT_AREA_SIZE, LogEntry, LogEntryType, LogHeader,
    LogPayload, MAX_LOG_ENTRIES, patch_next_loghdr,
};
use walfs_types::{BLOCK_SIZE, BlockNumber, BlockRange, InodeNumber, Timespec, blocks_for_bytes};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Chain bookkeeping shared by commit and digest. Doubles as the commit
/// lock.
#[derive(Debug)]
struct ChainState {
    /// In-memory copy of the persisted superblock; `loghead` tracks the
    /// first undigested header.
    sb: DiskSuperblock,
    /// Header block of the most recently committed transaction.
    tail: Option<BlockNumber>,
}

/// The log manager. One per mounted device.
pub struct LogManager {
    dev: Arc<dyn BlockDevice>,
    alloc: Arc<BlockAllocator>,
    chain: Mutex<ChainState>,
}

impl LogManager {
    /// Set up the manager for a freshly formatted or already-recovered
    /// device whose log chain is known to be empty.
    pub fn new(dev: Arc<dyn BlockDevice>, alloc: Arc<BlockAllocator>, sb: DiskSuperblock) -> Self {
        Self {
            dev,
            alloc,
            chain: Mutex::new(ChainState { sb, tail: None }),
        }
    }

    /// Set up the manager at mount time, rediscovering the chain tail by
    /// walking committed headers from the persisted `loghead`.
    ///
    /// A `loghead` pointing at a block without a commit magic means the
    /// process died mid-commit of the first chained transaction; the
    /// chain is empty and the head is reset.
    pub fn mount(
        dev: Arc<dyn BlockDevice>,
        alloc: Arc<BlockAllocator>,
        mut sb: DiskSuperblock,
    ) -> Result<Self> {
        let mut tail = None;
        let mut cursor = sb.loghead;
        while cursor.0 != 0 {
            let buf = dev.read_block(cursor)?;
            let Ok(header) = LogHeader::parse_from_block(buf.as_slice()) else {
                break;
            };
            tail = Some(cursor);
            cursor = header.next_loghdr_blkno;
        }
        if tail.is_none() && sb.loghead.0 != 0 {
            sb.loghead = BlockNumber(0);
            write_superblock(&*dev, &sb)?;
        }
        Ok(Self {
            dev,
            alloc,
            chain: Mutex::new(ChainState { sb, tail }),
        })
    }

    /// First undigested header block, 0 when the log is empty.
    #[must_use]
    pub fn chain_head(&self) -> BlockNumber {
        self.chain.lock().sb.loghead
    }

    /// Begin a transaction, reserving one header block plus
    /// `max_data_blocks` log data blocks sized to the operation's
    /// maximum possible footprint.
    pub fn begin(&self, max_data_blocks: u64) -> Result<Transaction> {
        let log_start = self.chain.lock().sb.log_start;
        let reserved =
            self.alloc
                .allocate_near(1 + max_data_blocks, log_start, AllocRole::Log)?;
        debug!(%reserved, "transaction started");
        Ok(Transaction {
            reserved,
            pos: 0,
            entries: Vec::new(),
            ext: Vec::new(),
            pending: Vec::new(),
            state: TxState::Active,
        })
    }

    /// Commit `txn`: make all of its entries durable, in order, behind a
    /// commit marker. Returns the header block number.
    ///
    /// On an I/O failure the transaction's blocks are neither digested
    /// nor reclaimed; the error is surfaced and the operation counts as
    /// aborted.
    pub fn commit(&self, mut txn: Transaction) -> Result<BlockNumber> {
        if txn.state != TxState::Active {
            return Err(WalfsError::InvalidState("commit on a finished transaction"));
        }

        let hdr_block = txn.header_block();

        // Data blocks first; they must be durable before the marker.
        for (block, data) in &txn.pending {
            self.dev.write_block(*block, data)?;
        }
        self.dev.sync()?;

        let mut chain = self.chain.lock();

        // Link before marking: a crash between the two leaves the chain
        // pointing at a marker-less block, which replay treats as
        // end-of-log.
        match chain.tail {
            Some(tail) => {
                let mut buf = self.dev.read_block(tail)?.into_inner();
                patch_next_loghdr(&mut buf, hdr_block)
                    .map_err(|e| WalfsError::Format(e.to_string()))?;
                self.dev.write_block(tail, &buf)?;
            }
            None => {
                chain.sb.loghead = hdr_block;
                write_superblock(&*self.dev, &chain.sb)?;
            }
        }

        let header = LogHeader {
            entries: std::mem::take(&mut txn.entries),
            next_loghdr_blkno: BlockNumber(0),
            mtime: Timespec::now(),
            inuse: true,
            ext: std::mem::take(&mut txn.ext),
        };
        let image = header
            .write_to_block(self.dev.block_size())
            .map_err(|e| WalfsError::Format(e.to_string()))?;
        self.dev.write_block(hdr_block, &image)?;
        self.dev.sync()?;

        chain.tail = Some(hdr_block);
        drop(chain);

        // The unused tail of the reservation goes straight back.
        let unused_start = txn.reserved.start.0 + 1 + txn.pos;
        let unused = txn.reserved.end().0 - unused_start;
        if unused > 0 {
            self.alloc
                .free(BlockRange::new(BlockNumber(unused_start), unused), AllocRole::Log)?;
        }

        txn.state = TxState::Committed;
        debug!(header = %hdr_block, entries = header.entries.len(), "transaction committed");
        Ok(hdr_block)
    }

    /// Abort `txn`: release the reserved run, perform no persistent
    /// writes. Always safe to call instead of commit.
    pub fn abort(&self, mut txn: Transaction) -> Result<()> {
        if txn.state != TxState::Active {
            return Err(WalfsError::InvalidState("abort on a finished transaction"));
        }
        self.alloc.free(txn.reserved, AllocRole::Log)?;
        txn.state = TxState::Aborted;
        debug!(reserved = %txn.reserved, "transaction aborted");
        Ok(())
    }

    /// Called by the digest after applying `header`: advance the
    /// persisted chain head to `next` (0 drains the chain).
    pub fn advance_head(&self, next: BlockNumber) -> Result<()> {
        let mut chain = self.chain.lock();
        chain.sb.loghead = next;
        if next.0 == 0 {
            chain.tail = None;
        }
        write_superblock(&*self.dev, &chain.sb)
    }

    /// Allocator handle, shared with the digest for log-block
    /// reclamation.
    #[must_use]
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.alloc
    }
}

fn write_superblock(dev: &dyn BlockDevice, sb: &DiskSuperblock) -> Result<()> {
    let mut buf = vec![0_u8; dev.block_size() as usize];
    sb.write_to_bytes(&mut buf)
        .map_err(|e| WalfsError::Format(e.to_string()))?;
    dev.write_block(BlockNumber(0), &buf)
}

/// An in-flight transaction: the log header under construction plus its
/// reserved block run.
///
/// Every transaction must be driven to exactly one of
/// [`LogManager::commit`] or [`LogManager::abort`]. Dropping an active
/// transaction leaks its reservation until recovery; this is logged, not
/// panicked on.
pub struct Transaction {
    /// Header block followed by the data run.
    reserved: BlockRange,
    /// Cursor into the data run; `0 <= pos <= nr_log_blocks`.
    pos: u64,
    entries: Vec<LogEntry>,
    /// Write-once append buffer for inline payloads.
    ext: Vec<u8>,
    /// Deferred log data block writes, flushed at commit.
    pending: Vec<(BlockNumber, Vec<u8>)>,
    state: TxState,
}

impl Transaction {
    /// Block that will hold this transaction's header.
    #[must_use]
    pub fn header_block(&self) -> BlockNumber {
        self.reserved.start
    }

    /// Data blocks reserved for this transaction.
    #[must_use]
    pub fn nr_log_blocks(&self) -> u64 {
        self.reserved.count - 1
    }

    /// Entry slots used so far.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Append one entry.
    ///
    /// Payloads up to [`INLINE_PAYLOAD_MAX`] bytes go into the header's
    /// inline extension area while it has room (directory names, inode
    /// records, tiny writes); anything larger consumes whole blocks from
    /// the reserved run. `LogFull` means the caller must commit this
    /// header and chain a new one.
    pub fn append(
        &mut self,
        entry_type: LogEntryType,
        inode_no: InodeNumber,
        payload: LogPayload,
        data: &[u8],
    ) -> Result<()> {
        if self.state != TxState::Active {
            return Err(WalfsError::InvalidState(
                "append without an active transaction",
            ));
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return Err(self.log_full());
        }

        let length = u32::try_from(data.len())
            .map_err(|_| WalfsError::InvalidState("log payload exceeds u32 length"))?;

        let block = if data.len() <= INLINE_PAYLOAD_MAX
            && self.ext.len() + data.len() <= LOG_EXT_AREA_SIZE
        {
            self.ext.extend_from_slice(data);
            BlockNumber(0)
        } else {
            let needed = blocks_for_bytes(data.len() as u64);
            if self.pos + needed > self.nr_log_blocks() {
                return Err(self.log_full());
            }
            let first = BlockNumber(self.reserved.start.0 + 1 + self.pos);
            for (idx, chunk) in data.chunks(BLOCK_SIZE as usize).enumerate() {
                let mut buf = vec![0_u8; BLOCK_SIZE as usize];
                buf[..chunk.len()].copy_from_slice(chunk);
                self.pending.push((BlockNumber(first.0 + idx as u64), buf));
            }
            self.pos += needed;
            first
        };

        self.entries.push(LogEntry {
            entry_type,
            inode_no,
            payload,
            length,
            block,
        });
        Ok(())
    }

    fn log_full(&self) -> WalfsError {
        WalfsError::LogFull {
            entries: self.entries.len(),
            blocks_used: self.pos,
            blocks_reserved: self.nr_log_blocks(),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(
                reserved = %self.reserved,
                "active transaction dropped; reserved log blocks leak until recovery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walfs_block::MemBlockDevice;
    use walfs_types::PartitionId;

    fn setup() -> (Arc<MemBlockDevice>, Arc<BlockAllocator>, LogManager) {
        let dev = Arc::new(MemBlockDevice::new(BLOCK_SIZE, 1024));
        // Allocatable span: blocks 100..1024 (metadata below 100).
        let alloc = Arc::new(BlockAllocator::new(
            BlockRange::new(BlockNumber(100), 924),
            2,
        ));
        let sb = DiskSuperblock {
            size: 1024,
            ndatablocks: 600,
            ninodes: 64,
            nlog: 300,
            inode_start: BlockNumber(1),
            bmap_start: BlockNumber(60),
            datablock_start: BlockNumber(400),
            log_start: BlockNumber(100),
            loghead: BlockNumber(0),
        };
        let mgr = LogManager::new(
            Arc::clone(&dev) as Arc<dyn BlockDevice>,
            Arc::clone(&alloc),
            sb,
        );
        (dev, alloc, mgr)
    }

    #[test]
    fn commit_writes_header_with_magic() {
        let (dev, _alloc, mgr) = setup();
        let mut txn = mgr.begin(2).unwrap();
        txn.append(
            LogEntryType::InodeCreate,
            InodeNumber(5),
            LogPayload::None,
            &[0xAA; 512],
        )
        .unwrap();
        let hdr = mgr.commit(txn).unwrap();

        let buf = dev.read_block(hdr).unwrap();
        let header = LogHeader::parse_from_block(buf.as_slice()).unwrap();
        assert!(header.inuse);
        assert_eq!(header.entries.len(), 1);
        assert_eq!(header.entries[0].entry_type, LogEntryType::InodeCreate);
        assert!(header.entries[0].is_inline());
        assert_eq!(header.ext.len(), 512);
        assert_eq!(mgr.chain_head(), hdr);
    }

    #[test]
    fn large_payload_consumes_reserved_blocks() {
        let (dev, _alloc, mgr) = setup();
        let mut txn = mgr.begin(3).unwrap();
        let payload = vec![0x5C_u8; BLOCK_SIZE as usize + 17];
        txn.append(
            LogEntryType::File,
            InodeNumber(9),
            LogPayload::FileOffset(0),
            &payload,
        )
        .unwrap();
        let hdr = mgr.commit(txn).unwrap();

        let header = LogHeader::parse_from_block(dev.read_block(hdr).unwrap().as_slice()).unwrap();
        let entry = header.entries[0];
        assert!(!entry.is_inline());
        assert_eq!(entry.length as usize, payload.len());

        // Payload spans two log data blocks, zero padded.
        let first = dev.read_block(entry.block).unwrap();
        assert_eq!(&first.as_slice()[..], &payload[..BLOCK_SIZE as usize]);
        let second = dev
            .read_block(BlockNumber(entry.block.0 + 1))
            .unwrap();
        assert_eq!(&second.as_slice()[..17], &payload[BLOCK_SIZE as usize..]);
        assert!(second.as_slice()[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn append_past_reservation_is_log_full() {
        let (_dev, _alloc, mgr) = setup();
        let mut txn = mgr.begin(1).unwrap();
        let block_sized = vec![0_u8; BLOCK_SIZE as usize];
        txn.append(
            LogEntryType::File,
            InodeNumber(2),
            LogPayload::FileOffset(0),
            &block_sized,
        )
        .unwrap();
        let err = txn
            .append(
                LogEntryType::File,
                InodeNumber(2),
                LogPayload::FileOffset(4096),
                &block_sized,
            )
            .unwrap_err();
        assert!(matches!(err, WalfsError::LogFull { .. }));
        mgr.abort(txn).unwrap();
    }

    #[test]
    fn entry_capacity_is_log_full() {
        let (_dev, _alloc, mgr) = setup();
        let mut txn = mgr.begin(0).unwrap();
        for i in 0..MAX_LOG_ENTRIES {
            txn.append(
                LogEntryType::Unlink,
                InodeNumber(i as u32),
                LogPayload::None,
                &[],
            )
            .unwrap();
        }
        let err = txn
            .append(LogEntryType::Unlink, InodeNumber(999), LogPayload::None, &[])
            .unwrap_err();
        assert!(matches!(err, WalfsError::LogFull { entries, .. } if entries == MAX_LOG_ENTRIES));
        mgr.abort(txn).unwrap();
    }

    #[test]
    fn abort_returns_reservation() {
        let (_dev, alloc, mgr) = setup();
        let free_before = alloc.total_free_blocks();
        let txn = mgr.begin(8).unwrap();
        assert_eq!(alloc.total_free_blocks(), free_before - 9);
        mgr.abort(txn).unwrap();
        assert_eq!(alloc.total_free_blocks(), free_before);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn commit_frees_unused_reservation_tail() {
        let (_dev, alloc, mgr) = setup();
        let free_before = alloc.total_free_blocks();
        let mut txn = mgr.begin(8).unwrap();
        txn.append(
            LogEntryType::File,
            InodeNumber(3),
            LogPayload::FileOffset(0),
            &vec![1_u8; BLOCK_SIZE as usize],
        )
        .unwrap();
        mgr.commit(txn).unwrap();
        // Header + one data block stay out; seven reserved blocks return.
        assert_eq!(alloc.total_free_blocks(), free_before - 2);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn commits_chain_in_order() {
        let (dev, _alloc, mgr) = setup();

        let mut first = mgr.begin(0).unwrap();
        first
            .append(LogEntryType::Unlink, InodeNumber(1), LogPayload::None, &[])
            .unwrap();
        let first_hdr = mgr.commit(first).unwrap();

        let mut second = mgr.begin(0).unwrap();
        second
            .append(LogEntryType::Unlink, InodeNumber(2), LogPayload::None, &[])
            .unwrap();
        let second_hdr = mgr.commit(second).unwrap();

        let head = LogHeader::parse_from_block(dev.read_block(first_hdr).unwrap().as_slice())
            .unwrap();
        assert_eq!(head.next_loghdr_blkno, second_hdr);
        let tail = LogHeader::parse_from_block(dev.read_block(second_hdr).unwrap().as_slice())
            .unwrap();
        assert_eq!(tail.next_loghdr_blkno, BlockNumber(0));
        assert_eq!(mgr.chain_head(), first_hdr);
    }

    #[test]
    fn loghead_persists_across_mount() {
        let (dev, alloc, mgr) = setup();
        let mut txn = mgr.begin(0).unwrap();
        txn.append(LogEntryType::Unlink, InodeNumber(7), LogPayload::None, &[])
            .unwrap();
        let hdr = mgr.commit(txn).unwrap();
        drop(mgr);

        let sb_buf = dev.read_block(BlockNumber(0)).unwrap();
        let sb = DiskSuperblock::parse_from_bytes(sb_buf.as_slice()).unwrap();
        assert_eq!(sb.loghead, hdr);

        let remounted = LogManager::mount(
            Arc::clone(&dev) as Arc<dyn BlockDevice>,
            alloc,
            sb,
        )
        .unwrap();
        assert_eq!(remounted.chain_head(), hdr);
    }

    #[test]
    fn mount_resets_head_pointing_at_garbage() {
        let (dev, alloc, mgr) = setup();
        drop(mgr);
        // Simulate a crash after loghead was linked but before the header
        // (and its commit magic) reached the device.
        let sb = DiskSuperblock {
            size: 1024,
            ndatablocks: 600,
            ninodes: 64,
            nlog: 300,
            inode_start: BlockNumber(1),
            bmap_start: BlockNumber(60),
            datablock_start: BlockNumber(400),
            log_start: BlockNumber(100),
            loghead: BlockNumber(555),
        };
        let mgr = LogManager::mount(Arc::clone(&dev) as Arc<dyn BlockDevice>, alloc, sb).unwrap();
        assert_eq!(mgr.chain_head(), BlockNumber(0));

        let sb_after =
            DiskSuperblock::parse_from_bytes(dev.read_block(BlockNumber(0)).unwrap().as_slice());
        assert_eq!(sb_after.unwrap().loghead, BlockNumber(0));
    }
}
