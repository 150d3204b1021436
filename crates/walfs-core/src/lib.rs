#![forbid(unsafe_code)]
//! Composition root: the in-memory superblock.
//!
//! Owns the device handle, the log manager, the block allocators, the
//! inode cache, and the dirty-inode set, and exposes the operation entry
//! points the POSIX shim drives: transaction control, file writes,
//! inode create/update, unlink, directory add/remove/rename, field
//! mutators, stat-style readers, the flush pass, and the digest trigger.
//! There is no hidden process-wide state; everything reaches the engine
//! through this context object.

use std::sync::Arc;
use tracing::info;
use walfs_alloc::BlockAllocator;
use walfs_block::BlockDevice;
use walfs_digest::{DigestContext, bitmap_block_used, read_bitmap, reserve_log_chain};
use walfs_error::{Result, WalfsError};
use walfs_inode::{DirtySet, Inode, InodeCache, InodeState, ResolveMode, mark_dirty};
use walfs_journal::{LogManager, Transaction};
use walfs_ondisk::{
    DIRSIZ, Dinode, DiskSuperblock, LogEntryType, LogPayload,
    validate_dirent_name,
};
use walfs_types::{
    BLOCK_SIZE, BlockNumber, BlockRange, INODE_RECORD_SIZE, INODES_PER_BLOCK, InodeNumber, InodeType, Timespec,
    blocks_for_bytes,
};

/// Geometry choices for `mkfs`.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub ninodes: u32,
    pub nlog: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            ninodes: 512,
            nlog: 1024,
        }
    }
}

/// Options controlling `mount`.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Per-partition free lists for the data region (the shared overflow
    /// list is additional).
    pub n_partitions: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { n_partitions: 4 }
    }
}

/// Format a device:
///
/// ```text
/// [ superblock ][ inode table ][ free bitmap ][ log region ][ data region ]
/// ```
///
/// Writes the superblock, zeroes the inode table, seeds an all-free
/// bitmap, and creates the root directory inode. The log region is left
/// untouched; a zero `loghead` means replay never looks at it.
pub fn mkfs(dev: &dyn BlockDevice, config: &FsConfig) -> Result<DiskSuperblock> {
    if dev.block_size() != BLOCK_SIZE {
        return Err(WalfsError::Format(format!(
            "device block size {} unsupported (need {BLOCK_SIZE})",
            dev.block_size()
        )));
    }
    let total = dev.block_count();
    let inode_blocks = u64::from(config.ninodes.div_ceil(INODES_PER_BLOCK));
    // Over-covering the whole device keeps the bitmap size independent
    // of the data-region size it ultimately tracks.
    let bmap_blocks = walfs_ondisk::bitmap::bitmap_blocks_for(total, BLOCK_SIZE);

    let bmap_start = 1 + inode_blocks;
    let log_start = bmap_start + bmap_blocks;
    let datablock_start = log_start + config.nlog;
    if datablock_start + 8 > total {
        return Err(WalfsError::Format(format!(
            "device too small: {total} blocks cannot hold the requested geometry"
        )));
    }

    let sb = DiskSuperblock {
        size: total,
        ndatablocks: total - datablock_start,
        ninodes: config.ninodes,
        nlog: config.nlog,
        inode_start: BlockNumber(1),
        bmap_start: BlockNumber(bmap_start),
        datablock_start: BlockNumber(datablock_start),
        log_start: BlockNumber(log_start),
        loghead: BlockNumber(0),
    };

    // Zero the inode table and the bitmap (all data blocks free).
    let zero = vec![0_u8; BLOCK_SIZE as usize];
    for block in 1..log_start {
        dev.write_block(BlockNumber(block), &zero)?;
    }

    let mut sb_block = zero.clone();
    sb.write_to_bytes(&mut sb_block)
        .map_err(|e| WalfsError::Format(e.to_string()))?;
    dev.write_block(BlockNumber(0), &sb_block)?;

    // Root directory inode.
    let mut root = Dinode::empty(InodeType::Dir);
    root.nlink = 1;
    root.mtime = Timespec::now();
    root.ctime = root.mtime;
    let (block, offset) = sb.inode_location(InodeNumber::ROOT);
    let mut buf = dev.read_block(block)?.into_inner();
    root.write_to_bytes(&mut buf[offset..offset + INODE_RECORD_SIZE])
        .map_err(|e| WalfsError::Format(e.to_string()))?;
    dev.write_block(block, &buf)?;

    dev.sync()?;
    info!(total, ninodes = config.ninodes, nlog = config.nlog, "device formatted");
    Ok(sb)
}

/// The mounted superblock: composition root for one device.
pub struct Superblock {
    dev: Arc<dyn BlockDevice>,
    geometry: DiskSuperblock,
    log: LogManager,
    data_alloc: Arc<BlockAllocator>,
    icache: InodeCache,
    dirty: DirtySet,
}

impl Superblock {
    /// Mount a formatted device: parse and validate the superblock,
    /// rebuild the free lists from the on-disk bitmap, pin the committed
    /// log chain, and replay it (crash recovery).
    pub fn mount(dev: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(WalfsError::Format(format!(
                "device block size {} unsupported (need {BLOCK_SIZE})",
                dev.block_size()
            )));
        }
        let sb_buf = dev.read_block(BlockNumber(0))?;
        let geometry = DiskSuperblock::parse_from_bytes(sb_buf.as_slice())
            .map_err(|e| WalfsError::Format(format!("superblock: {e}")))?;
        if geometry.size > dev.block_count() {
            return Err(WalfsError::Format(format!(
                "superblock claims {} blocks, device has {}",
                geometry.size,
                dev.block_count()
            )));
        }

        let bits = read_bitmap(&*dev, &geometry)?;
        let data_alloc = Arc::new(BlockAllocator::from_used_bits(
            BlockRange::new(geometry.datablock_start, geometry.ndatablocks),
            options.n_partitions,
            |block| bitmap_block_used(&bits, &geometry, block),
        ));

        let log_alloc = Arc::new(BlockAllocator::new(
            BlockRange::new(geometry.log_start, geometry.nlog),
            1,
        ));
        reserve_log_chain(&*dev, &geometry, &log_alloc)?;

        let log = LogManager::mount(Arc::clone(&dev), log_alloc, geometry)?;

        let mounted = Self {
            dev,
            geometry,
            log,
            data_alloc,
            icache: InodeCache::new(),
            dirty: DirtySet::new(),
        };

        let replayed = mounted.digest(None)?;
        if replayed > 0 {
            info!(replayed, "recovery replayed committed log headers");
        }
        Ok(mounted)
    }

    #[must_use]
    pub fn geometry(&self) -> &DiskSuperblock {
        &self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn data_allocator(&self) -> &Arc<BlockAllocator> {
        &self.data_alloc
    }

    #[must_use]
    pub fn dirty_set(&self) -> &DirtySet {
        &self.dirty
    }

    // ── Transaction control ─────────────────────────────────────────────

    /// Begin a transaction sized for at most `max_data_blocks` of logged
    /// payload beyond what fits inline.
    pub fn begin_op(&self, max_data_blocks: u64) -> Result<Transaction> {
        self.log.begin(max_data_blocks)
    }

    pub fn commit_op(&self, txn: Transaction) -> Result<BlockNumber> {
        self.log.commit(txn)
    }

    pub fn abort_op(&self, txn: Transaction) -> Result<()> {
        self.log.abort(txn)
    }

    /// Apply up to `up_to` committed log headers (all of them when
    /// `None`), reclaiming their log space.
    pub fn digest(&self, up_to: Option<usize>) -> Result<usize> {
        let ctx = DigestContext {
            dev: &*self.dev,
            sb: &self.geometry,
            data_alloc: &self.data_alloc,
            icache: &self.icache,
            dirty: &self.dirty,
            log: &self.log,
        };
        walfs_digest::digest(&ctx, up_to)
    }

    // ── Inode handles ───────────────────────────────────────────────────

    pub fn get_inode(&self, inum: InodeNumber) -> Result<Arc<Inode>> {
        self.icache.get(&*self.dev, &self.geometry, inum)
    }

    pub fn put_inode(&self, inode: Arc<Inode>) -> Result<()> {
        self.icache
            .put(&*self.dev, &self.geometry, &self.data_alloc, &self.dirty, inode)
    }

    /// Lowest free inode-table slot not currently cached.
    pub fn alloc_inum(&self) -> Result<InodeNumber> {
        for inum in 2..self.geometry.ninodes {
            let inum = InodeNumber(inum);
            if self.icache.is_cached(inum) {
                continue;
            }
            let (block, offset) = self.geometry.inode_location(inum);
            let buf = self.dev.read_block(block)?;
            let record =
                Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + INODE_RECORD_SIZE])
                    .map_err(|e| WalfsError::Corruption {
                        block: block.0,
                        detail: format!("inode record {inum}: {e}"),
                    })?;
            if record.is_free() {
                return Ok(inum);
            }
        }
        Err(WalfsError::AllocationFailed {
            partition: 0,
            requested: 1,
        })
    }

    /// Create an inode: initialize the cached body and log the record.
    /// Durable once the transaction commits and digests.
    pub fn create_inode(
        &self,
        txn: &mut Transaction,
        inum: InodeNumber,
        itype: InodeType,
        perms: u16,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Inode>> {
        let inode = self.get_inode(inum)?;
        let record = {
            let mut body = inode.body.write();
            if body.itype != InodeType::None {
                drop(body);
                self.put_inode(inode)?;
                return Err(WalfsError::InvalidState("create over a live inode"));
            }
            body.itype = itype;
            body.nlink = 1;
            body.perms = perms;
            body.uid = uid;
            body.gid = gid;
            body.size = 0;
            body.mtime = Timespec::now();
            body.ctime = body.mtime;
            body.atime = body.mtime;
            body.state = InodeState::Valid;
            mark_dirty(&self.dirty, &inode, &mut body);
            body.to_dinode()
                .to_record()
                .map_err(|e| WalfsError::Format(e.to_string()))?
        };
        txn.append(LogEntryType::InodeCreate, inum, LogPayload::None, &record)?;
        Ok(inode)
    }

    /// Log the current in-memory record of `inode` as an update.
    pub fn update_inode(&self, txn: &mut Transaction, inode: &Arc<Inode>) -> Result<()> {
        let record = inode
            .body
            .read()
            .to_dinode()
            .to_record()
            .map_err(|e| WalfsError::Format(e.to_string()))?;
        txn.append(LogEntryType::InodeUpdate, inode.inum, LogPayload::None, &record)
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Blocks a `write_file` of `len` bytes can consume from the log, for
    /// sizing `begin_op`.
    #[must_use]
    pub fn write_footprint(len: usize) -> u64 {
        blocks_for_bytes(len as u64) + 1
    }

    /// Log a file write. Data lands in the data region when the entry is
    /// digested; the in-memory inode reflects the new size immediately.
    pub fn write_file(
        &self,
        txn: &mut Transaction,
        inode: &Arc<Inode>,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        txn.append(
            LogEntryType::File,
            inode.inum,
            LogPayload::FileOffset(offset),
            data,
        )?;
        let mut body = inode.body.write();
        let end = offset + data.len() as u64;
        if end > body.size {
            body.size = end;
        }
        body.mtime = Timespec::now();
        mark_dirty(&self.dirty, inode, &mut body);
        Ok(())
    }

    /// Read through the extent tables. Holes read as zeroes; reads past
    /// the current size are truncated.
    pub fn read_file(&self, inode: &Arc<Inode>, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut body = inode.body.write();
        if offset >= body.size {
            return Ok(Vec::new());
        }
        let len = len.min((body.size - offset) as usize);
        let mut out = vec![0_u8; len];
        let mut done = 0_usize;
        while done < len {
            let pos = offset + done as u64;
            let lblk = u32::try_from(pos / u64::from(BLOCK_SIZE))
                .map_err(|_| WalfsError::InvalidState("file offset exceeds addressable blocks"))?;
            let in_block = (pos % u64::from(BLOCK_SIZE)) as usize;
            let chunk = (BLOCK_SIZE as usize - in_block).min(len - done);
            if let Some(phys) =
                body.resolve_block(&*self.dev, &self.data_alloc, lblk, ResolveMode::Lookup)?
            {
                let buf = self.dev.read_block(phys)?;
                out[done..done + chunk].copy_from_slice(&buf.as_slice()[in_block..in_block + chunk]);
            }
            done += chunk;
        }
        Ok(out)
    }

    // ── Directories ─────────────────────────────────────────────────────

    pub fn lookup(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<InodeNumber> {
        self.icache
            .lookup_entry(&*self.dev, &self.data_alloc, dir, name)
    }

    /// Log a directory entry addition and make it visible in the cache.
    pub fn dir_add(
        &self,
        txn: &mut Transaction,
        dir: &Arc<Inode>,
        name: &[u8],
        child: InodeNumber,
    ) -> Result<()> {
        validate_dirent_name(name).map_err(|e| WalfsError::Format(e.to_string()))?;
        txn.append(
            LogEntryType::DirAdd,
            dir.inum,
            LogPayload::DirChild(child),
            name,
        )?;
        dir.cache_entry(name, child);
        let mut body = dir.body.write();
        body.mtime = Timespec::now();
        mark_dirty(&self.dirty, dir, &mut body);
        Ok(())
    }

    /// Log a rename of `child`'s entry to `new_name`.
    pub fn dir_rename(
        &self,
        txn: &mut Transaction,
        dir: &Arc<Inode>,
        old_name: &[u8],
        new_name: &[u8],
        child: InodeNumber,
    ) -> Result<()> {
        validate_dirent_name(new_name).map_err(|e| WalfsError::Format(e.to_string()))?;
        txn.append(
            LogEntryType::DirRename,
            dir.inum,
            LogPayload::DirChild(child),
            new_name,
        )?;
        dir.uncache_entry(old_name);
        dir.cache_entry(new_name, child);
        let mut body = dir.body.write();
        body.mtime = Timespec::now();
        mark_dirty(&self.dirty, dir, &mut body);
        Ok(())
    }

    /// Log removal of `name` from `dir` without touching the child's
    /// link count (rename plumbing, hard-link removal done elsewhere).
    pub fn dir_remove(
        &self,
        txn: &mut Transaction,
        dir: &Arc<Inode>,
        name: &[u8],
        child: InodeNumber,
    ) -> Result<()> {
        txn.append(
            LogEntryType::DirDel,
            dir.inum,
            LogPayload::DirChild(child),
            name,
        )?;
        dir.uncache_entry(name);
        let mut body = dir.body.write();
        body.mtime = Timespec::now();
        mark_dirty(&self.dirty, dir, &mut body);
        Ok(())
    }

    /// Log removal of `name` from `dir` and one link drop on `child`;
    /// the final link drop marks the inode for deletion.
    pub fn unlink(
        &self,
        txn: &mut Transaction,
        dir: &Arc<Inode>,
        name: &[u8],
        child: &Arc<Inode>,
    ) -> Result<()> {
        txn.append(
            LogEntryType::DirDel,
            dir.inum,
            LogPayload::DirChild(child.inum),
            name,
        )?;
        txn.append(LogEntryType::Unlink, child.inum, LogPayload::None, &[])?;

        dir.uncache_entry(name);
        {
            let mut body = dir.body.write();
            body.mtime = Timespec::now();
            mark_dirty(&self.dirty, dir, &mut body);
        }
        let mut body = child.body.write();
        body.nlink = body.nlink.saturating_sub(1);
        if body.nlink == 0 {
            body.state = InodeState::Deleting;
        }
        Ok(())
    }

    // ── Field mutators (policy-agnostic; authorization is the caller's) ─

    pub fn set_perms(&self, inode: &Arc<Inode>, perms: u16) {
        let mut body = inode.body.write();
        body.perms = perms;
        body.ctime = Timespec::now();
        mark_dirty(&self.dirty, inode, &mut body);
    }

    pub fn set_owner(&self, inode: &Arc<Inode>, uid: u32, gid: u32) {
        let mut body = inode.body.write();
        body.uid = uid;
        body.gid = gid;
        body.ctime = Timespec::now();
        mark_dirty(&self.dirty, inode, &mut body);
    }

    // ── Stat-style readers ──────────────────────────────────────────────

    /// The persistent inode record, as `stat` would see it.
    pub fn stat(&self, inum: InodeNumber) -> Result<Dinode> {
        if inum.0 >= self.geometry.ninodes {
            return Err(WalfsError::NotFound(format!("inode {inum} out of range")));
        }
        let (block, offset) = self.geometry.inode_location(inum);
        let buf = self.dev.read_block(block)?;
        Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + INODE_RECORD_SIZE]).map_err(|e| {
            WalfsError::Corruption {
                block: block.0,
                detail: format!("inode record {inum}: {e}"),
            }
        })
    }

    // ── Flush pass ──────────────────────────────────────────────────────

    /// Log an `InodeUpdate` for every dirty inode, in inode order.
    /// Returns how many were flushed.
    pub fn flush_dirty(&self) -> Result<usize> {
        let mut flushed = 0_usize;
        for inum in self.dirty.snapshot() {
            let inode = self.get_inode(inum)?;
            if inode.body.read().state == InodeState::Deleting {
                self.dirty.remove(inum);
                self.put_inode(inode)?;
                continue;
            }
            let mut txn = self.begin_op(0)?;
            self.update_inode(&mut txn, &inode)?;
            self.commit_op(txn)?;
            inode.body.write().dirty = false;
            self.dirty.remove(inum);
            self.put_inode(inode)?;
            flushed += 1;
        }
        Ok(flushed)
    }
}

/// Longest directory entry name the engine accepts.
#[must_use]
pub fn max_name_len() -> usize {
    DIRSIZ
}
