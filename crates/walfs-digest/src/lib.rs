#![forbid(unsafe_code)]
//! Digest/replay engine.
//!
//! Consumes committed log headers in chain order and applies each entry
//! to the persistent inode table, data region, and directory blocks,
//! then reclaims the consumed log blocks. This is how the log becomes
//! the source of truth: crash recovery is just running the digest from
//! the persisted chain head.
//!
//! # Per-header sequence
//!
//! 1. apply every entry, in append order (each application idempotent);
//! 2. persist the free bitmap so the data region's on-disk accounting
//!    matches the allocator;
//! 3. clear the header's in-use flag (the idempotence guard);
//! 4. return the header and its data blocks to the log allocator;
//! 5. advance the persisted chain head.
//!
//! A header that fails validation (missing commit magic, impossible
//! entry count) ends the walk: everything before it stays durable,
//! nothing at or after it is applied.

use tracing::{debug, warn};
use walfs_alloc::{AllocRole, BlockAllocator};
use walfs_block::BlockDevice;
use walfs_error::{Result, WalfsError};
use walfs_inode::{DirtySet, InodeBody, InodeCache, ResolveMode, mark_dirty};
use walfs_journal::LogManager;
use walfs_ondisk::{
    DIRENTS_PER_BLOCK, Dinode, DiskSuperblock, LogEntry, LogEntryType,
    LogHeader, LogPayload, bitmap::bitmap_clear, bitmap::bitmap_get, clear_dirent, patch_inuse,
    read_dirent, write_dirent,
};
use walfs_types::{
    BLOCK_SIZE, BlockNumber, BlockRange, INODE_RECORD_SIZE, InodeNumber, blocks_for_bytes,
};

/// Everything the digest needs from the mounted superblock context.
pub struct DigestContext<'a> {
    pub dev: &'a dyn BlockDevice,
    pub sb: &'a DiskSuperblock,
    pub data_alloc: &'a BlockAllocator,
    pub icache: &'a InodeCache,
    pub dirty: &'a DirtySet,
    pub log: &'a LogManager,
}

/// Walk committed headers from the chain head and apply them, at most
/// `up_to` of them when given. Returns the number applied.
///
/// Already-digested headers (in-use flag clear) are skipped but their
/// blocks are still reclaimed; that is the crash window between
/// flag-clear and reclamation.
pub fn digest(ctx: &DigestContext<'_>, up_to: Option<usize>) -> Result<usize> {
    let mut applied = 0_usize;
    let mut cursor = ctx.log.chain_head();

    while cursor.0 != 0 {
        if up_to.is_some_and(|limit| applied >= limit) {
            break;
        }

        let buf = ctx.dev.read_block(cursor)?;
        let header = match LogHeader::parse_from_block(buf.as_slice()) {
            Ok(header) => header,
            Err(e) => {
                warn!(block = cursor.0, error = %e, "digest stopped at invalid header");
                break;
            }
        };

        if header.inuse {
            apply_header(ctx, cursor, &header)?;
            write_bitmap(ctx.dev, ctx.sb, ctx.data_alloc)?;
            // Applied state must be durable before the idempotence guard
            // flips, or a crash could strand a half-applied header marked
            // done.
            ctx.dev.sync()?;

            let mut image = ctx.dev.read_block(cursor)?.into_inner();
            patch_inuse(&mut image, false).map_err(|e| WalfsError::Format(e.to_string()))?;
            ctx.dev.write_block(cursor, &image)?;
            ctx.dev.sync()?;
            applied += 1;
            debug!(header = cursor.0, entries = header.entries.len(), "header digested");
        }

        reclaim_log_blocks(ctx, cursor, &header)?;
        ctx.log.advance_head(header.next_loghdr_blkno)?;
        cursor = header.next_loghdr_blkno;
    }

    Ok(applied)
}

fn reclaim_log_blocks(
    ctx: &DigestContext<'_>,
    hdr_block: BlockNumber,
    header: &LogHeader,
) -> Result<()> {
    let log_alloc = ctx.log.allocator();
    log_alloc.free(BlockRange::new(hdr_block, 1), AllocRole::Log)?;
    for entry in &header.entries {
        if !entry.is_inline() {
            log_alloc.free(
                BlockRange::new(entry.block, blocks_for_bytes(u64::from(entry.length))),
                AllocRole::Log,
            )?;
        }
    }
    Ok(())
}

// ── Entry application ───────────────────────────────────────────────────────

/// Sequential reader over a header's payloads: inline payloads are
/// consumed from the extension area in entry order, block payloads are
/// read from the log data blocks.
struct PayloadReader<'a> {
    dev: &'a dyn BlockDevice,
    header: &'a LogHeader,
    ext_cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(dev: &'a dyn BlockDevice, header: &'a LogHeader) -> Self {
        Self {
            dev,
            header,
            ext_cursor: 0,
        }
    }

    fn payload(&mut self, hdr_block: BlockNumber, entry: &LogEntry) -> Result<Vec<u8>> {
        let len = entry.length as usize;
        if entry.is_inline() {
            let end = self.ext_cursor + len;
            if end > self.header.ext.len() {
                return Err(WalfsError::CorruptLogEntry {
                    block: hdr_block.0,
                    detail: "inline payload overruns extension area".to_owned(),
                });
            }
            let bytes = self.header.ext[self.ext_cursor..end].to_vec();
            self.ext_cursor = end;
            return Ok(bytes);
        }

        let mut bytes = Vec::with_capacity(len);
        let nblocks = blocks_for_bytes(len as u64);
        for i in 0..nblocks {
            let buf = self.dev.read_block(BlockNumber(entry.block.0 + i))?;
            bytes.extend_from_slice(buf.as_slice());
        }
        bytes.truncate(len);
        Ok(bytes)
    }
}

fn apply_header(ctx: &DigestContext<'_>, hdr_block: BlockNumber, header: &LogHeader) -> Result<()> {
    let mut reader = PayloadReader::new(ctx.dev, header);
    for entry in &header.entries {
        let payload = reader.payload(hdr_block, entry)?;
        match entry.entry_type {
            LogEntryType::InodeCreate | LogEntryType::InodeUpdate => {
                apply_inode_record(ctx, hdr_block, entry, &payload)?;
            }
            LogEntryType::File => apply_file(ctx, hdr_block, entry, &payload)?,
            LogEntryType::DirAdd => apply_dir_add(ctx, hdr_block, entry, &payload)?,
            LogEntryType::DirRename => apply_dir_rename(ctx, hdr_block, entry, &payload)?,
            LogEntryType::DirDel => apply_dir_del(ctx, entry, &payload)?,
            LogEntryType::Unlink => apply_unlink(ctx, entry)?,
        }
    }
    Ok(())
}

/// `InodeCreate` / `InodeUpdate`: overwrite the on-disk inode record
/// with the logged image.
///
/// A replayed create finds the slot already live and skips: the record
/// on disk is at least as new as the logged one, and wiping it would
/// discard mappings installed by entries applied after it.
fn apply_inode_record(
    ctx: &DigestContext<'_>,
    hdr_block: BlockNumber,
    entry: &LogEntry,
    payload: &[u8],
) -> Result<()> {
    if payload.len() != INODE_RECORD_SIZE {
        return Err(WalfsError::CorruptLogEntry {
            block: hdr_block.0,
            detail: format!("inode record payload is {} bytes", payload.len()),
        });
    }
    let (block, offset) = ctx.sb.inode_location(entry.inode_no);
    let mut buf = ctx.dev.read_block(block)?.into_inner();
    if entry.entry_type == LogEntryType::InodeCreate {
        let existing = Dinode::parse_from_bytes(&buf[offset..offset + INODE_RECORD_SIZE])
            .map_err(|e| WalfsError::Corruption {
                block: block.0,
                detail: format!("inode record {}: {e}", entry.inode_no),
            })?;
        if !existing.is_free() {
            return Ok(());
        }
    }
    buf[offset..offset + INODE_RECORD_SIZE].copy_from_slice(payload);
    ctx.dev.write_block(block, &buf)
}

/// `File`: copy logged data into the data region at the recorded file
/// offset, growing the extent mapping for blocks past the current
/// allocation.
fn apply_file(
    ctx: &DigestContext<'_>,
    hdr_block: BlockNumber,
    entry: &LogEntry,
    payload: &[u8],
) -> Result<()> {
    let LogPayload::FileOffset(offset) = entry.payload else {
        return Err(WalfsError::CorruptLogEntry {
            block: hdr_block.0,
            detail: "file entry without an offset payload".to_owned(),
        });
    };

    let inode = ctx.icache.get(ctx.dev, ctx.sb, entry.inode_no)?;
    {
        let mut body = inode.body.write();
        let block_size = BLOCK_SIZE as usize;
        let mut written = 0_usize;
        while written < payload.len() {
            let pos = offset + written as u64;
            let lblk = u32::try_from(pos / u64::from(BLOCK_SIZE)).map_err(|_| {
                WalfsError::CorruptLogEntry {
                    block: hdr_block.0,
                    detail: "file offset exceeds addressable blocks".to_owned(),
                }
            })?;
            let in_block = (pos % u64::from(BLOCK_SIZE)) as usize;
            let chunk = (block_size - in_block).min(payload.len() - written);

            let phys = body
                .resolve_block(ctx.dev, ctx.data_alloc, lblk, ResolveMode::Alloc)?
                .ok_or(WalfsError::InvalidState("alloc-mode resolve returned hole"))?;

            let mut img = ctx.dev.read_block(phys)?.into_inner();
            img[in_block..in_block + chunk].copy_from_slice(&payload[written..written + chunk]);
            ctx.dev.write_block(phys, &img)?;
            written += chunk;
        }

        let end = offset + payload.len() as u64;
        if end > body.size {
            body.size = end;
        }
        mark_dirty(ctx.dirty, &inode, &mut body);
    }
    ctx.icache.flush_inode(ctx.dev, ctx.sb, ctx.dirty, &inode)?;
    ctx.icache
        .put(ctx.dev, ctx.sb, ctx.data_alloc, ctx.dirty, inode)
}

/// Scan `dir`'s on-disk entry blocks for the first entry matching
/// `pred`, rebuilding the occupancy bitmap from disk along the way.
///
/// The digest must not consult the in-memory name cache here: the front
/// side populates it optimistically when it logs the operation, so only
/// the blocks themselves say whether an entry has been applied.
fn find_dirent_slot(
    ctx: &DigestContext<'_>,
    body: &mut InodeBody,
    pred: impl Fn(InodeNumber, &[u8]) -> bool,
) -> Result<Option<(usize, BlockNumber)>> {
    let mut found = None;
    body.dirent_bitmap = walfs_inode::DirBitmap::default();
    let nblocks = body.size.div_ceil(u64::from(BLOCK_SIZE));
    for lblk in 0..nblocks {
        let lblk = u32::try_from(lblk)
            .map_err(|_| WalfsError::InvalidState("directory too large"))?;
        let Some(phys) = body.resolve_block(ctx.dev, ctx.data_alloc, lblk, ResolveMode::Lookup)?
        else {
            continue;
        };
        let buf = ctx.dev.read_block(phys)?;
        for slot in 0..DIRENTS_PER_BLOCK {
            let global_slot = lblk as usize * DIRENTS_PER_BLOCK + slot;
            if let Some((inum, name)) =
                read_dirent(buf.as_slice(), slot).map_err(|e| WalfsError::Corruption {
                    block: phys.0,
                    detail: format!("dirent: {e}"),
                })?
            {
                body.dirent_bitmap.set(global_slot);
                if found.is_none() && pred(inum, &name) {
                    found = Some((global_slot, phys));
                }
            }
        }
    }
    Ok(found)
}

fn rewrite_dirent_slot(
    ctx: &DigestContext<'_>,
    phys: BlockNumber,
    slot_in_block: usize,
    entry: Option<(InodeNumber, &[u8])>,
) -> Result<()> {
    let mut buf = ctx.dev.read_block(phys)?.into_inner();
    match entry {
        Some((inum, name)) => write_dirent(&mut buf, slot_in_block, inum, name),
        None => clear_dirent(&mut buf, slot_in_block),
    }
    .map_err(|e| WalfsError::Corruption {
        block: phys.0,
        detail: format!("dirent write: {e}"),
    })?;
    ctx.dev.write_block(phys, &buf)
}

/// `DirAdd`: insert (or re-point) a name → child mapping in the parent
/// directory, using the occupancy bitmap to find a slot.
fn apply_dir_add(
    ctx: &DigestContext<'_>,
    hdr_block: BlockNumber,
    entry: &LogEntry,
    name: &[u8],
) -> Result<()> {
    let LogPayload::DirChild(child) = entry.payload else {
        return Err(WalfsError::CorruptLogEntry {
            block: hdr_block.0,
            detail: "dir-add entry without a child payload".to_owned(),
        });
    };

    let dir = ctx.icache.get(ctx.dev, ctx.sb, entry.inode_no)?;
    {
        let mut body = dir.body.write();
        // On-disk truth only: the front side caches the name before the
        // entry is applied, so the blocks decide whether this is a
        // replay. The scan also rebuilds the occupancy bitmap.
        if find_dirent_slot(ctx, &mut body, |inum, n| inum == child && n == name)?.is_some() {
            // Replayed; the entry is already on disk.
        } else if let Some((slot, phys)) = find_dirent_slot(ctx, &mut body, |_, n| n == name)? {
            // Same name, different child: replay in order means this
            // add wins for now.
            rewrite_dirent_slot(ctx, phys, slot % DIRENTS_PER_BLOCK, Some((child, name)))?;
        } else {
            let slot = body
                .dirent_bitmap
                .first_free()
                .ok_or(WalfsError::InvalidState("directory slot bitmap exhausted"))?;
            let lblk = (slot / DIRENTS_PER_BLOCK) as u32;
            let phys = body
                .resolve_block(ctx.dev, ctx.data_alloc, lblk, ResolveMode::Alloc)?
                .ok_or(WalfsError::InvalidState("alloc-mode resolve returned hole"))?;
            rewrite_dirent_slot(ctx, phys, slot % DIRENTS_PER_BLOCK, Some((child, name)))?;
            body.dirent_bitmap.set(slot);
            let covered = (u64::from(lblk) + 1) * u64::from(BLOCK_SIZE);
            if covered > body.size {
                body.size = covered;
            }
        }
        mark_dirty(ctx.dirty, &dir, &mut body);
    }
    dir.cache_entry(name, child);
    ctx.icache.flush_inode(ctx.dev, ctx.sb, ctx.dirty, &dir)?;
    ctx.icache.put(ctx.dev, ctx.sb, ctx.data_alloc, ctx.dirty, dir)
}

/// `DirRename`: rewrite the name of the child's entry in place.
fn apply_dir_rename(
    ctx: &DigestContext<'_>,
    hdr_block: BlockNumber,
    entry: &LogEntry,
    new_name: &[u8],
) -> Result<()> {
    let LogPayload::DirChild(child) = entry.payload else {
        return Err(WalfsError::CorruptLogEntry {
            block: hdr_block.0,
            detail: "dir-rename entry without a child payload".to_owned(),
        });
    };

    let dir = ctx.icache.get(ctx.dev, ctx.sb, entry.inode_no)?;
    let result = (|| {
        let mut body = dir.body.write();
        let found = find_dirent_slot(ctx, &mut body, |inum, name| {
            inum == child && name != new_name
        })?;
        match found {
            Some((slot, phys)) => {
                rewrite_dirent_slot(ctx, phys, slot % DIRENTS_PER_BLOCK, Some((child, new_name)))?;
                mark_dirty(ctx.dirty, &dir, &mut body);
            }
            None => {
                // Entry already carries the new name (replay); verify.
                if find_dirent_slot(ctx, &mut body, |inum, name| {
                    inum == child && name == new_name
                })?
                .is_none()
                {
                    return Err(WalfsError::CorruptLogEntry {
                        block: hdr_block.0,
                        detail: format!("rename target inode {child} has no directory entry"),
                    });
                }
            }
        }
        Ok(())
    })();

    // The old name is unknown here, so the whole name cache resets.
    dir.clear_entry_cache();
    dir.cache_entry(new_name, child);
    ctx.icache.flush_inode(ctx.dev, ctx.sb, ctx.dirty, &dir)?;
    ctx.icache
        .put(ctx.dev, ctx.sb, ctx.data_alloc, ctx.dirty, dir)?;
    result
}

/// `DirDel`: clear the named entry and release its slot.
fn apply_dir_del(ctx: &DigestContext<'_>, entry: &LogEntry, name: &[u8]) -> Result<()> {
    let dir = ctx.icache.get(ctx.dev, ctx.sb, entry.inode_no)?;
    {
        let mut body = dir.body.write();
        if let Some((slot, phys)) = find_dirent_slot(ctx, &mut body, |_, n| n == name)? {
            rewrite_dirent_slot(ctx, phys, slot % DIRENTS_PER_BLOCK, None)?;
            body.dirent_bitmap.clear(slot);
            mark_dirty(ctx.dirty, &dir, &mut body);
        }
        // Absent entry: already applied.
    }
    dir.uncache_entry(name);
    ctx.icache.flush_inode(ctx.dev, ctx.sb, ctx.dirty, &dir)?;
    ctx.icache.put(ctx.dev, ctx.sb, ctx.data_alloc, ctx.dirty, dir)
}

/// `Unlink`: drop one link; at zero links with no open references,
/// release the inode's blocks and its table slot.
fn apply_unlink(ctx: &DigestContext<'_>, entry: &LogEntry) -> Result<()> {
    let inum = entry.inode_no;
    let (block, offset) = ctx.sb.inode_location(inum);
    let mut buf = ctx.dev.read_block(block)?.into_inner();
    let mut dinode = Dinode::parse_from_bytes(&buf[offset..offset + INODE_RECORD_SIZE])
        .map_err(|e| WalfsError::Corruption {
            block: block.0,
            detail: format!("inode record {inum}: {e}"),
        })?;

    if dinode.is_free() {
        return Ok(()); // already reclaimed (replay)
    }

    dinode.nlink = dinode.nlink.saturating_sub(1);
    if dinode.nlink > 0 {
        dinode
            .write_to_bytes(&mut buf[offset..offset + INODE_RECORD_SIZE])
            .map_err(|e| WalfsError::Format(e.to_string()))?;
        return ctx.dev.write_block(block, &buf);
    }

    if ctx.icache.is_referenced(inum) {
        // Open references remain: persist the zero link count and let
        // the final put release the resources.
        dinode
            .write_to_bytes(&mut buf[offset..offset + INODE_RECORD_SIZE])
            .map_err(|e| WalfsError::Format(e.to_string()))?;
        ctx.dev.write_block(block, &buf)?;
        ctx.icache.mark_deleting_if_cached(inum);
        return Ok(());
    }

    ctx.icache.evict_unreferenced(inum);
    let mut body = InodeBody::new_for_type(dinode.itype);
    body.apply_dinode(&dinode);
    for range in body.collect_owned_blocks(ctx.dev)? {
        ctx.data_alloc.free(range, AllocRole::Data)?;
    }
    ctx.dirty.remove(inum);

    buf[offset..offset + INODE_RECORD_SIZE].fill(0);
    ctx.dev.write_block(block, &buf)?;
    debug!(%inum, "inode reclaimed by unlink");
    Ok(())
}

// ── Free-bitmap persistence ─────────────────────────────────────────────────

/// Persist the data-region free bitmap from the allocator's state.
///
/// One bit per data block, set = in use, indexed relative to
/// `datablock_start`. The log region is deliberately not covered: the
/// committed chain itself is the log region's on-disk truth.
pub fn write_bitmap(
    dev: &dyn BlockDevice,
    sb: &DiskSuperblock,
    data_alloc: &BlockAllocator,
) -> Result<()> {
    let nbits = sb.ndatablocks;
    let nbytes = usize::try_from(nbits.div_ceil(8))
        .map_err(|_| WalfsError::InvalidState("bitmap larger than address space"))?;
    let mut bits = vec![0xFF_u8; nbytes];
    for (low, high) in data_alloc.free_ranges() {
        for block in low..=high {
            if block >= sb.datablock_start.0 {
                let bit = block - sb.datablock_start.0;
                if bit < nbits {
                    bitmap_clear(&mut bits, bit);
                }
            }
        }
    }

    let block_size = dev.block_size() as usize;
    let nblocks = walfs_ondisk::bitmap::bitmap_blocks_for(nbits, dev.block_size());
    for i in 0..nblocks {
        let mut buf = vec![0_u8; block_size];
        let start = i as usize * block_size;
        if start < bits.len() {
            let end = (start + block_size).min(bits.len());
            buf[..end - start].copy_from_slice(&bits[start..end]);
        }
        dev.write_block(BlockNumber(sb.bmap_start.0 + i), &buf)?;
    }
    Ok(())
}

/// Read the data-region free bitmap into a byte vector.
pub fn read_bitmap(dev: &dyn BlockDevice, sb: &DiskSuperblock) -> Result<Vec<u8>> {
    let nblocks = walfs_ondisk::bitmap::bitmap_blocks_for(sb.ndatablocks, dev.block_size());
    let mut bits = Vec::with_capacity((nblocks * u64::from(dev.block_size())) as usize);
    for i in 0..nblocks {
        let buf = dev.read_block(BlockNumber(sb.bmap_start.0 + i))?;
        bits.extend_from_slice(buf.as_slice());
    }
    Ok(bits)
}

/// Whether data block `block` is marked used in a bitmap read by
/// [`read_bitmap`].
#[must_use]
pub fn bitmap_block_used(bits: &[u8], sb: &DiskSuperblock, block: BlockNumber) -> bool {
    if block.0 < sb.datablock_start.0 {
        return true;
    }
    bitmap_get(bits, block.0 - sb.datablock_start.0)
}

// ── Recovery support ────────────────────────────────────────────────────────

/// Pin the committed chain's blocks in the log allocator at mount time,
/// before any fresh reservation can clobber them. Walks from the
/// persisted head; stops at the first invalid header.
pub fn reserve_log_chain(
    dev: &dyn BlockDevice,
    sb: &DiskSuperblock,
    log_alloc: &BlockAllocator,
) -> Result<()> {
    let mut cursor = sb.loghead;
    while cursor.0 != 0 {
        let buf = dev.read_block(cursor)?;
        let Ok(header) = LogHeader::parse_from_block(buf.as_slice()) else {
            break;
        };
        log_alloc.reserve_range(BlockRange::new(cursor, 1), AllocRole::Log)?;
        for entry in &header.entries {
            if !entry.is_inline() {
                log_alloc.reserve_range(
                    BlockRange::new(entry.block, blocks_for_bytes(u64::from(entry.length))),
                    AllocRole::Log,
                )?;
            }
        }
        cursor = header.next_loghdr_blkno;
    }
    Ok(())
}
