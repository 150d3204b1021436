//! Logical-to-physical block resolution through the three-level address
//! tables.
//!
//! Each level is either a handful of inline extents in the inode record
//! or one level of index entries pointing at extent leaf blocks. Lookups
//! search l1 first, then l2, then l3; allocation and forced mapping
//! operate on l1; the lower levels are populated only by data migration,
//! which lives outside this engine.
//!
//! The per-inode `previous_path` cache remembers the extents of the leaf
//! (or inline table) visited last, so sequential access does not re-walk
//! the index level for every block.

use walfs_alloc::{AllocRole, BlockAllocator};
use walfs_block::BlockDevice;
use walfs_error::{Result, WalfsError};
use walfs_ondisk::{
    ADDR_TABLE_SLOTS, AddrTable, EXTENTS_PER_LEAF, Extent, IndexEntry, parse_extent_leaf,
    write_extent_leaf,
};
use walfs_types::{BlockNumber, BlockRange};

use crate::InodeBody;

/// Lookup semantics for [`InodeBody::resolve_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Map only; a hole yields `Ok(None)`.
    Lookup,
    /// Allocate a fresh block for a hole and install the mapping.
    Alloc,
    /// Install a mapping to the given block, allocating nothing.
    Set(BlockNumber),
}

/// Cached tail of the last extent walk.
#[derive(Debug, Clone)]
pub struct ExtentPath {
    /// Level the path was taken from (0-based).
    pub level: usize,
    /// Leaf block the extents were read from; `None` for inline tables.
    pub leaf_block: Option<BlockNumber>,
    /// Snapshot of the leaf's extents.
    pub extents: Vec<Extent>,
}

impl ExtentPath {
    fn find(&self, lblk: u32) -> Option<BlockNumber> {
        search_extents(&self.extents, lblk)
    }
}

fn search_extents(extents: &[Extent], lblk: u32) -> Option<BlockNumber> {
    let idx = extents.partition_point(|e| e.logical_block <= lblk);
    idx.checked_sub(1).and_then(|i| extents[i].map(lblk))
}

/// Index entry whose leaf covers `lblk` (the last one starting at or
/// below it).
fn index_slot_for(indexes: &[IndexEntry], lblk: u32) -> Option<usize> {
    let idx = indexes.partition_point(|e| e.logical_block <= lblk);
    idx.checked_sub(1)
}

impl InodeBody {
    /// Map `lblk` to a physical block through the address tables.
    ///
    /// `Alloc` and `Set` mark nothing dirty themselves; the caller owns
    /// dirty tracking (it knows the inode number and the dirty set).
    /// Returns `Ok(Some(_))` with the mapped block, or `Ok(None)` for a
    /// hole under `Lookup`.
    pub fn resolve_block(
        &mut self,
        dev: &dyn BlockDevice,
        alloc: &BlockAllocator,
        lblk: u32,
        mode: ResolveMode,
    ) -> Result<Option<BlockNumber>> {
        // Fast path: the previously walked leaf.
        if let Some(path) = &self.previous_path
            && let Some(phys) = path.find(lblk)
        {
            return Ok(Some(phys));
        }

        for level in 0..self.tables.len() {
            if let Some(phys) = self.search_level(dev, level, lblk)? {
                return Ok(Some(phys));
            }
        }

        match mode {
            ResolveMode::Lookup => Ok(None),
            ResolveMode::Alloc => {
                let range = alloc.allocate_near(1, alloc.last_block_allocated(), AllocRole::Data)?;
                self.insert_extent(
                    dev,
                    alloc,
                    Extent {
                        logical_block: lblk,
                        len: 1,
                        physical_start: range.start.0,
                    },
                )?;
                Ok(Some(range.start))
            }
            ResolveMode::Set(phys) => {
                self.insert_extent(
                    dev,
                    alloc,
                    Extent {
                        logical_block: lblk,
                        len: 1,
                        physical_start: phys.0,
                    },
                )?;
                Ok(Some(phys))
            }
        }
    }

    /// Search one level, refreshing the path cache on an index descent.
    fn search_level(
        &mut self,
        dev: &dyn BlockDevice,
        level: usize,
        lblk: u32,
    ) -> Result<Option<BlockNumber>> {
        match &self.tables[level] {
            AddrTable::Inline(extents) => {
                let hit = search_extents(extents, lblk);
                if hit.is_some() {
                    self.previous_path = Some(ExtentPath {
                        level,
                        leaf_block: None,
                        extents: extents.clone(),
                    });
                }
                Ok(hit)
            }
            AddrTable::Indexed(indexes) => {
                let Some(slot) = index_slot_for(indexes, lblk) else {
                    return Ok(None);
                };
                let leaf_block = BlockNumber(indexes[slot].leaf_block);
                let buf = dev.read_block(leaf_block)?;
                let extents = parse_extent_leaf(buf.as_slice()).map_err(|e| {
                    WalfsError::Corruption {
                        block: leaf_block.0,
                        detail: format!("extent leaf: {e}"),
                    }
                })?;
                let hit = search_extents(&extents, lblk);
                self.previous_path = Some(ExtentPath {
                    level,
                    leaf_block: Some(leaf_block),
                    extents,
                });
                Ok(hit)
            }
        }
    }

    /// Install `ext` into l1, growing the table as needed.
    ///
    /// Growth is append-oriented: when the inline slots fill, they spill
    /// into an allocated leaf block; when a leaf fills, a new leaf is
    /// chained behind a fresh index slot. There is no rebalancing.
    fn insert_extent(
        &mut self,
        dev: &dyn BlockDevice,
        alloc: &BlockAllocator,
        ext: Extent,
    ) -> Result<()> {
        self.previous_path = None;

        match &mut self.tables[0] {
            AddrTable::Inline(extents) => {
                if try_merge(extents, ext) {
                    return Ok(());
                }
                if extents.len() < ADDR_TABLE_SLOTS {
                    insert_sorted(extents, ext);
                    return Ok(());
                }
                // Spill to a leaf block.
                let leaf_range =
                    alloc.allocate_near(1, alloc.last_block_allocated(), AllocRole::Data)?;
                let mut spilled = extents.clone();
                insert_sorted(&mut spilled, ext);
                write_leaf(dev, leaf_range.start, &spilled)?;
                self.tables[0] = AddrTable::Indexed(vec![IndexEntry {
                    logical_block: 0,
                    leaf_block: leaf_range.start.0,
                }]);
                Ok(())
            }
            AddrTable::Indexed(indexes) => {
                let slot = index_slot_for(indexes, ext.logical_block).unwrap_or(0);
                let leaf_block = BlockNumber(indexes[slot].leaf_block);
                let buf = dev.read_block(leaf_block)?;
                let mut extents =
                    parse_extent_leaf(buf.as_slice()).map_err(|e| WalfsError::Corruption {
                        block: leaf_block.0,
                        detail: format!("extent leaf: {e}"),
                    })?;

                if try_merge(&mut extents, ext) {
                    return write_leaf(dev, leaf_block, &extents);
                }
                if extents.len() < EXTENTS_PER_LEAF {
                    insert_sorted(&mut extents, ext);
                    return write_leaf(dev, leaf_block, &extents);
                }

                // Leaf is full; chain a new one for the tail.
                if indexes.len() >= ADDR_TABLE_SLOTS {
                    return Err(WalfsError::Corruption {
                        block: leaf_block.0,
                        detail: "extent index slots exhausted".to_owned(),
                    });
                }
                let last_logical = extents.last().map_or(0, Extent::logical_end);
                if ext.logical_block < last_logical {
                    return Err(WalfsError::Corruption {
                        block: leaf_block.0,
                        detail: "extent insert below a full leaf's coverage".to_owned(),
                    });
                }
                let new_leaf =
                    alloc.allocate_near(1, alloc.last_block_allocated(), AllocRole::Data)?;
                write_leaf(dev, new_leaf.start, &[ext])?;
                indexes.push(IndexEntry {
                    logical_block: ext.logical_block,
                    leaf_block: new_leaf.start.0,
                });
                indexes.sort_by_key(|e| e.logical_block);
                Ok(())
            }
        }
    }

    /// Every block owned by this inode's mappings: data extents plus the
    /// extent leaf blocks themselves. Used when releasing a deleted
    /// inode.
    pub fn collect_owned_blocks(&self, dev: &dyn BlockDevice) -> Result<Vec<BlockRange>> {
        let mut ranges = Vec::new();
        for table in &self.tables {
            match table {
                AddrTable::Inline(extents) => {
                    for ext in extents {
                        ranges.push(BlockRange::new(
                            BlockNumber(ext.physical_start),
                            u64::from(ext.len),
                        ));
                    }
                }
                AddrTable::Indexed(indexes) => {
                    for index in indexes {
                        let leaf_block = BlockNumber(index.leaf_block);
                        let buf = dev.read_block(leaf_block)?;
                        let extents =
                            parse_extent_leaf(buf.as_slice()).map_err(|e| WalfsError::Corruption {
                                block: leaf_block.0,
                                detail: format!("extent leaf: {e}"),
                            })?;
                        for ext in extents {
                            ranges.push(BlockRange::new(
                                BlockNumber(ext.physical_start),
                                u64::from(ext.len),
                            ));
                        }
                        ranges.push(BlockRange::new(leaf_block, 1));
                    }
                }
            }
        }
        Ok(ranges)
    }
}

fn write_leaf(dev: &dyn BlockDevice, block: BlockNumber, extents: &[Extent]) -> Result<()> {
    let image = write_extent_leaf(extents, dev.block_size())
        .map_err(|e| WalfsError::Format(e.to_string()))?;
    dev.write_block(block, &image)
}

/// Extend an existing extent when `ext` continues it logically and
/// physically, or swallow the insert when the mapping already exists.
fn try_merge(extents: &mut [Extent], ext: Extent) -> bool {
    for existing in extents.iter_mut() {
        if existing.map(ext.logical_block).is_some() {
            // Already mapped; replay of an installed mapping is a no-op.
            return true;
        }
        if existing.logical_end() == ext.logical_block
            && existing.physical_start + u64::from(existing.len) == ext.physical_start
        {
            existing.len += ext.len;
            return true;
        }
    }
    false
}

fn insert_sorted(extents: &mut Vec<Extent>, ext: Extent) {
    let idx = extents.partition_point(|e| e.logical_block <= ext.logical_block);
    extents.insert(idx, ext);
}
