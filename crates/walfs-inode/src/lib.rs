#![forbid(unsafe_code)]
//! In-memory inode representation and caches.
//!
//! An inode is loaded from the inode table on first touch and pinned by
//! a reference count while file descriptors or directory caches use it.
//! The body lives behind a `RwLock` (exclusive for mutation, shared for
//! read-mostly paths); the per-directory name cache has its own lighter
//! mutex so lookups never contend with unrelated metadata updates.
//!
//! State machine: `Invalid → Valid → Deleting`. The on-disk mirror in
//! the body is only trustworthy once `Valid`. When the last reference is
//! put and the state is `Deleting`, the inode's blocks and table slot go
//! back to the allocator; otherwise dirty state may be flushed and the
//! inode stays cached.

pub mod extents;

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;
use walfs_alloc::{AllocRole, BlockAllocator};
use walfs_block::BlockDevice;
use walfs_error::{Result, WalfsError};
use walfs_ondisk::{
    AddrTable, DIRBITMAP_SIZE, DIRENTS_PER_BLOCK, Dinode, DiskSuperblock, read_dirent,
};
use walfs_types::{INODE_RECORD_SIZE, InodeNumber, InodeType, Timespec};

pub use extents::{ExtentPath, ResolveMode};

// ── Dirty set ───────────────────────────────────────────────────────────────

/// Inodes awaiting persistence, ordered by inode number so a flush pass
/// visits them deterministically.
#[derive(Debug, Default)]
pub struct DirtySet {
    inner: Mutex<BTreeSet<u32>>,
}

impl DirtySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, inum: InodeNumber) {
        self.inner.lock().insert(inum.0);
    }

    pub fn remove(&self, inum: InodeNumber) {
        self.inner.lock().remove(&inum.0);
    }

    #[must_use]
    pub fn contains(&self, inum: InodeNumber) -> bool {
        self.inner.lock().contains(&inum.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot in ascending inode order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InodeNumber> {
        self.inner.lock().iter().copied().map(InodeNumber).collect()
    }
}

// ── Directory slot bitmap ───────────────────────────────────────────────────

/// Occupancy bitmap over a directory's entry slots.
#[derive(Debug, Clone)]
pub struct DirBitmap {
    words: [u64; DIRBITMAP_SIZE / 64],
}

impl Default for DirBitmap {
    fn default() -> Self {
        Self {
            words: [0; DIRBITMAP_SIZE / 64],
        }
    }
}

impl DirBitmap {
    pub fn set(&mut self, slot: usize) {
        if slot < DIRBITMAP_SIZE {
            self.words[slot / 64] |= 1 << (slot % 64);
        }
    }

    pub fn clear(&mut self, slot: usize) {
        if slot < DIRBITMAP_SIZE {
            self.words[slot / 64] &= !(1 << (slot % 64));
        }
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> bool {
        slot < DIRBITMAP_SIZE && self.words[slot / 64] >> (slot % 64) & 1 == 1
    }

    /// Lowest free slot, if any.
    #[must_use]
    pub fn first_free(&self) -> Option<usize> {
        for (widx, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                return Some(widx * 64 + word.trailing_ones() as usize);
            }
        }
        None
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Inode lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
    /// Allocated in the cache, not yet loaded; the body is untrustworthy.
    Invalid,
    /// Body mirrors (or is ahead of) the on-disk record.
    Valid,
    /// Unlinked; resources are released when the last reference drops.
    Deleting,
}

/// Mutable inode body, guarded by the inode's `RwLock`.
#[derive(Debug)]
pub struct InodeBody {
    pub state: InodeState,
    pub dirty: bool,
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
    /// Extent walk cache; see [`extents`].
    pub previous_path: Option<ExtentPath>,
    /// Occupied directory entry slots.
    pub dirent_bitmap: DirBitmap,
}

impl InodeBody {
    #[must_use]
    pub fn new_invalid() -> Self {
        let mut body = Self::new_for_type(InodeType::None);
        body.state = InodeState::Invalid;
        body
    }

    #[must_use]
    pub fn new_for_type(itype: InodeType) -> Self {
        Self {
            state: InodeState::Valid,
            dirty: false,
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
            previous_path: None,
            dirent_bitmap: DirBitmap::default(),
        }
    }

    /// Adopt an on-disk record.
    pub fn apply_dinode(&mut self, dinode: &Dinode) {
        self.itype = dinode.itype;
        self.nlink = dinode.nlink;
        self.perms = dinode.perms;
        self.uid = dinode.uid;
        self.gid = dinode.gid;
        self.size = dinode.size;
        self.atime = dinode.atime;
        self.ctime = dinode.ctime;
        self.mtime = dinode.mtime;
        self.tables = dinode.tables.clone();
        self.previous_path = None;
        self.state = InodeState::Valid;
    }

    /// Produce the on-disk record for persistence.
    #[must_use]
    pub fn to_dinode(&self) -> Dinode {
        Dinode {
            itype: self.itype,
            nlink: self.nlink,
            perms: self.perms,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
            tables: self.tables.clone(),
        }
    }
}

/// A cached inode. Shared ownership via `Arc`; the cache tracks an
/// explicit reference count for `get`/`put` pairing.
pub struct Inode {
    pub inum: InodeNumber,
    pub body: RwLock<InodeBody>,
    /// Name → child inode cache; its own lock keeps lookups cheap under
    /// read-heavy load.
    de_cache: Mutex<HashMap<Vec<u8>, InodeNumber>>,
}

impl Inode {
    fn new(inum: InodeNumber) -> Self {
        Self {
            inum,
            body: RwLock::new(InodeBody::new_invalid()),
            de_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached directory lookup; `None` means not cached (not proof of
    /// absence).
    #[must_use]
    pub fn cached_entry(&self, name: &[u8]) -> Option<InodeNumber> {
        self.de_cache.lock().get(name).copied()
    }

    pub fn cache_entry(&self, name: &[u8], child: InodeNumber) {
        self.de_cache.lock().insert(name.to_vec(), child);
    }

    pub fn uncache_entry(&self, name: &[u8]) {
        self.de_cache.lock().remove(name);
    }

    pub fn clear_entry_cache(&self) {
        self.de_cache.lock().clear();
    }

    /// Mark for deletion; resources are released when the last reference
    /// is put.
    pub fn mark_deleting(&self) {
        self.body.write().state = InodeState::Deleting;
    }
}

// ── Inode cache ─────────────────────────────────────────────────────────────

struct CacheSlot {
    inode: Arc<Inode>,
    refs: u32,
}

/// The inode cache: number → pinned in-memory inode.
#[derive(Default)]
pub struct InodeCache {
    slots: Mutex<HashMap<u32, CacheSlot>>,
}

impl InodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a reference to `inum`, loading the on-disk record on first
    /// touch.
    pub fn get(
        &self,
        dev: &dyn BlockDevice,
        sb: &DiskSuperblock,
        inum: InodeNumber,
    ) -> Result<Arc<Inode>> {
        if inum.0 >= sb.ninodes {
            return Err(WalfsError::NotFound(format!("inode {inum} out of range")));
        }

        let inode = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(inum.0).or_insert_with(|| CacheSlot {
                inode: Arc::new(Inode::new(inum)),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.inode)
        };

        // Load outside the map lock so unrelated lookups don't stall on
        // device I/O.
        let mut body = inode.body.write();
        if body.state == InodeState::Invalid {
            let (block, offset) = sb.inode_location(inum);
            let buf = dev.read_block(block)?;
            let dinode = Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + INODE_RECORD_SIZE])
                .map_err(|e| WalfsError::Corruption {
                    block: block.0,
                    detail: format!("inode record {inum}: {e}"),
                })?;
            body.apply_dinode(&dinode);
            trace!(%inum, "inode loaded");
        }
        drop(body);

        Ok(inode)
    }

    /// Whether `inum` currently has open references.
    #[must_use]
    pub fn is_referenced(&self, inum: InodeNumber) -> bool {
        self.slots
            .lock()
            .get(&inum.0)
            .is_some_and(|slot| slot.refs > 0)
    }

    /// Flip a cached inode to `Deleting` so the final `put` releases its
    /// resources. Returns whether the inode was cached.
    pub fn mark_deleting_if_cached(&self, inum: InodeNumber) -> bool {
        let slots = self.slots.lock();
        match slots.get(&inum.0) {
            Some(slot) => {
                slot.inode.mark_deleting();
                true
            }
            None => false,
        }
    }

    /// Evict `inum` when no references pin it. Returns whether the slot
    /// was removed (or was never present).
    pub fn evict_unreferenced(&self, inum: InodeNumber) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&inum.0) {
            Some(slot) if slot.refs > 0 => false,
            Some(_) => {
                slots.remove(&inum.0);
                true
            }
            None => true,
        }
    }

    /// Drop one reference to `inode`.
    ///
    /// At zero references a `Deleting` inode has its durable resources
    /// released and its slot evicted. Anything else stays cached; dirty
    /// state remains queued in the dirty set for the logged flush pass
    /// rather than being written to the table directly, so every front-side
    /// mutation reaches disk through the log.
    pub fn put(
        &self,
        dev: &dyn BlockDevice,
        sb: &DiskSuperblock,
        alloc: &BlockAllocator,
        dirty: &DirtySet,
        inode: Arc<Inode>,
    ) -> Result<()> {
        let last = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&inode.inum.0) else {
                return Err(WalfsError::InvalidState("put on an uncached inode"));
            };
            if slot.refs == 0 {
                return Err(WalfsError::InvalidState("put without matching get"));
            }
            slot.refs -= 1;
            slot.refs == 0
        };
        if !last {
            return Ok(());
        }

        if inode.body.read().state == InodeState::Deleting {
            self.release(dev, sb, alloc, dirty, &inode)?;
            self.slots.lock().remove(&inode.inum.0);
        }
        Ok(())
    }

    /// Write the body's record back to the inode table and clear dirty
    /// state.
    pub fn flush_inode(
        &self,
        dev: &dyn BlockDevice,
        sb: &DiskSuperblock,
        dirty: &DirtySet,
        inode: &Arc<Inode>,
    ) -> Result<()> {
        let mut body = inode.body.write();
        if body.state == InodeState::Invalid {
            return Err(WalfsError::InvalidState("flush of an unloaded inode"));
        }
        let (block, offset) = sb.inode_location(inode.inum);
        let mut buf = dev.read_block(block)?.into_inner();
        body.to_dinode()
            .write_to_bytes(&mut buf[offset..offset + INODE_RECORD_SIZE])
            .map_err(|e| WalfsError::Format(e.to_string()))?;
        dev.write_block(block, &buf)?;
        body.dirty = false;
        dirty.remove(inode.inum);
        trace!(inum = %inode.inum, "inode flushed");
        Ok(())
    }

    /// Release a deleted inode's durable resources.
    ///
    /// Works from the on-disk record, not the in-memory body: block
    /// ownership is only durable once the digest has applied the
    /// relevant entries and flushed the record. When the record still
    /// carries links the digest has not caught up yet; only the cache
    /// side is dropped here and the digest's unlink application frees
    /// the blocks (it sees no remaining references).
    fn release(
        &self,
        dev: &dyn BlockDevice,
        sb: &DiskSuperblock,
        alloc: &BlockAllocator,
        dirty: &DirtySet,
        inode: &Arc<Inode>,
    ) -> Result<()> {
        let (block, offset) = sb.inode_location(inode.inum);
        let mut buf = dev.read_block(block)?.into_inner();
        let record = Dinode::parse_from_bytes(&buf[offset..offset + INODE_RECORD_SIZE])
            .map_err(|e| WalfsError::Corruption {
                block: block.0,
                detail: format!("inode record {}: {e}", inode.inum),
            })?;

        if !record.is_free() && record.nlink == 0 {
            let mut mirror = InodeBody::new_for_type(record.itype);
            mirror.apply_dinode(&record);
            for range in mirror.collect_owned_blocks(dev)? {
                alloc.free(range, AllocRole::Data)?;
            }
            buf[offset..offset + INODE_RECORD_SIZE].fill(0);
            dev.write_block(block, &buf)?;
        }

        inode.clear_entry_cache();
        dirty.remove(inode.inum);
        trace!(inum = %inode.inum, "inode released");
        Ok(())
    }

    /// Whether `inum` currently occupies a cache slot, referenced or
    /// not.
    #[must_use]
    pub fn is_cached(&self, inum: InodeNumber) -> bool {
        self.slots.lock().contains_key(&inum.0)
    }

    /// Look up `name` in directory `dir`, consulting the entry cache and
    /// falling back to a scan of the on-disk directory blocks.
    pub fn lookup_entry(
        &self,
        dev: &dyn BlockDevice,
        alloc: &BlockAllocator,
        dir: &Arc<Inode>,
        name: &[u8],
    ) -> Result<InodeNumber> {
        if let Some(child) = dir.cached_entry(name) {
            return Ok(child);
        }

        // Miss: scan directory blocks and repopulate cache and bitmap.
        let mut body = dir.body.write();
        if body.itype != InodeType::Dir {
            return Err(WalfsError::InvalidState("lookup_entry on a non-directory"));
        }
        let nblocks = body.size.div_ceil(u64::from(dev.block_size()));
        let mut found = None;
        for lblk in 0..nblocks {
            let lblk = u32::try_from(lblk)
                .map_err(|_| WalfsError::InvalidState("directory too large"))?;
            let Some(phys) = body.resolve_block(dev, alloc, lblk, ResolveMode::Lookup)? else {
                continue;
            };
            let buf = dev.read_block(phys)?;
            for slot in 0..DIRENTS_PER_BLOCK {
                let global_slot = lblk as usize * DIRENTS_PER_BLOCK + slot;
                match read_dirent(buf.as_slice(), slot).map_err(|e| WalfsError::Corruption {
                    block: phys.0,
                    detail: format!("dirent: {e}"),
                })? {
                    Some((child, entry_name)) => {
                        body.dirent_bitmap.set(global_slot);
                        if entry_name == name {
                            found = Some(child);
                        }
                        dir.de_cache.lock().insert(entry_name, child);
                    }
                    None => body.dirent_bitmap.clear(global_slot),
                }
            }
        }
        drop(body);

        found.ok_or_else(|| WalfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }
}

/// Mark `inode` dirty and enter it into the superblock's dirty set.
pub fn mark_dirty(dirty: &DirtySet, inode: &Arc<Inode>, body: &mut InodeBody) {
    body.dirty = true;
    dirty.insert(inode.inum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use walfs_block::MemBlockDevice;
    use walfs_ondisk::write_dirent;
    use walfs_types::{BLOCK_SIZE, BlockNumber, BlockRange};

    fn test_sb() -> DiskSuperblock {
        DiskSuperblock {
            size: 4096,
            ndatablocks: 3000,
            ninodes: 64,
            nlog: 256,
            inode_start: BlockNumber(1),
            bmap_start: BlockNumber(9),
            datablock_start: BlockNumber(1024),
            log_start: BlockNumber(300),
            loghead: BlockNumber(0),
        }
    }

    fn setup() -> (Arc<MemBlockDevice>, BlockAllocator, DiskSuperblock, InodeCache, DirtySet) {
        let dev = Arc::new(MemBlockDevice::new(BLOCK_SIZE, 4096));
        let alloc = BlockAllocator::new(BlockRange::new(BlockNumber(1024), 3072), 1);
        (dev, alloc, test_sb(), InodeCache::new(), DirtySet::new())
    }

    fn seed_inode(dev: &MemBlockDevice, sb: &DiskSuperblock, inum: InodeNumber, dinode: &Dinode) {
        let (block, offset) = sb.inode_location(inum);
        let mut buf = dev.read_block(block).unwrap().into_inner();
        dinode
            .write_to_bytes(&mut buf[offset..offset + INODE_RECORD_SIZE])
            .unwrap();
        dev.write_block(block, &buf).unwrap();
    }

    #[test]
    fn get_loads_record_once() {
        let (dev, _alloc, sb, cache, _dirty) = setup();
        let mut dinode = Dinode::empty(InodeType::File);
        dinode.nlink = 1;
        dinode.size = 777;
        seed_inode(&dev, &sb, InodeNumber(5), &dinode);

        let inode = cache.get(&*dev, &sb, InodeNumber(5)).unwrap();
        {
            let body = inode.body.read();
            assert_eq!(body.state, InodeState::Valid);
            assert_eq!(body.size, 777);
            assert_eq!(body.itype, InodeType::File);
        }

        let again = cache.get(&*dev, &sb, InodeNumber(5)).unwrap();
        assert!(Arc::ptr_eq(&inode, &again));
    }

    #[test]
    fn get_out_of_range_is_not_found() {
        let (dev, _alloc, sb, cache, _dirty) = setup();
        assert!(matches!(
            cache.get(&*dev, &sb, InodeNumber(64)),
            Err(WalfsError::NotFound(_))
        ));
    }

    #[test]
    fn put_leaves_dirty_inode_queued() {
        let (dev, alloc, sb, cache, dirty) = setup();
        seed_inode(&dev, &sb, InodeNumber(3), &Dinode::empty(InodeType::File));

        let inode = cache.get(&*dev, &sb, InodeNumber(3)).unwrap();
        {
            let mut body = inode.body.write();
            body.size = 12345;
            body.nlink = 1;
            mark_dirty(&dirty, &inode, &mut body);
        }

        cache
            .put(&*dev, &sb, &alloc, &dirty, Arc::clone(&inode))
            .unwrap();
        // Still queued for the flush pass; no direct table write happened.
        assert!(dirty.contains(InodeNumber(3)));
        assert!(cache.is_cached(InodeNumber(3)));
        let (block, offset) = sb.inode_location(InodeNumber(3));
        let buf = dev.read_block(block).unwrap();
        let on_disk = Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + 512]).unwrap();
        assert_eq!(on_disk.size, 0);

        // An explicit flush persists the record and clears the queue.
        cache.flush_inode(&*dev, &sb, &dirty, &inode).unwrap();
        assert!(!dirty.contains(InodeNumber(3)));
        let buf = dev.read_block(block).unwrap();
        let flushed = Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + 512]).unwrap();
        assert_eq!(flushed.size, 12345);
    }

    #[test]
    fn put_without_get_fails_loudly() {
        let (dev, alloc, sb, cache, dirty) = setup();
        seed_inode(&dev, &sb, InodeNumber(3), &Dinode::empty(InodeType::File));
        let inode = cache.get(&*dev, &sb, InodeNumber(3)).unwrap();
        cache.put(&*dev, &sb, &alloc, &dirty, Arc::clone(&inode)).unwrap();
        assert!(matches!(
            cache.put(&*dev, &sb, &alloc, &dirty, inode),
            Err(WalfsError::InvalidState(_))
        ));
    }

    #[test]
    fn deleting_inode_releases_blocks_and_slot() {
        let (dev, alloc, sb, cache, dirty) = setup();
        seed_inode(&dev, &sb, InodeNumber(9), &Dinode::empty(InodeType::File));

        let inode = cache.get(&*dev, &sb, InodeNumber(9)).unwrap();
        {
            let mut body = inode.body.write();
            for lblk in 0..4 {
                body.resolve_block(&*dev, &alloc, lblk, ResolveMode::Alloc)
                    .unwrap()
                    .unwrap();
            }
        }
        // Make block ownership durable, as the digest would.
        cache.flush_inode(&*dev, &sb, &dirty, &inode).unwrap();
        assert_eq!(alloc.used_blocks(), 4);

        inode.mark_deleting();
        cache.put(&*dev, &sb, &alloc, &dirty, inode).unwrap();
        assert_eq!(alloc.used_blocks(), 0);
        alloc.check_invariants().unwrap();

        // Slot zeroed: a fresh get sees a free record.
        let fresh = cache.get(&*dev, &sb, InodeNumber(9)).unwrap();
        assert_eq!(fresh.body.read().itype, InodeType::None);
    }

    #[test]
    fn deleting_with_live_links_only_drops_cache() {
        let (dev, alloc, sb, cache, dirty) = setup();
        let mut dinode = Dinode::empty(InodeType::File);
        dinode.nlink = 1;
        seed_inode(&dev, &sb, InodeNumber(4), &dinode);

        let inode = cache.get(&*dev, &sb, InodeNumber(4)).unwrap();
        inode.mark_deleting();
        cache.put(&*dev, &sb, &alloc, &dirty, inode).unwrap();
        assert!(!cache.is_cached(InodeNumber(4)));

        // The record survives; the digest owns durable reclamation.
        let (block, offset) = sb.inode_location(InodeNumber(4));
        let buf = dev.read_block(block).unwrap();
        let record = Dinode::parse_from_bytes(&buf.as_slice()[offset..offset + 512]).unwrap();
        assert_eq!(record.itype, InodeType::File);
        assert_eq!(record.nlink, 1);
    }

    #[test]
    fn lookup_entry_scans_and_caches() {
        let (dev, alloc, sb, cache, _dirty) = setup();
        // Build a directory whose first block holds "foo" -> 7.
        let mut dir_block = vec![0_u8; BLOCK_SIZE as usize];
        write_dirent(&mut dir_block, 2, InodeNumber(7), b"foo").unwrap();
        let data_block = BlockNumber(2048);
        dev.write_block(data_block, &dir_block).unwrap();

        let mut dinode = Dinode::empty(InodeType::Dir);
        dinode.nlink = 1;
        dinode.size = u64::from(BLOCK_SIZE);
        dinode.tables[0] = AddrTable::Inline(vec![walfs_ondisk::Extent {
            logical_block: 0,
            len: 1,
            physical_start: data_block.0,
        }]);
        seed_inode(&dev, &sb, InodeNumber(1), &dinode);

        let dir = cache.get(&*dev, &sb, InodeNumber(1)).unwrap();
        assert_eq!(
            cache.lookup_entry(&*dev, &alloc, &dir, b"foo").unwrap(),
            InodeNumber(7)
        );
        // Served from cache now.
        assert_eq!(dir.cached_entry(b"foo"), Some(InodeNumber(7)));
        // Bitmap learned the occupied slot.
        assert!(dir.body.read().dirent_bitmap.get(2));
        assert!(!dir.body.read().dirent_bitmap.get(3));

        assert!(matches!(
            cache.lookup_entry(&*dev, &alloc, &dir, b"bar"),
            Err(WalfsError::NotFound(_))
        ));
    }

    #[test]
    fn dirty_set_orders_by_inode_number() {
        let dirty = DirtySet::new();
        dirty.insert(InodeNumber(9));
        dirty.insert(InodeNumber(2));
        dirty.insert(InodeNumber(5));
        assert_eq!(
            dirty.snapshot(),
            vec![InodeNumber(2), InodeNumber(5), InodeNumber(9)]
        );
        dirty.remove(InodeNumber(5));
        assert_eq!(dirty.snapshot(), vec![InodeNumber(2), InodeNumber(9)]);
    }

    #[test]
    fn dir_bitmap_first_free() {
        let mut bm = DirBitmap::default();
        assert_eq!(bm.first_free(), Some(0));
        for slot in 0..70 {
            bm.set(slot);
        }
        assert_eq!(bm.first_free(), Some(70));
        bm.clear(3);
        assert_eq!(bm.first_free(), Some(3));
    }
}
