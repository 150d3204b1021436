#![forbid(unsafe_code)]
//! Range-based free-space allocation.
//!
//! The allocatable span of the device is divided into logical partitions,
//! each owning a free list: an ordered tree of maximal free block ranges
//! plus allocation statistics, all guarded by one mutex. A designated
//! shared list covers the tail of the span and serves as overflow when a
//! partition is exhausted.
//!
//! ## Invariants
//!
//! - Ranges in a tree never overlap and are maximal: no two adjacent
//!   ranges are both free (free coalesces with both neighbors).
//! - `num_free_blocks` equals the sum of range sizes in the tree.
//! - Statistics are updated under the same lock as the tree mutation they
//!   accompany.
//! - An operation never holds two free-list locks at once; the shared
//!   list is consulted only after the preferred partition's lock has been
//!   released.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use walfs_error::{Result, WalfsError};
use walfs_types::{BlockNumber, BlockRange, PartitionId};

/// Whether an allocation or free is on behalf of the log or file data.
/// Only statistics care; placement does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRole {
    Log,
    Data,
}

/// Per-partition allocation statistics, segregated by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeListStats {
    pub alloc_log_count: u64,
    pub alloc_data_count: u64,
    pub free_log_count: u64,
    pub free_data_count: u64,
    pub alloc_log_pages: u64,
    pub alloc_data_pages: u64,
    pub freed_log_pages: u64,
    pub freed_data_pages: u64,
    /// Sum of all range sizes currently in the tree.
    pub num_free_blocks: u64,
    /// Number of range nodes currently in the tree.
    pub num_blocknode: u64,
}

/// Tree plus statistics; everything the partition lock guards.
#[derive(Debug)]
struct FreeListInner {
    /// range_low -> range_high (inclusive).
    tree: BTreeMap<u64, u64>,
    num_free_blocks: u64,
    stats: FreeListStats,
}

impl FreeListInner {
    fn record_alloc(&mut self, count: u64, role: AllocRole) {
        match role {
            AllocRole::Log => {
                self.stats.alloc_log_count += 1;
                self.stats.alloc_log_pages += count;
            }
            AllocRole::Data => {
                self.stats.alloc_data_count += 1;
                self.stats.alloc_data_pages += count;
            }
        }
    }

    fn record_free(&mut self, count: u64, role: AllocRole) {
        match role {
            AllocRole::Log => {
                self.stats.free_log_count += 1;
                self.stats.freed_log_pages += count;
            }
            AllocRole::Data => {
                self.stats.free_data_count += 1;
                self.stats.freed_data_pages += count;
            }
        }
    }
}

/// One partition's free list.
#[derive(Debug)]
struct FreeList {
    id: PartitionId,
    /// First block of the partition.
    block_start: u64,
    /// Last block of the partition (inclusive).
    block_end: u64,
    inner: Mutex<FreeListInner>,
}

impl FreeList {
    fn new(id: PartitionId, block_start: u64, block_end: u64) -> Self {
        Self {
            id,
            block_start,
            block_end,
            inner: Mutex::new(FreeListInner {
                tree: BTreeMap::new(),
                num_free_blocks: 0,
                stats: FreeListStats::default(),
            }),
        }
    }

    fn is_empty_partition(&self) -> bool {
        self.block_end < self.block_start
    }

    /// Insert a free range at construction time, without touching the
    /// free statistics.
    fn seed(&self, low: u64, high: u64) {
        let mut inner = self.inner.lock();
        inner.num_free_blocks += high - low + 1;
        inner.tree.insert(low, high);
    }

    /// Take `count` blocks, preferring the range closest to `hint`.
    fn allocate(&self, count: u64, hint: u64, role: AllocRole) -> Option<BlockRange> {
        let mut inner = self.inner.lock();

        // A range containing the hint gets carved exactly at the hint so
        // sequential allocations stay physically sequential.
        if let Some((&low, &high)) = inner.tree.range(..=hint).next_back()
            && hint <= high
            && high - hint + 1 >= count
        {
            inner.tree.remove(&low);
            if hint > low {
                inner.tree.insert(low, hint - 1);
            }
            if hint + count <= high {
                inner.tree.insert(hint + count, high);
            }
            inner.num_free_blocks -= count;
            inner.record_alloc(count, role);
            inner.stats.num_free_blocks = inner.num_free_blocks;
            inner.stats.num_blocknode = inner.tree.len() as u64;
            return Some(BlockRange::new(BlockNumber(hint), count));
        }

        // First fit at or after the hint, then wrap to the front.
        let candidate = inner
            .tree
            .range(hint..)
            .find(|&(&low, &high)| high - low + 1 >= count)
            .map(|(&low, _)| low)
            .or_else(|| {
                inner
                    .tree
                    .range(..hint)
                    .find(|&(&low, &high)| high - low + 1 >= count)
                    .map(|(&low, _)| low)
            })?;

        let high = inner.tree.remove(&candidate)?;
        if candidate + count <= high {
            inner.tree.insert(candidate + count, high);
        }
        inner.num_free_blocks -= count;
        inner.record_alloc(count, role);
        inner.stats.num_free_blocks = inner.num_free_blocks;
        inner.stats.num_blocknode = inner.tree.len() as u64;
        Some(BlockRange::new(BlockNumber(candidate), count))
    }

    /// Return a range, coalescing with adjacent free ranges.
    fn free(&self, range: BlockRange, role: AllocRole) -> Result<()> {
        if range.count == 0 {
            return Ok(());
        }
        let low = range.start.0;
        let high = range.last().0;
        if low < self.block_start || high > self.block_end {
            return Err(WalfsError::Corruption {
                block: low,
                detail: format!("free outside partition {} bounds", self.id),
            });
        }

        let mut inner = self.inner.lock();

        // Neighbors by address order. Overlap with either is a double free.
        let pred = inner
            .tree
            .range(..=low)
            .next_back()
            .map(|(&plow, &phigh)| (plow, phigh));
        if let Some((_, phigh)) = pred
            && phigh >= low
        {
            return Err(WalfsError::Corruption {
                block: low,
                detail: "double free: range overlaps an existing free range".to_owned(),
            });
        }
        let succ = inner
            .tree
            .range(low..)
            .next()
            .map(|(&slow, &shigh)| (slow, shigh));
        if let Some((slow, _)) = succ
            && slow <= high
        {
            return Err(WalfsError::Corruption {
                block: low,
                detail: "double free: range overlaps an existing free range".to_owned(),
            });
        }

        let merge_left = pred.filter(|&(_, phigh)| phigh + 1 == low);
        let merge_right = succ.filter(|&(slow, _)| high + 1 == slow);

        match (merge_left, merge_right) {
            (Some((plow, _)), Some((slow, shigh))) => {
                inner.tree.remove(&slow);
                inner.tree.insert(plow, shigh);
            }
            (Some((plow, _)), None) => {
                inner.tree.insert(plow, high);
            }
            (None, Some((slow, shigh))) => {
                inner.tree.remove(&slow);
                inner.tree.insert(low, shigh);
            }
            (None, None) => {
                inner.tree.insert(low, high);
            }
        }

        inner.num_free_blocks += range.count;
        inner.record_free(range.count, role);
        inner.stats.num_free_blocks = inner.num_free_blocks;
        inner.stats.num_blocknode = inner.tree.len() as u64;
        Ok(())
    }

    /// Carve an exact sub-range out of the free tree.
    fn reserve(&self, low: u64, high: u64, role: AllocRole) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some((&rlow, &rhigh)) = inner.tree.range(..=low).next_back() else {
            return Err(WalfsError::Corruption {
                block: low,
                detail: "reserve of blocks not on the free list".to_owned(),
            });
        };
        if rhigh < high {
            return Err(WalfsError::Corruption {
                block: low,
                detail: "reserve of blocks not on the free list".to_owned(),
            });
        }
        inner.tree.remove(&rlow);
        if rlow < low {
            inner.tree.insert(rlow, low - 1);
        }
        if high < rhigh {
            inner.tree.insert(high + 1, rhigh);
        }
        let count = high - low + 1;
        inner.num_free_blocks -= count;
        inner.record_alloc(count, role);
        inner.stats.num_free_blocks = inner.num_free_blocks;
        inner.stats.num_blocknode = inner.tree.len() as u64;
        Ok(())
    }

    fn stats(&self) -> FreeListStats {
        let mut inner = self.inner.lock();
        inner.stats.num_free_blocks = inner.num_free_blocks;
        inner.stats.num_blocknode = inner.tree.len() as u64;
        inner.stats
    }

    /// Verify the free-range invariant: no overlapping or adjacent
    /// ranges, counter in step with the tree.
    fn check_invariant(&self) -> Result<()> {
        let inner = self.inner.lock();
        let mut total = 0_u64;
        let mut prev_high: Option<u64> = None;
        for (&low, &high) in &inner.tree {
            if high < low {
                return Err(WalfsError::Corruption {
                    block: low,
                    detail: "inverted free range".to_owned(),
                });
            }
            if let Some(prev) = prev_high {
                if low <= prev {
                    return Err(WalfsError::Corruption {
                        block: low,
                        detail: "overlapping free ranges".to_owned(),
                    });
                }
                if low == prev + 1 {
                    return Err(WalfsError::Corruption {
                        block: low,
                        detail: "adjacent free ranges not coalesced".to_owned(),
                    });
                }
            }
            total += high - low + 1;
            prev_high = Some(high);
        }
        if total != inner.num_free_blocks {
            return Err(WalfsError::Corruption {
                block: self.block_start,
                detail: format!(
                    "free counter drift: tree holds {total}, counter says {}",
                    inner.num_free_blocks
                ),
            });
        }
        Ok(())
    }
}

/// The block allocator: per-partition free lists plus the shared overflow
/// list, with device-wide counters.
#[derive(Debug)]
pub struct BlockAllocator {
    lists: Vec<FreeList>,
    shared: FreeList,
    span_start: u64,
    per_list_blocks: u64,
    used_blocks: AtomicU64,
    last_block_allocated: AtomicU64,
}

impl BlockAllocator {
    /// Build an allocator over `span` with `n_partitions` per-partition
    /// lists; the tail slice of the span becomes the shared list. All
    /// blocks start free.
    #[must_use]
    pub fn new(span: BlockRange, n_partitions: u32) -> Self {
        let alloc = Self::empty(span, n_partitions);
        for list in alloc.lists.iter().chain(std::iter::once(&alloc.shared)) {
            if !list.is_empty_partition() {
                list.seed(list.block_start, list.block_end);
            }
        }
        alloc
    }

    /// Build an allocator over `span` where `used` reports per-block
    /// occupancy (the on-disk free bitmap at mount time).
    pub fn from_used_bits(
        span: BlockRange,
        n_partitions: u32,
        used: impl Fn(BlockNumber) -> bool,
    ) -> Self {
        let alloc = Self::empty(span, n_partitions);
        let mut used_count = 0_u64;
        for list in alloc.lists.iter().chain(std::iter::once(&alloc.shared)) {
            if list.is_empty_partition() {
                continue;
            }
            let mut run_start: Option<u64> = None;
            for block in list.block_start..=list.block_end {
                if used(BlockNumber(block)) {
                    used_count += 1;
                    if let Some(start) = run_start.take() {
                        list.seed(start, block - 1);
                    }
                } else if run_start.is_none() {
                    run_start = Some(block);
                }
            }
            if let Some(start) = run_start {
                list.seed(start, list.block_end);
            }
        }
        alloc.used_blocks.store(used_count, Ordering::Relaxed);
        alloc
    }

    fn empty(span: BlockRange, n_partitions: u32) -> Self {
        assert!(n_partitions > 0, "allocator needs at least one partition");
        assert!(span.count > 0, "allocator span is empty");

        let per_list_blocks = span.count / (u64::from(n_partitions) + 1);
        assert!(
            per_list_blocks > 0,
            "allocator span too small for partition count"
        );
        let start = span.start.0;
        let mut lists = Vec::with_capacity(n_partitions as usize);
        for id in 0..n_partitions {
            let low = start + u64::from(id) * per_list_blocks;
            let high = low + per_list_blocks - 1;
            lists.push(FreeList::new(PartitionId(id), low, high));
        }
        let shared_start = start + u64::from(n_partitions) * per_list_blocks;
        let shared = FreeList::new(
            PartitionId(n_partitions),
            shared_start,
            span.last().0,
        );

        Self {
            lists,
            shared,
            span_start: start,
            per_list_blocks,
            used_blocks: AtomicU64::new(0),
            last_block_allocated: AtomicU64::new(0),
        }
    }

    /// Number of per-partition lists (the shared list is not counted).
    #[must_use]
    pub fn n_partitions(&self) -> u32 {
        self.lists.len() as u32
    }

    /// The partition owning `block`.
    #[must_use]
    pub fn partition_of(&self, block: BlockNumber) -> PartitionId {
        let rel = block.0.saturating_sub(self.span_start);
        let idx = if self.per_list_blocks == 0 {
            self.lists.len() as u64
        } else {
            rel / self.per_list_blocks
        };
        if idx >= self.lists.len() as u64 {
            self.shared.id
        } else {
            PartitionId(idx as u32)
        }
    }

    fn list(&self, partition: PartitionId) -> Result<&FreeList> {
        if partition == self.shared.id {
            return Ok(&self.shared);
        }
        self.lists
            .get(partition.0 as usize)
            .ok_or(WalfsError::InvalidState("unknown allocator partition"))
    }

    /// Allocate `count` contiguous blocks from `partition`, falling back
    /// to the shared list when the partition cannot satisfy the request.
    ///
    /// Never returns fewer blocks than requested; the caller must abort
    /// its transaction on failure.
    pub fn allocate(
        &self,
        partition: PartitionId,
        count: u64,
        hint: Option<BlockNumber>,
        role: AllocRole,
    ) -> Result<BlockRange> {
        if count == 0 {
            return Err(WalfsError::InvalidState("cannot allocate 0 blocks"));
        }
        let list = self.list(partition)?;
        let hint = hint
            .map(|b| b.0)
            .unwrap_or_else(|| self.last_block_allocated.load(Ordering::Relaxed))
            .clamp(list.block_start, list.block_end.max(list.block_start));

        if let Some(range) = list.allocate(count, hint, role) {
            self.note_allocated(range);
            return Ok(range);
        }

        // Overflow into the shared list. The partition lock is released
        // by now; only one list lock is ever held.
        if partition != self.shared.id
            && let Some(range) = self.shared.allocate(count, self.shared.block_start, role)
        {
            self.note_allocated(range);
            return Ok(range);
        }

        warn!(partition = partition.0, count, "allocation failed");
        Err(WalfsError::AllocationFailed {
            partition: partition.0,
            requested: count,
        })
    }

    /// Allocate near `hint`, deriving the partition from the hint block.
    pub fn allocate_near(
        &self,
        count: u64,
        hint: BlockNumber,
        role: AllocRole,
    ) -> Result<BlockRange> {
        self.allocate(self.partition_of(hint), count, Some(hint), role)
    }

    /// Return `range` to the free list of the partition that owns it.
    pub fn free(&self, range: BlockRange, role: AllocRole) -> Result<()> {
        let list = self.list(self.partition_of(range.start))?;
        list.free(range, role)?;
        self.used_blocks.fetch_sub(range.count, Ordering::Relaxed);
        Ok(())
    }

    /// Claim the exact blocks of `range`, which must all be free.
    ///
    /// Recovery uses this to pin the committed log chain's blocks before
    /// any fresh allocation can clobber them. The range must not span a
    /// partition boundary.
    pub fn reserve_range(&self, range: BlockRange, role: AllocRole) -> Result<()> {
        if range.count == 0 {
            return Ok(());
        }
        let partition = self.partition_of(range.start);
        if partition != self.partition_of(range.last()) {
            return Err(WalfsError::InvalidState(
                "reserve_range spans a partition boundary",
            ));
        }
        self.list(partition)?
            .reserve(range.start.0, range.last().0, role)?;
        self.note_allocated(range);
        Ok(())
    }

    /// Snapshot of all free ranges `(low, high)` across every list, in
    /// address order. Used to persist the free bitmap.
    #[must_use]
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        for list in self.lists.iter().chain(std::iter::once(&self.shared)) {
            let inner = list.inner.lock();
            ranges.extend(inner.tree.iter().map(|(&low, &high)| (low, high)));
        }
        ranges.sort_unstable();
        ranges
    }

    /// Statistics snapshot for one partition (pass
    /// `PartitionId(n_partitions())` for the shared list).
    pub fn stats(&self, partition: PartitionId) -> Result<FreeListStats> {
        Ok(self.list(partition)?.stats())
    }

    /// Free blocks across all lists, shared included.
    #[must_use]
    pub fn total_free_blocks(&self) -> u64 {
        self.lists
            .iter()
            .chain(std::iter::once(&self.shared))
            .map(|l| l.inner.lock().num_free_blocks)
            .sum()
    }

    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        self.used_blocks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_block_allocated(&self) -> BlockNumber {
        BlockNumber(self.last_block_allocated.load(Ordering::Relaxed))
    }

    /// Verify every list's free-range invariant. Test and repair aid.
    pub fn check_invariants(&self) -> Result<()> {
        for list in self.lists.iter().chain(std::iter::once(&self.shared)) {
            list.check_invariant()?;
        }
        Ok(())
    }

    fn note_allocated(&self, range: BlockRange) {
        self.used_blocks.fetch_add(range.count, Ordering::Relaxed);
        self.last_block_allocated
            .store(range.last().0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Allocator with partition 0 spanning exactly [0, 99].
    fn hundred_block_partition() -> BlockAllocator {
        BlockAllocator::new(BlockRange::new(BlockNumber(0), 200), 1)
    }

    #[test]
    fn scenario_hundred_block_partition() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);
        assert_eq!(alloc.stats(p0).unwrap().num_free_blocks, 100);

        let range = alloc
            .allocate(p0, 10, Some(BlockNumber(0)), AllocRole::Data)
            .unwrap();
        assert_eq!(range, BlockRange::new(BlockNumber(0), 10));
        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.num_free_blocks, 90);
        assert_eq!(stats.num_blocknode, 1);

        alloc
            .free(BlockRange::new(BlockNumber(10), 10), AllocRole::Data)
            .unwrap_err();
        // Freeing still-free blocks must be rejected...
        alloc.check_invariants().unwrap();

        // ...but freeing what was allocated restores the single range.
        alloc.free(range, AllocRole::Data).unwrap();
        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.num_free_blocks, 100);
        assert_eq!(stats.num_blocknode, 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn allocate_splits_range_in_middle() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);

        let range = alloc
            .allocate(p0, 10, Some(BlockNumber(40)), AllocRole::Data)
            .unwrap();
        assert_eq!(range.start, BlockNumber(40));
        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.num_free_blocks, 90);
        // [0,39] and [50,99]
        assert_eq!(stats.num_blocknode, 2);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn free_coalesces_both_neighbors() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);

        let a = alloc.allocate(p0, 10, Some(BlockNumber(0)), AllocRole::Data).unwrap();
        let b = alloc.allocate(p0, 10, Some(BlockNumber(10)), AllocRole::Data).unwrap();
        let c = alloc.allocate(p0, 10, Some(BlockNumber(20)), AllocRole::Data).unwrap();

        alloc.free(a, AllocRole::Data).unwrap();
        alloc.free(c, AllocRole::Data).unwrap();
        // [0,9] and [20,99] remain; freeing b bridges both into one range.
        alloc.free(b, AllocRole::Data).unwrap();
        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.num_free_blocks, 100);
        assert_eq!(stats.num_blocknode, 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn allocation_failure_is_an_error() {
        let alloc = BlockAllocator::new(BlockRange::new(BlockNumber(0), 20), 1);
        let p0 = PartitionId(0);
        // Partition 0 and the shared list hold 10 blocks each.
        let result = alloc.allocate(p0, 50, None, AllocRole::Data);
        assert!(matches!(
            result,
            Err(WalfsError::AllocationFailed {
                partition: 0,
                requested: 50
            })
        ));
    }

    #[test]
    fn exhausted_partition_overflows_to_shared() {
        let alloc = BlockAllocator::new(BlockRange::new(BlockNumber(0), 20), 1);
        let p0 = PartitionId(0);

        let first = alloc.allocate(p0, 10, Some(BlockNumber(0)), AllocRole::Data).unwrap();
        assert_eq!(first, BlockRange::new(BlockNumber(0), 10));

        // Partition 0 is now empty; the shared slice [10,19] serves this.
        let second = alloc.allocate(p0, 5, None, AllocRole::Data).unwrap();
        assert_eq!(second.start, BlockNumber(10));
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn double_free_detected() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);
        let range = alloc.allocate(p0, 4, None, AllocRole::Data).unwrap();
        alloc.free(range, AllocRole::Data).unwrap();
        assert!(matches!(
            alloc.free(range, AllocRole::Data),
            Err(WalfsError::Corruption { .. })
        ));
    }

    #[test]
    fn stats_separate_log_and_data_roles() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);

        let log = alloc.allocate(p0, 4, None, AllocRole::Log).unwrap();
        let data = alloc.allocate(p0, 6, None, AllocRole::Data).unwrap();
        alloc.free(log, AllocRole::Log).unwrap();

        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.alloc_log_count, 1);
        assert_eq!(stats.alloc_log_pages, 4);
        assert_eq!(stats.alloc_data_count, 1);
        assert_eq!(stats.alloc_data_pages, 6);
        assert_eq!(stats.free_log_count, 1);
        assert_eq!(stats.freed_log_pages, 4);
        assert_eq!(stats.free_data_count, 0);

        alloc.free(data, AllocRole::Data).unwrap();
        let stats = alloc.stats(p0).unwrap();
        assert_eq!(stats.freed_data_pages, 6);
        assert_eq!(stats.num_free_blocks, 100);
    }

    #[test]
    fn from_used_bits_skips_used_blocks() {
        let span = BlockRange::new(BlockNumber(0), 40);
        // Blocks 5..10 are used.
        let alloc = BlockAllocator::from_used_bits(span, 1, |b| (5..10).contains(&b.0));
        assert_eq!(alloc.used_blocks(), 5);
        assert_eq!(alloc.total_free_blocks(), 35);
        alloc.check_invariants().unwrap();

        // The hole is respected: an 8-block run cannot start below 10
        // unless it fits in [0,4].
        let range = alloc
            .allocate(PartitionId(0), 8, Some(BlockNumber(0)), AllocRole::Data)
            .unwrap();
        assert_eq!(range.start, BlockNumber(10));
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let alloc = Arc::new(BlockAllocator::new(
            BlockRange::new(BlockNumber(0), 4096),
            4,
        ));

        let mut handles = Vec::new();
        for t in 0..4_u32 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for i in 0..64 {
                    let partition = PartitionId((t + i) % 4);
                    if let Ok(r) = alloc.allocate(partition, 3, None, AllocRole::Data) {
                        got.push(r);
                    }
                }
                got
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for range in handle.join().unwrap() {
                for block in range.iter() {
                    assert!(seen.insert(block.0), "block {block} allocated twice");
                }
            }
        }
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn reserve_range_claims_exact_blocks() {
        let alloc = hundred_block_partition();
        alloc
            .reserve_range(BlockRange::new(BlockNumber(30), 5), AllocRole::Log)
            .unwrap();
        let stats = alloc.stats(PartitionId(0)).unwrap();
        assert_eq!(stats.num_free_blocks, 95);
        assert_eq!(stats.num_blocknode, 2);
        alloc.check_invariants().unwrap();

        // Reserving allocated blocks is corruption.
        assert!(matches!(
            alloc.reserve_range(BlockRange::new(BlockNumber(32), 2), AllocRole::Log),
            Err(WalfsError::Corruption { .. })
        ));

        alloc
            .free(BlockRange::new(BlockNumber(30), 5), AllocRole::Log)
            .unwrap();
        assert_eq!(alloc.stats(PartitionId(0)).unwrap().num_free_blocks, 100);
    }

    #[test]
    fn free_ranges_snapshot_is_address_ordered() {
        let alloc = hundred_block_partition();
        alloc
            .reserve_range(BlockRange::new(BlockNumber(10), 5), AllocRole::Data)
            .unwrap();
        let ranges = alloc.free_ranges();
        assert_eq!(ranges[0], (0, 9));
        assert_eq!(ranges[1], (15, 99));
        // Shared slice [100,199] follows.
        assert_eq!(ranges[2], (100, 199));
    }

    #[test]
    fn hint_preserves_locality() {
        let alloc = hundred_block_partition();
        let p0 = PartitionId(0);
        let a = alloc.allocate(p0, 4, Some(BlockNumber(20)), AllocRole::Data).unwrap();
        assert_eq!(a.start, BlockNumber(20));
        // Default hint is last_block_allocated, so the next allocation
        // continues right after.
        let b = alloc.allocate(p0, 4, None, AllocRole::Data).unwrap();
        assert_eq!(b.start, BlockNumber(24));
    }
}
