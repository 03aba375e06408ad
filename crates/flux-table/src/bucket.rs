//! The shared bucket-chain arena underneath both the pre-table (C8) and the
//! post-table (C9): "a small inline array of (key, value) slots plus a
//! next-pointer. Buckets are singly-linked lists of such blocks so that
//! in-bucket scanning is cache-friendly while overflow is unbounded" (§3).
//!
//! Blocks live in one arena `Vec` per table so a cleared bucket's blocks can
//! be recycled by a later insert into any other bucket, instead of
//! allocating afresh every time a partition is spilled and refilled.

use std::hash::{Hash, Hasher};

use ahash::AHasher;

/// The one hash used everywhere a key needs routing to a bucket or frame:
/// pre-table/post-table bucket placement and the reduce shuffle's per-key
/// target worker. `AHasher::default()` uses fixed keys, so this is stable
/// across runs within the same build.
pub fn hash64<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// One bucket block: up to `capacity` (key, value) slots, `None` marking an
/// emptied slot, plus the arena index of the next block in the chain.
struct BucketBlock<K, V> {
    slots: Vec<Option<(K, V)>>,
    len: usize,
    next: Option<usize>,
}

impl<K, V> BucketBlock<K, V> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        BucketBlock { slots, len: 0, next: None }
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn first_free_index(&self) -> Option<usize> {
        if self.is_full() {
            None
        } else {
            self.slots.iter().position(|s| s.is_none())
        }
    }
}

/// Slot count per bucket block: chosen so the block's total footprint stays
/// near 1 KiB (§3 "Hash-table bucket block"), with a floor of 1 so even
/// oversized `(K, V)` pairs still make progress.
pub fn slots_per_block<K, V>() -> usize {
    let pair_bytes = std::mem::size_of::<(K, V)>().max(1);
    (1024 / pair_bytes).max(1)
}

/// An arena of bucket blocks shared by `num_buckets` chains. Blocks freed by
/// [`BucketArena::drain_bucket`]/[`BucketArena::clear_bucket`] are recycled
/// by later inserts into any bucket, so a spill-then-refill cycle does not
/// grow the arena unboundedly.
pub struct BucketArena<K, V> {
    heads: Vec<Option<usize>>,
    blocks: Vec<BucketBlock<K, V>>,
    free: Vec<usize>,
    slot_capacity: usize,
}

impl<K, V> BucketArena<K, V>
where
    K: Eq,
{
    pub fn new(num_buckets: usize, slot_capacity: usize) -> Self {
        BucketArena {
            heads: vec![None; num_buckets],
            blocks: Vec::new(),
            free: Vec::new(),
            slot_capacity: slot_capacity.max(1),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.heads.len()
    }

    fn alloc_block(&mut self) -> usize {
        if let Some(idx) = self.free.pop() {
            self.blocks[idx] = BucketBlock::new(self.slot_capacity);
            idx
        } else {
            self.blocks.push(BucketBlock::new(self.slot_capacity));
            self.blocks.len() - 1
        }
    }

    /// Scan the bucket's chain for `key`; on a match, replace its value with
    /// `reduce(old, value)` (§4.6 Insert). On a miss, append into the last
    /// block's first free slot or a newly allocated block. Returns `true` if
    /// `key` was new to the bucket, `false` if it was merged into an
    /// existing slot.
    pub fn insert_or_reduce(&mut self, bucket: usize, key: K, value: V, reduce: impl FnOnce(V, V) -> V) -> bool {
        let mut cursor = self.heads[bucket];
        let mut tail = None;
        while let Some(idx) = cursor {
            tail = Some(idx);
            let block = &mut self.blocks[idx];
            for slot in block.slots.iter_mut() {
                if let Some((k, _)) = slot {
                    if *k == key {
                        let (k, old) = slot.take().unwrap();
                        *slot = Some((k, reduce(old, value)));
                        return false;
                    }
                }
            }
            cursor = block.next;
        }

        // Miss: land in the tail block's first free slot, or a fresh block.
        if let Some(tail_idx) = tail {
            if let Some(free_slot) = self.blocks[tail_idx].first_free_index() {
                self.blocks[tail_idx].slots[free_slot] = Some((key, value));
                self.blocks[tail_idx].len += 1;
                return true;
            }
        }
        let new_idx = self.alloc_block();
        self.blocks[new_idx].slots[0] = Some((key, value));
        self.blocks[new_idx].len = 1;
        match tail {
            Some(tail_idx) => self.blocks[tail_idx].next = Some(new_idx),
            None => self.heads[bucket] = Some(new_idx),
        }
        true
    }

    /// Whether `bucket`'s chain already holds `key`, without mutating it.
    pub fn contains(&self, bucket: usize, key: &K) -> bool {
        let mut cursor = self.heads[bucket];
        while let Some(idx) = cursor {
            let block = &self.blocks[idx];
            if block.slots.iter().any(|slot| matches!(slot, Some((k, _)) if k == key)) {
                return true;
            }
            cursor = block.next;
        }
        false
    }

    /// Number of live (key, value) pairs in `bucket`.
    pub fn bucket_len(&self, bucket: usize) -> usize {
        let mut cursor = self.heads[bucket];
        let mut total = 0;
        while let Some(idx) = cursor {
            total += self.blocks[idx].len;
            cursor = self.blocks[idx].next;
        }
        total
    }

    /// Total blocks currently allocated to live chains (excludes the free list).
    pub fn live_block_count(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    /// Copy out every (key, value) pair in `bucket` without clearing it.
    pub fn iter_bucket(&self, bucket: usize) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::new();
        let mut cursor = self.heads[bucket];
        while let Some(idx) = cursor {
            for slot in &self.blocks[idx].slots {
                if let Some(pair) = slot {
                    out.push(pair.clone());
                }
            }
            cursor = self.blocks[idx].next;
        }
        out
    }

    /// Remove and return every (key, value) pair in `bucket`, recycling its
    /// blocks back to the arena's free list (§4.6 Spill / §4.7 Flush).
    pub fn drain_bucket(&mut self, bucket: usize) -> Vec<(K, V)> {
        let mut out = Vec::new();
        let mut cursor = self.heads[bucket].take();
        while let Some(idx) = cursor {
            let block = &mut self.blocks[idx];
            for slot in block.slots.iter_mut() {
                if let Some(pair) = slot.take() {
                    out.push(pair);
                }
            }
            cursor = block.next.take();
            self.free.push(idx);
        }
        out
    }

    /// Drop every (key, value) pair in `bucket` without returning them,
    /// recycling its blocks.
    pub fn clear_bucket(&mut self, bucket: usize) {
        let _ = self.drain_bucket(bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_on_key_match_and_appends_on_miss() {
        let mut arena: BucketArena<String, u64> = BucketArena::new(4, 2);
        arena.insert_or_reduce(0, "a".into(), 1, |old, new| old + new);
        arena.insert_or_reduce(0, "b".into(), 1, |old, new| old + new);
        arena.insert_or_reduce(0, "a".into(), 1, |old, new| old + new);
        assert_eq!(arena.bucket_len(0), 2);
        let mut pairs = arena.iter_bucket(0);
        pairs.sort();
        assert_eq!(pairs, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }

    #[test]
    fn overflow_beyond_one_block_chains_correctly() {
        let mut arena: BucketArena<u32, u32> = BucketArena::new(1, 2);
        for k in 0..10u32 {
            arena.insert_or_reduce(0, k, 1, |old, new| old + new);
        }
        assert_eq!(arena.bucket_len(0), 10);
        assert!(arena.live_block_count() >= 5);
    }

    #[test]
    fn drain_recycles_blocks_for_later_inserts() {
        let mut arena: BucketArena<u32, u32> = BucketArena::new(2, 2);
        for k in 0..6u32 {
            arena.insert_or_reduce(0, k, 1, |old, new| old + new);
        }
        let before = arena.live_block_count();
        let drained = arena.drain_bucket(0);
        assert_eq!(drained.len(), 6);
        assert_eq!(arena.bucket_len(0), 0);
        for k in 0..6u32 {
            arena.insert_or_reduce(1, k, 1, |old, new| old + new);
        }
        // Recycled blocks from bucket 0 should have been reused for bucket 1.
        assert!(arena.live_block_count() <= before);
    }
}
