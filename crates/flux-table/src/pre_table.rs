//! Reduce pre-table (C8, §4.6): local partial aggregation before shuffle.
//! `P` partitions, each `B/P` buckets, partitions aligned to destination
//! workers so a flush can hand an entire partition to that worker's stream
//! writer.

use flux_core::config::FlushMode;
use flux_core::Result;
use flux_data::block::BlockPool;
use flux_data::codec::{ItemDecode, ItemEncode};
use flux_data::file::{File, FileWriterSink};
use flux_data::reader::Reader;
use flux_data::sink::BlockSink;
use flux_data::writer::Writer;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::bucket::{hash64, slots_per_block, BucketArena};

/// A partitioned, spillable hash table that reduces same-key values as they
/// arrive and, on [`PreTable::flush`], hands every partition off to the
/// target worker's shuffle writer.
pub struct PreTable<K, V, KF, RF> {
    arena: BucketArena<K, V>,
    partitions: usize,
    buckets_per_partition: usize,
    items_in_partition: Vec<usize>,
    max_items_per_partition: usize,
    spill_files: Vec<File>,
    spill_writers: Vec<Option<Writer<V, FileWriterSink>>>,
    pool: BlockPool,
    block_size: usize,
    flush_mode: FlushMode,
    self_partition: usize,
    last_flushed: Vec<u64>,
    flush_count: Vec<u64>,
    tick: u64,
    spills_performed: u64,
    key_fn: KF,
    reduce_fn: RF,
}

impl<K, V, KF, RF> PreTable<K, V, KF, RF>
where
    K: Eq,
    V: Clone,
    KF: Fn(&V) -> K,
    RF: Fn(V, V) -> V,
    V: ItemEncode + ItemDecode,
{
    /// `partitions` is normally `total_workers` (§3 "Partitions are aligned
    /// to destination workers"); `self_partition` is this worker's own
    /// index, used to place it last in the `OneFactor` flush order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partitions: usize,
        ram_budget: usize,
        bucket_rate: f64,
        max_partition_fill_rate: f64,
        flush_mode: FlushMode,
        self_partition: usize,
        pool: BlockPool,
        block_size: usize,
        key_fn: KF,
        reduce_fn: RF,
    ) -> Self {
        let partitions = partitions.max(1);
        let slot_capacity = slots_per_block::<K, V>();
        let pair_bytes = std::mem::size_of::<(K, V)>().max(1);
        let block_bytes = slot_capacity * pair_bytes;
        let max_blocks = (ram_budget / block_bytes).max(partitions);
        let total_buckets = (((max_blocks as f64) * bucket_rate) as usize).max(partitions);
        let buckets_per_partition = (total_buckets / partitions).max(1);
        let total_buckets = buckets_per_partition * partitions;
        let max_items_per_partition =
            ((buckets_per_partition * slot_capacity) as f64 * max_partition_fill_rate).max(1.0) as usize;

        PreTable {
            arena: BucketArena::new(total_buckets, slot_capacity),
            partitions,
            buckets_per_partition,
            items_in_partition: vec![0; partitions],
            max_items_per_partition,
            spill_files: (0..partitions).map(|_| File::new()).collect(),
            spill_writers: (0..partitions).map(|_| None).collect(),
            pool,
            block_size,
            flush_mode,
            self_partition: self_partition.min(partitions - 1),
            last_flushed: vec![0; partitions],
            flush_count: vec![0; partitions],
            tick: 0,
            spills_performed: 0,
            key_fn,
            reduce_fn,
        }
    }

    /// Number of partition spills triggered so far, for tests and the
    /// per-worker `StatsGraph` to confirm a table actually spilled under
    /// memory pressure (§8 S4) rather than happening to fit in RAM.
    pub fn spills_performed(&self) -> u64 {
        self.spills_performed
    }

    fn bucket_for(&self, key: &K) -> (usize, usize)
    where
        K: std::hash::Hash,
    {
        let hash = hash64(key);
        let total_buckets = self.arena.num_buckets();
        let bucket = (hash as usize) % total_buckets;
        (bucket, bucket / self.buckets_per_partition)
    }

    /// §4.6 Insert: reduce on key match, append on miss, spill the
    /// partition if it crosses its fill threshold.
    pub fn insert(&mut self, value: V) -> Result<()>
    where
        K: std::hash::Hash,
    {
        let key = (self.key_fn)(&value);
        let (bucket, partition) = self.bucket_for(&key);
        let reduce = &self.reduce_fn;
        let is_new = self.arena.insert_or_reduce(bucket, key, value, |old, new| reduce(old, new));
        if is_new {
            self.items_in_partition[partition] += 1;
            if self.items_in_partition[partition] >= self.max_items_per_partition {
                self.spill_partition(partition)?;
            }
        }
        Ok(())
    }

    fn partition_bucket_range(&self, partition: usize) -> std::ops::Range<usize> {
        let start = partition * self.buckets_per_partition;
        start..start + self.buckets_per_partition
    }

    /// §4.6 Spill: append every (k, v) of a partition to its scratch File
    /// and clear its bucket chains. The file stays open across repeated
    /// spills of the same partition, closed only when `flush` reads it back.
    fn spill_partition(&mut self, partition: usize) -> Result<()> {
        self.spills_performed += 1;
        warn!(partition, items = self.items_in_partition[partition], "spilling pre-table partition");
        if self.spill_writers[partition].is_none() {
            let sink = self.spill_files[partition].writer()?;
            self.spill_writers[partition] = Some(Writer::new(self.pool.clone(), sink, self.block_size));
        }
        let writer = self.spill_writers[partition].as_mut().unwrap();
        for bucket in self.partition_bucket_range(partition) {
            for (_, value) in self.arena.drain_bucket(bucket) {
                writer.put(&value)?;
            }
        }
        self.items_in_partition[partition] = 0;
        Ok(())
    }

    fn flush_order(&mut self) -> Vec<usize> {
        let n = self.partitions;
        match self.flush_mode {
            FlushMode::OneFactor => {
                // Round-robin starting just past this worker, local last —
                // a round-robin approximation of a true edge-disjoint
                // 1-factorization, sufficient to spread receive load and
                // keep loopback traffic off the network send path.
                let mut order: Vec<usize> = (1..n).map(|r| (self.self_partition + r) % n).collect();
                order.push(self.self_partition);
                order
            }
            FlushMode::SmallestFirst => {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by_key(|&p| self.items_in_partition[p]);
                order
            }
            FlushMode::Lru => {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by_key(|&p| self.last_flushed[p]);
                order
            }
            FlushMode::Lfu => {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by_key(|&p| self.flush_count[p]);
                order
            }
            FlushMode::Random => {
                let mut order: Vec<usize> = (0..n).collect();
                order.shuffle(&mut rand::thread_rng());
                order
            }
        }
    }

    /// §4.6 Flush: iterate partitions in the configured permutation,
    /// emitting every (k, v) — first whatever was already spilled, then
    /// whatever is still resident — to `writers[partition]`, which is then
    /// closed. `consume` clears the resident chains as they're emitted;
    /// otherwise they're left intact for a later re-execution.
    pub fn flush<S>(&mut self, writers: &mut [Writer<V, S>], consume: bool) -> Result<()>
    where
        S: BlockSink,
        K: Clone,
    {
        assert_eq!(writers.len(), self.partitions, "one writer per partition");
        let order = self.flush_order();
        for partition in order {
            if let Some(mut w) = self.spill_writers[partition].take() {
                w.finish()?;
            }
            // On Keep (`consume == false`) the spill file must survive this
            // flush intact: a later re-flush of the same table replays from
            // it again, so read it with a keeping reader and leave it in
            // place instead of draining and discarding it.
            let mut reader: Reader<V, flux_data::file::FileReaderSource> =
                Reader::new(self.spill_files[partition].reader(consume)?, consume);
            while let Some(value) = reader.next()? {
                writers[partition].put(&value)?;
            }
            if consume {
                self.spill_files[partition] = File::new();
            }

            for bucket in self.partition_bucket_range(partition) {
                let items = if consume { self.arena.drain_bucket(bucket) } else { self.arena.iter_bucket(bucket) };
                for (_, value) in items {
                    writers[partition].put(&value)?;
                }
            }
            if consume {
                self.items_in_partition[partition] = 0;
            }
            self.last_flushed[partition] = self.tick;
            self.flush_count[partition] += 1;
            self.tick += 1;

            writers[partition].finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BlockPool {
        BlockPool::new(1 << 20, std::env::temp_dir())
    }

    #[test]
    fn insert_reduces_same_key_before_flush() {
        let mut table = PreTable::new(
            2,
            1 << 16,
            0.5,
            0.9,
            FlushMode::OneFactor,
            0,
            pool(),
            256,
            |pair: &(String, u64)| pair.0.clone(),
            |a: (String, u64), b: (String, u64)| (a.0, a.1 + b.1),
        );
        for w in ["a", "b", "a", "a", "b"] {
            table.insert((w.to_string(), 1)).unwrap();
        }

        let mut writers: Vec<Writer<(String, u64), flux_data::file::FileWriterSink>> = (0..2)
            .map(|_| {
                let f = File::new();
                Writer::new(pool(), f.writer().unwrap(), 256)
            })
            .collect();
        table.flush(&mut writers, true).unwrap();
        drop(writers);
    }

    #[test]
    fn spilling_a_partition_does_not_lose_items() {
        // Force a spill by giving the table a tiny RAM budget so the fill
        // threshold is crossed almost immediately, then confirm every
        // inserted pair still reaches the shuffle writer at flush.
        let mut table = PreTable::new(
            1,
            4096,
            0.5,
            0.1,
            FlushMode::OneFactor,
            0,
            pool(),
            64,
            |pair: &(u32, u32)| pair.0,
            |a: (u32, u32), b: (u32, u32)| (a.0, a.1 + b.1),
        );
        for k in 0..50u32 {
            table.insert((k, 1)).unwrap();
        }

        let target_file = File::new();
        let mut writers = vec![Writer::new(pool(), target_file.writer().unwrap(), 64)];
        table.flush(&mut writers, true).unwrap();
        drop(writers);

        let mut reader: Reader<(u32, u32), flux_data::file::FileReaderSource> =
            Reader::new(target_file.reader(true).unwrap(), true);
        let mut seen = std::collections::HashMap::new();
        while let Some((k, v)) = reader.next().unwrap() {
            *seen.entry(k).or_insert(0u32) += v;
        }
        assert_eq!(seen.len(), 50);
        assert!(seen.values().all(|&v| v == 1));
    }

    #[test]
    fn keep_flush_preserves_spilled_items_for_a_later_reflush() {
        // `consume = false` (Keep) must leave the spill file intact so a
        // second flush of the same table — with no inserts in between —
        // still emits every key that had been spilled the first time.
        let mut table = PreTable::new(
            1,
            4096,
            0.5,
            0.1,
            FlushMode::OneFactor,
            0,
            pool(),
            64,
            |pair: &(u32, u32)| pair.0,
            |a: (u32, u32), b: (u32, u32)| (a.0, a.1 + b.1),
        );
        for k in 0..50u32 {
            table.insert((k, 1)).unwrap();
        }
        assert!(table.spills_performed() > 0, "expected the tiny fill threshold to force a spill");

        for attempt in 0..2 {
            let target_file = File::new();
            let mut writers = vec![Writer::new(pool(), target_file.writer().unwrap(), 64)];
            table.flush(&mut writers, false).unwrap();
            drop(writers);

            let mut reader: Reader<(u32, u32), flux_data::file::FileReaderSource> =
                Reader::new(target_file.reader(true).unwrap(), true);
            let mut seen = std::collections::HashMap::new();
            while let Some((k, v)) = reader.next().unwrap() {
                *seen.entry(k).or_insert(0u32) += v;
            }
            assert_eq!(seen.len(), 50, "reflush {attempt} lost spilled keys");
        }
    }

    /// Seed test S4 (scaled down from 10 MiB to keep the test fast): a
    /// tight `M = 1 MiB` budget against `block_size = 64 KiB` must still
    /// reach the same per-key totals as an effectively unbounded budget,
    /// and must actually have spilled at least once getting there.
    #[test]
    fn spill_under_memory_pressure_matches_unbounded_ram_s4() {
        // A small, deterministic xorshift generator stands in for
        // "pseudo-random pairs"; a fixed seed keeps the test reproducible.
        fn pseudo_random_pairs(count: usize) -> Vec<(u32, u32)> {
            let mut state: u32 = 0x9E3779B9;
            (0..count)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    (state % 200_000, 1u32)
                })
                .collect()
        }

        fn run(ram_budget: usize, pairs: &[(u32, u32)]) -> (std::collections::HashMap<u32, u32>, u64) {
            let mut table = PreTable::new(
                1,
                ram_budget,
                0.5,
                0.9,
                FlushMode::OneFactor,
                0,
                pool(),
                64 * 1024,
                |pair: &(u32, u32)| pair.0,
                |a: (u32, u32), b: (u32, u32)| (a.0, a.1 + b.1),
            );
            for pair in pairs {
                table.insert(*pair).unwrap();
            }
            let target_file = File::new();
            let mut writers = vec![Writer::new(pool(), target_file.writer().unwrap(), 64 * 1024)];
            table.flush(&mut writers, true).unwrap();
            drop(writers);

            let mut reader: Reader<(u32, u32), flux_data::file::FileReaderSource> =
                Reader::new(target_file.reader(true).unwrap(), true);
            let mut seen = std::collections::HashMap::new();
            while let Some((k, v)) = reader.next().unwrap() {
                *seen.entry(k).or_insert(0u32) += v;
            }
            (seen, table.spills_performed())
        }

        // (8-byte pairs) * ~130k items ~= 1 MiB of input, scaled down from
        // the seed test's 10 MiB so the test runs quickly.
        let pairs = pseudo_random_pairs(130_000);
        let (bounded, bounded_spills) = run(1 << 20, &pairs);
        let (unbounded, unbounded_spills) = run(1 << 30, &pairs);

        assert_eq!(bounded, unbounded);
        assert!(bounded_spills > 0, "expected at least one spill under the tight RAM budget");
        assert_eq!(unbounded_spills, 0);
    }
}
