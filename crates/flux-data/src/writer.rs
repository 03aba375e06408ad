//! The typed block writer (§4.2): packs a stream of items into fixed-size
//! blocks, letting an item's encoding straddle a block boundary, and hands
//! each finalized block off to a [`BlockSink`].

use std::marker::PhantomData;

use flux_core::Result;

use crate::block::BlockPool;
use crate::block_ref::BlockRef;
use crate::codec::ItemEncode;
use crate::sink::BlockSink;

/// Serializes items of type `T` into blocks of `block_size` bytes apiece and
/// pushes each finalized block to `sink`.
pub struct Writer<T, S> {
    pool: BlockPool,
    sink: S,
    block_size: usize,
    current: Option<crate::block::BlockId>,
    cursor: usize,
    item_count_in_block: usize,
    first_item_offset_in_block: Option<usize>,
    scratch: Vec<u8>,
    finished: bool,
    _marker: PhantomData<T>,
}

impl<T, S> Writer<T, S>
where
    T: ItemEncode,
    S: BlockSink,
{
    pub fn new(pool: BlockPool, sink: S, block_size: usize) -> Self {
        Writer {
            pool,
            sink,
            block_size,
            current: None,
            cursor: 0,
            item_count_in_block: 0,
            first_item_offset_in_block: None,
            scratch: Vec::new(),
            finished: false,
            _marker: PhantomData,
        }
    }

    fn ensure_block(&mut self) -> Result<()> {
        if self.current.is_none() {
            let id = self.pool.allocate_pinned(self.block_size)?;
            self.current = Some(id);
            self.cursor = 0;
            self.item_count_in_block = 0;
            self.first_item_offset_in_block = None;
        }
        Ok(())
    }

    fn finalize_current_block(&mut self) -> Result<()> {
        let id = self.current.take().expect("finalize called without a current block");
        let used = self.cursor;
        let item_count = self.item_count_in_block;
        let first_item_offset = self.first_item_offset_in_block.unwrap_or(used);
        self.pool.dec_pin(id);
        let block_ref = BlockRef::new(self.pool.clone(), id, 0, used, item_count, first_item_offset);
        self.cursor = 0;
        self.item_count_in_block = 0;
        self.first_item_offset_in_block = None;
        self.sink.push(block_ref)
    }

    /// Serialize and append one item, finalizing and emitting blocks as they fill.
    pub fn put(&mut self, item: &T) -> Result<()> {
        self.scratch.clear();
        item.encode(&mut self.scratch);
        let total = self.scratch.len();
        let mut written = 0usize;
        let mut first_byte_of_item = true;
        while written < total {
            self.ensure_block()?;
            let id = self.current.unwrap();
            if first_byte_of_item {
                if self.first_item_offset_in_block.is_none() {
                    self.first_item_offset_in_block = Some(self.cursor);
                }
                self.item_count_in_block += 1;
                first_byte_of_item = false;
            }
            let capacity = self.block_size;
            let available = capacity - self.cursor;
            let to_copy = available.min(total - written);
            self.pool.write_at(id, self.cursor, &self.scratch[written..written + to_copy])?;
            self.cursor += to_copy;
            written += to_copy;
            if self.cursor == capacity {
                self.finalize_current_block()?;
            }
        }
        Ok(())
    }

    /// Flush any partially-filled block and close the sink. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.current.is_some() {
            self.finalize_current_block()?;
        }
        self.sink.close()?;
        self.finished = true;
        Ok(())
    }
}

impl<T, S> Drop for Writer<T, S> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(id) = self.current.take() {
                self.pool.dec_pin(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BlockQueue;
    use crate::reader::Reader;

    #[test]
    fn items_spanning_block_boundaries_roundtrip() {
        let pool = BlockPool::new(4096, std::env::temp_dir());
        let queue = BlockQueue::new();
        // A tiny block size forces most items to straddle block edges.
        let mut writer: Writer<String, BlockQueue> = Writer::new(pool.clone(), queue.clone(), 6);
        let words: Vec<String> = (0..40).map(|i| format!("word-{i}")).collect();
        for w in &words {
            writer.put(w).unwrap();
        }
        writer.finish().unwrap();

        let mut reader: Reader<String, BlockQueue> = Reader::new(queue, true);
        let mut got = Vec::new();
        while let Some(w) = reader.next().unwrap() {
            got.push(w);
        }
        assert_eq!(got, words);
    }

    #[test]
    fn first_item_offset_is_zero_for_a_fresh_block() {
        let pool = BlockPool::new(4096, std::env::temp_dir());
        let queue = BlockQueue::new();
        let mut writer: Writer<u64, BlockQueue> = Writer::new(pool, queue.clone(), 64);
        writer.put(&1u64).unwrap();
        writer.finish().unwrap();
        let block_ref = queue.pop().unwrap().expect("one block");
        assert_eq!(block_ref.first_item_offset, 0);
        assert_eq!(block_ref.item_count, 1);
    }
}
