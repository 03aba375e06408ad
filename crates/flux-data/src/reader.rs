//! The typed block reader (§4.2): the mirror image of [`crate::writer::Writer`],
//! pulling [`crate::block_ref::BlockRef`]s from a [`BlockSource`] and decoding
//! items out of their concatenated bytes, transparently re-joining items that
//! were split across a block boundary on write.

use std::marker::PhantomData;

use flux_core::{FluxError, Result};

use crate::codec::{DecodeResult, ItemDecode};
use crate::sink::BlockSource;

/// Deserializes items of type `T` out of a [`BlockSource`]'s blocks, in order.
pub struct Reader<T, S> {
    source: S,
    accum: Vec<u8>,
    exhausted: bool,
    _marker: PhantomData<T>,
}

impl<T, S> Reader<T, S>
where
    T: ItemDecode,
    S: BlockSource,
{
    /// `consume` only affects the caller's own bookkeeping of the underlying
    /// source (e.g. whether a `File`'s blocks are dropped as they're read);
    /// the reader itself just pulls refs until the source reports none left.
    pub fn new(source: S, consume: bool) -> Self {
        let _ = consume;
        Reader { source, accum: Vec::new(), exhausted: false, _marker: PhantomData }
    }

    fn pull_next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.source.next_ref()? {
            Some(block_ref) => Ok(Some(block_ref.read()?)),
            None => Ok(None),
        }
    }

    /// Decode the next item, or `Ok(None)` once the source is exhausted.
    pub fn next(&mut self) -> Result<Option<T>> {
        if self.exhausted && self.accum.is_empty() {
            return Ok(None);
        }
        loop {
            if !self.accum.is_empty() {
                match T::decode(&self.accum) {
                    DecodeResult::Complete { value, consumed } => {
                        self.accum.drain(0..consumed);
                        return Ok(Some(value));
                    }
                    DecodeResult::Incomplete => {}
                }
            }
            match self.pull_next_chunk()? {
                Some(bytes) => self.accum.extend_from_slice(&bytes),
                None => {
                    self.exhausted = true;
                    if self.accum.is_empty() {
                        return Ok(None);
                    }
                    return Err(FluxError::protocol("block source exhausted mid-item"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;
    use crate::queue::BlockQueue;
    use crate::writer::Writer;

    #[test]
    fn empty_source_yields_none_immediately() {
        let queue = BlockQueue::new();
        queue.close().unwrap();
        let mut reader: Reader<u64, BlockQueue> = Reader::new(queue, true);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn reads_items_in_write_order() {
        let pool = BlockPool::new(4096, std::env::temp_dir());
        let queue = BlockQueue::new();
        let mut writer: Writer<u32, BlockQueue> = Writer::new(pool, queue.clone(), 32);
        for i in 0..50u32 {
            writer.put(&i).unwrap();
        }
        writer.finish().unwrap();

        let mut reader: Reader<u32, BlockQueue> = Reader::new(queue, true);
        for i in 0..50u32 {
            assert_eq!(reader.next().unwrap(), Some(i));
        }
        assert_eq!(reader.next().unwrap(), None);
    }
}
