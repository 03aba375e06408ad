//! A [`BlockRef`] is a lightweight, pool-managed reference to a byte-block
//! byte range (§4.2: "block reference = byte block, offset, length,
//! item-count, first-item-offset"). Cloning and dropping a `BlockRef`
//! adjusts the owning block's *handle* count, not its pin count; holding a
//! `BlockRef` keeps a block from being destroyed, but does not by itself
//! keep it resident in RAM.

use crate::block::{BlockId, BlockPool};

/// A typed-block-free reference to a contiguous byte range within one block.
pub struct BlockRef {
    pool: BlockPool,
    id: BlockId,
    /// Byte offset of this reference's range within the block.
    pub offset: usize,
    /// Length of this reference's range in bytes.
    pub length: usize,
    /// Number of items whose encoding *starts* within this reference.
    pub item_count: usize,
    /// Offset of the first item header that starts within this reference;
    /// equal to `length` when every byte in the range is the tail of an
    /// item that started in an earlier reference.
    pub first_item_offset: usize,
}

impl BlockRef {
    pub(crate) fn new(
        pool: BlockPool,
        id: BlockId,
        offset: usize,
        length: usize,
        item_count: usize,
        first_item_offset: usize,
    ) -> Self {
        BlockRef { pool, id, offset, length, item_count, first_item_offset }
    }

    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Copy out this reference's byte range, pinning the block for the
    /// duration of the read.
    pub fn read(&self) -> flux_core::Result<Vec<u8>> {
        self.pool.pin_for_read(self.id)?;
        let full = self.pool.read_bytes(self.id);
        self.pool.dec_pin(self.id);
        let full = full?;
        Ok(full[self.offset..self.offset + self.length].to_vec())
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        self.pool.inc_handle(self.id);
        BlockRef {
            pool: self.pool.clone(),
            id: self.id,
            offset: self.offset,
            length: self.length,
            item_count: self.item_count,
            first_item_offset: self.first_item_offset,
        }
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.pool.dec_handle(self.id);
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("item_count", &self.item_count)
            .field("first_item_offset", &self.first_item_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;

    #[test]
    fn clone_and_drop_track_handle_count() {
        let pool = BlockPool::new(1024, std::env::temp_dir());
        let id = pool.allocate_pinned(16).unwrap();
        pool.write_at(id, 0, b"abcdefgh").unwrap();
        let r1 = BlockRef::new(pool.clone(), id, 0, 8, 1, 0);
        let r2 = r1.clone();
        assert_eq!(r1.read().unwrap(), b"abcdefgh");
        drop(r1);
        assert_eq!(r2.read().unwrap(), b"abcdefgh");
        pool.dec_pin(id);
        drop(r2);
    }
}
