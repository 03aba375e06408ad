//! The block queue (C5): a FIFO of finalized blocks between one producer and
//! one consumer, with explicit open/close rather than channel-disconnect
//! semantics, so callers can tell "empty but still open, keep waiting" apart
//! from "empty and closed, stop" (§4.3).

use std::collections::VecDeque;
use std::sync::Arc;

use flux_core::{FluxError, Result};
use parking_lot::{Condvar, Mutex};

use crate::block_ref::BlockRef;
use crate::sink::{BlockSink, BlockSource};

struct QueueState {
    items: VecDeque<BlockRef>,
    closed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// A single-producer, single-consumer FIFO of [`BlockRef`]s. Cheap to clone
/// (an `Arc` handle); the producer holds one clone and calls [`BlockQueue::close`]
/// when done, the consumer holds another and calls [`BlockQueue::pop`] until
/// it returns `None`.
#[derive(Clone)]
pub struct BlockQueue {
    inner: Arc<QueueInner>,
}

impl BlockQueue {
    pub fn new() -> Self {
        BlockQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, block_ref: BlockRef) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FluxError::protocol("push onto a closed block queue"));
        }
        state.items.push_back(block_ref);
        self.inner.cv.notify_one();
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FluxError::protocol("block queue closed twice"));
        }
        state.closed = true;
        self.inner.cv.notify_all();
        Ok(())
    }

    /// Block until a block is available or the queue is closed and drained.
    pub fn pop(&self) -> Result<Option<BlockRef>> {
        let mut state = self.inner.state.lock();
        self.inner.cv.wait_while(&mut state, |s| s.items.is_empty() && !s.closed);
        Ok(state.items.pop_front())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSink for BlockQueue {
    fn push(&mut self, block_ref: BlockRef) -> Result<()> {
        BlockQueue::push(self, block_ref)
    }

    fn close(&mut self) -> Result<()> {
        BlockQueue::close(self)
    }
}

impl BlockSource for BlockQueue {
    fn next_ref(&mut self) -> Result<Option<BlockRef>> {
        BlockQueue::pop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;
    use std::thread;

    #[test]
    fn pop_blocks_until_push_then_drains_on_close() {
        let pool = BlockPool::new(1024, std::env::temp_dir());
        let q = BlockQueue::new();
        let q2 = q.clone();
        let pool2 = pool.clone();
        let producer = thread::spawn(move || {
            let id = pool2.allocate_pinned(8).unwrap();
            pool2.write_at(id, 0, b"12345678").unwrap();
            q2.push(BlockRef::new(pool2.clone(), id, 0, 8, 1, 0)).unwrap();
            pool2.dec_pin(id);
            q2.close().unwrap();
        });
        let first = q.pop().unwrap().expect("one block pushed");
        assert_eq!(first.read().unwrap(), b"12345678");
        drop(first);
        assert!(q.pop().unwrap().is_none());
        producer.join().unwrap();
    }

    #[test]
    fn push_after_close_is_a_protocol_violation() {
        let pool = BlockPool::new(1024, std::env::temp_dir());
        let q = BlockQueue::new();
        q.close().unwrap();
        let id = pool.allocate_pinned(4).unwrap();
        let err = q.push(BlockRef::new(pool.clone(), id, 0, 0, 0, 0));
        assert!(err.is_err());
        pool.dec_pin(id);
    }
}
