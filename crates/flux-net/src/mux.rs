//! The stream multiplexer (C6): one per host, shared by every worker thread
//! on that host. Allocates stream ids without inter-worker coordination
//! (§4.4: "each local worker bumps a per-worker counter; the global stream
//! id is the tuple (host_rank, local_worker, counter)") and routes an
//! incoming block for a `(stream, source-worker, target-worker)` triple to
//! the right [`BlockQueue`], serving loopback traffic without a round-trip
//! through header encoding.
//!
//! This workspace models a whole job (every host, every worker) as one
//! process, the same way [`flux_core::transport::LocalFlowGroup`] models
//! the flow group: [`StreamMultiplexer::new_job`] hands back one handle per
//! global worker, all sharing one routing table, standing in for what a
//! real deployment would split across per-host processes talking over the
//! (out of scope) wire transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use flux_core::Result;
use flux_data::block_ref::BlockRef;
use flux_data::queue::BlockQueue;
use parking_lot::Mutex;
use tracing::trace;

use crate::header::{BlockHeader, FLAG_END_OF_STREAM};

/// Which merge discipline a stream's reader uses; decided once when the
/// stream is created and shared by every worker that opens it (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Reader concatenates per-source sub-queues in source-rank order.
    Cat,
    /// Reader interleaves blocks from any source in arrival order.
    Mix,
}

/// The receiving-side state for one `(stream_id, target_worker)` pair.
enum RouteEntry {
    /// One queue per source worker; `None` until that source's first block
    /// or close arrives, so a fast source does not wait on a slow one's
    /// registration.
    Cat(HashMap<u32, BlockQueue>),
    /// One shared multi-producer queue; closed once every source has closed
    /// its side (§4.5 close protocol).
    Mix { queue: BlockQueue, writers_remaining: u32 },
}

struct MuxShared {
    total_workers: u32,
    workers_per_host: u32,
    routes: Mutex<HashMap<(u64, u32), RouteEntry>>,
    counters: Vec<AtomicU64>,
}

/// One worker's handle onto the shared routing table of its host (really,
/// of the whole simulated job — see module docs).
#[derive(Clone)]
pub struct StreamMultiplexer {
    worker_id: u32,
    shared: Arc<MuxShared>,
}

impl StreamMultiplexer {
    /// Build handles for a job of `host_count` hosts each running
    /// `workers_per_host` workers, global worker id = `host_rank *
    /// workers_per_host + local_worker`.
    pub fn new_job(host_count: usize, workers_per_host: usize) -> Vec<StreamMultiplexer> {
        assert!(host_count > 0 && workers_per_host > 0, "a job needs at least one worker");
        let total_workers = host_count * workers_per_host;
        let shared = Arc::new(MuxShared {
            total_workers: total_workers as u32,
            workers_per_host: workers_per_host as u32,
            routes: Mutex::new(HashMap::new()),
            counters: (0..total_workers).map(|_| AtomicU64::new(0)).collect(),
        });
        (0..total_workers)
            .map(|worker_id| StreamMultiplexer { worker_id: worker_id as u32, shared: shared.clone() })
            .collect()
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn total_workers(&self) -> u32 {
        self.shared.total_workers
    }

    fn host_rank(&self) -> u32 {
        self.worker_id / self.shared.workers_per_host
    }

    /// Allocate the next stream id for this worker: each worker bumps its
    /// *own* counter (no cross-worker coordination, no lock contention), but
    /// because every worker of a job opens streams the same number of times
    /// in the same program order (BSP lock-step), the Nth call on every
    /// worker returns the same counter value — so peers rendezvous on a
    /// stream without a handshake (§4.4) purely by call order.
    ///
    /// A real multi-host deployment additionally namespaces these counters
    /// by `(host_rank, local_worker)` so two *different* logical streams
    /// opened by different hosts can never collide before the peers agree
    /// which one is which; this workspace simulates the whole job in one
    /// shared-memory process, where the bare counter already is the
    /// rendezvous key, so `host_rank`/`local_worker` stay available via
    /// [`StreamMultiplexer::worker_id`] and [`StreamMultiplexer::is_loopback`]
    /// rather than being packed into the numeric id.
    pub fn allocate_stream_id(&self) -> u64 {
        self.shared.counters[self.worker_id as usize].fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_loopback(&self, target_worker: u32) -> bool {
        target_worker / self.shared.workers_per_host == self.host_rank()
    }

    /// Register this worker as the receiver of `stream_id` of the given
    /// `kind`, returning the queue it should read from for `source_worker`
    /// (Cat) or the single shared queue (Mix, `source_worker` ignored).
    /// Idempotent: the first caller (reader or writer) wins the `kind`.
    fn route_queue(&self, stream_id: u64, source_worker: u32, kind: StreamKind) -> BlockQueue {
        let mut routes = self.shared.routes.lock();
        let entry = routes.entry((stream_id, self.worker_id)).or_insert_with(|| match kind {
            StreamKind::Cat => RouteEntry::Cat(HashMap::new()),
            StreamKind::Mix => RouteEntry::Mix {
                queue: BlockQueue::new(),
                writers_remaining: self.shared.total_workers,
            },
        });
        match entry {
            RouteEntry::Cat(per_source) => per_source.entry(source_worker).or_insert_with(BlockQueue::new).clone(),
            RouteEntry::Mix { queue, .. } => queue.clone(),
        }
    }

    /// All `total_workers` per-source queues for a Cat stream this worker is
    /// reading, in source-rank order (creating any not yet touched by a writer).
    pub fn cat_queues_in_order(&self, stream_id: u64) -> Vec<BlockQueue> {
        (0..self.shared.total_workers)
            .map(|source| self.route_queue(stream_id, source, StreamKind::Cat))
            .collect()
    }

    pub fn mix_queue(&self, stream_id: u64) -> BlockQueue {
        self.route_queue(stream_id, 0, StreamKind::Mix)
    }

    /// Dispatch one finalized block for `(stream_id, self -> target_worker)`.
    /// Loopback traffic (same host) goes straight into the destination
    /// queue; everything else is round-tripped through the wire header
    /// encoding first, to exercise the contract even without a real socket.
    pub fn dispatch(&self, stream_id: u64, target_worker: u32, kind: StreamKind, block_ref: BlockRef) -> Result<()> {
        let header = BlockHeader {
            stream_id,
            source_worker: self.worker_id,
            target_worker,
            payload_len: block_ref.length as u32,
            item_count: block_ref.item_count as u32,
            first_item_offset: block_ref.first_item_offset as u32,
            flags: 0,
        };
        if !self.is_loopback(target_worker) {
            let encoded = header.encode();
            BlockHeader::decode(&encoded)?;
        }
        trace!(stream_id, source = self.worker_id, target = target_worker, "dispatching block");
        let target = self.for_worker(target_worker);
        let queue = target.route_queue(stream_id, self.worker_id, kind);
        queue.push(block_ref)
    }

    /// Close this worker's writer side of `(stream_id, self -> target_worker)`.
    pub fn dispatch_close(&self, stream_id: u64, target_worker: u32, kind: StreamKind) -> Result<()> {
        let header = BlockHeader {
            stream_id,
            source_worker: self.worker_id,
            target_worker,
            payload_len: 0,
            item_count: 0,
            first_item_offset: 0,
            flags: FLAG_END_OF_STREAM,
        };
        if !self.is_loopback(target_worker) {
            let encoded = header.encode();
            BlockHeader::decode(&encoded)?;
        }
        let target = self.for_worker(target_worker);
        match kind {
            StreamKind::Cat => {
                let queue = target.route_queue(stream_id, self.worker_id, kind);
                queue.close()
            }
            StreamKind::Mix => {
                let mut routes = target.shared.routes.lock();
                let entry = routes.entry((stream_id, target_worker)).or_insert_with(|| RouteEntry::Mix {
                    queue: BlockQueue::new(),
                    writers_remaining: target.shared.total_workers,
                });
                match entry {
                    RouteEntry::Mix { queue, writers_remaining } => {
                        *writers_remaining -= 1;
                        let queue = queue.clone();
                        let done = *writers_remaining == 0;
                        drop(routes);
                        if done {
                            queue.close()?;
                        }
                        Ok(())
                    }
                    RouteEntry::Cat(_) => unreachable!("stream kind mismatch between writer and reader"),
                }
            }
        }
    }

    /// A handle to the same shared routing table addressed as `worker_id`.
    fn for_worker(&self, worker_id: u32) -> StreamMultiplexer {
        StreamMultiplexer { worker_id, shared: self.shared.clone() }
    }
}

/// Per-worker monotonically increasing counter, exposed for callers (the
/// surface operator layer) that want to label stages without minting an
/// actual stream.
pub struct LocalCounter(AtomicU32);

impl LocalCounter {
    pub fn new() -> Self {
        LocalCounter(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LocalCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_unique_per_worker_and_monotonic() {
        let peers = StreamMultiplexer::new_job(2, 2);
        let a = peers[0].allocate_stream_id();
        let b = peers[0].allocate_stream_id();
        assert_ne!(a, b);
        let c = peers[1].allocate_stream_id();
        assert_ne!(a, c);
    }

    #[test]
    fn loopback_detection_follows_host_boundaries() {
        let peers = StreamMultiplexer::new_job(2, 2);
        // workers 0,1 on host 0; workers 2,3 on host 1.
        assert!(peers[0].is_loopback(1));
        assert!(!peers[0].is_loopback(2));
        assert!(peers[3].is_loopback(2));
    }
}
