//! Stream (C7): one all-to-all typed data exchange built on top of the
//! multiplexer's per-`(stream, source, target)` queues (§4.5). A `Stream<T>`
//! exposes exactly `w` writers — one per global target worker — and, once
//! every peer has closed its writer, a reader that either concatenates
//! (`Cat`) or interleaves (`Mix`) the incoming sub-queues.

use std::collections::VecDeque;
use std::marker::PhantomData;

use flux_core::{FluxError, Result};
use flux_data::block::BlockPool;
use flux_data::block_ref::BlockRef;
use flux_data::codec::{ItemDecode, ItemEncode};
use flux_data::file::{File, FileReaderSource};
use flux_data::queue::BlockQueue;
use flux_data::reader::Reader;
use flux_data::sink::{BlockSink, BlockSource};
use flux_data::writer::Writer;

use crate::mux::{StreamKind, StreamMultiplexer};

/// The [`BlockSink`] half of one writer endpoint of a [`Stream`]: every
/// `put` goes through [`StreamMultiplexer::dispatch`], `close` through
/// [`StreamMultiplexer::dispatch_close`].
pub struct MuxSink {
    mux: StreamMultiplexer,
    stream_id: u64,
    kind: StreamKind,
    target_worker: u32,
    closed: bool,
}

impl BlockSink for MuxSink {
    fn push(&mut self, block_ref: BlockRef) -> Result<()> {
        self.mux.dispatch(self.stream_id, self.target_worker, self.kind, block_ref)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(FluxError::protocol("stream writer closed twice"));
        }
        self.closed = true;
        self.mux.dispatch_close(self.stream_id, self.target_worker, self.kind)
    }
}

/// [`BlockSource`] that concatenates `w` per-source sub-queues in
/// source-rank order (§4.5: "never consults sub-queues j > i before i is
/// closed").
pub struct CatSource {
    queues: VecDeque<BlockQueue>,
}

impl BlockSource for CatSource {
    fn next_ref(&mut self) -> Result<Option<BlockRef>> {
        loop {
            let Some(front) = self.queues.front() else { return Ok(None) };
            match front.pop()? {
                Some(r) => return Ok(Some(r)),
                None => {
                    self.queues.pop_front();
                }
            }
        }
    }
}

/// [`BlockSource`] over the multiplexer's single shared merged queue for a
/// Mix stream; ordering across sources is whatever arrival order the
/// multiplexer's mutex serialized (§4.5: "no ordering guarantee").
pub struct MixSource {
    queue: BlockQueue,
}

impl BlockSource for MixSource {
    fn next_ref(&mut self) -> Result<Option<BlockRef>> {
        self.queue.pop()
    }
}

/// Either flavor of stream source, so callers can hold one `Reader<T,
/// StreamSource>` regardless of which kind they asked for.
pub enum StreamSource {
    Cat(CatSource),
    Mix(MixSource),
}

impl BlockSource for StreamSource {
    fn next_ref(&mut self) -> Result<Option<BlockRef>> {
        match self {
            StreamSource::Cat(s) => s.next_ref(),
            StreamSource::Mix(s) => s.next_ref(),
        }
    }
}

/// One all-to-all exchange of items of type `T` (§3 "Stream").
pub struct Stream<T> {
    mux: StreamMultiplexer,
    pool: BlockPool,
    stream_id: u64,
    kind: StreamKind,
    block_size: usize,
    writers_taken: bool,
    reader_taken: bool,
    _marker: PhantomData<T>,
}

impl<T> Stream<T>
where
    T: ItemEncode + ItemDecode,
{
    pub fn new(mux: StreamMultiplexer, pool: BlockPool, kind: StreamKind, block_size: usize) -> Self {
        let stream_id = mux.allocate_stream_id();
        Stream { mux, pool, stream_id, kind, block_size, writers_taken: false, reader_taken: false, _marker: PhantomData }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// The stream's `w` writer endpoints, one per global target worker, in
    /// target-rank order. May be taken only once.
    pub fn writers(&mut self) -> Result<Vec<Writer<T, MuxSink>>> {
        if self.writers_taken {
            return Err(FluxError::misuse("stream writers already taken"));
        }
        self.writers_taken = true;
        Ok((0..self.mux.total_workers())
            .map(|target_worker| {
                let sink = MuxSink {
                    mux: self.mux.clone(),
                    stream_id: self.stream_id,
                    kind: self.kind,
                    target_worker,
                    closed: false,
                };
                Writer::new(self.pool.clone(), sink, self.block_size)
            })
            .collect())
    }

    /// The stream's reader, concatenating or interleaving per-source
    /// sub-queues per `kind`. May be taken only once; blocks on first use
    /// until data or end-of-stream arrives from the relevant sources.
    pub fn reader(&mut self) -> Result<Reader<T, StreamSource>> {
        if self.reader_taken {
            return Err(FluxError::misuse("stream reader already taken"));
        }
        self.reader_taken = true;
        let source = match self.kind {
            StreamKind::Cat => StreamSource::Cat(CatSource { queues: self.mux.cat_queues_in_order(self.stream_id).into() }),
            StreamKind::Mix => StreamSource::Mix(MixSource { queue: self.mux.mix_queue(self.stream_id) }),
        };
        Ok(Reader::new(source, true))
    }

    /// Partition `source`'s item sequence at `offsets` (length `w + 1`) and
    /// send range `[offsets[i], offsets[i+1])` to target worker `i` (§4.5
    /// Scatter). Consumes the stream's writers; at most one Scatter or
    /// writer-sequence per stream instance.
    pub fn scatter(&mut self, source: &File, offsets: &[usize]) -> Result<()> {
        let total_workers = self.mux.total_workers() as usize;
        if offsets.len() != total_workers + 1 {
            return Err(FluxError::misuse(format!(
                "scatter offsets length {} must equal total_workers + 1 ({})",
                offsets.len(),
                total_workers + 1
            )));
        }
        let mut writers = self.writers()?;
        let mut reader: Reader<T, FileReaderSource> = Reader::new(source.reader(false)?, false);
        for target in 0..total_workers {
            let count = offsets[target + 1]
                .checked_sub(offsets[target])
                .ok_or_else(|| FluxError::misuse("scatter offsets must be non-decreasing"))?;
            for _ in 0..count {
                let item = reader
                    .next()?
                    .ok_or_else(|| FluxError::protocol("scatter offsets exceed source file's item count"))?;
                writers[target].put(&item)?;
            }
        }
        for w in writers.iter_mut() {
            w.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool() -> BlockPool {
        BlockPool::new(1 << 20, std::env::temp_dir())
    }

    #[test]
    fn cat_stream_orders_by_source_rank() {
        // Mirrors seed test S6: 3 workers each emit their rank 100 times on
        // a single CatStream to worker 0; worker 0's reader yields 100
        // zeroes, then 100 ones, then 100 twos.
        let peers = StreamMultiplexer::new_job(1, 3);
        let block_size = 256;
        let mut handles = Vec::new();
        for (rank, mux) in peers.iter().cloned().enumerate().skip(1) {
            let p = pool();
            handles.push(thread::spawn(move || {
                let mut stream: Stream<u32> = Stream::new(mux, p, StreamKind::Cat, block_size);
                let mut writers = stream.writers().unwrap();
                for _ in 0..100 {
                    writers[0].put(&(rank as u32)).unwrap();
                }
                for w in writers.iter_mut() {
                    w.finish().unwrap();
                }
            }));
        }
        let mux0 = peers[0].clone();
        let p0 = pool();
        let reader_handle = thread::spawn(move || {
            let mut stream: Stream<u32> = Stream::new(mux0, p0, StreamKind::Cat, block_size);
            let mut writers = stream.writers().unwrap();
            for _ in 0..100 {
                writers[0].put(&0u32).unwrap();
            }
            for w in writers.iter_mut() {
                w.finish().unwrap();
            }
            let mut reader = stream.reader().unwrap();
            let mut got = Vec::new();
            while let Some(v) = reader.next().unwrap() {
                got.push(v);
            }
            got
        });
        for h in handles {
            h.join().unwrap();
        }
        let got = reader_handle.join().unwrap();
        assert_eq!(got.len(), 300);
        assert!(got[0..100].iter().all(|&v| v == 0));
        assert!(got[100..200].iter().all(|&v| v == 1));
        assert!(got[200..300].iter().all(|&v| v == 2));
    }

    #[test]
    fn scatter_splits_a_file_by_item_offset() {
        // Mirrors seed test S3.
        let peers = StreamMultiplexer::new_job(1, 2);
        let p = pool();
        let source = File::new();
        {
            let mut writer: Writer<String, flux_data::file::FileWriterSink> =
                Writer::new(p.clone(), source.writer().unwrap(), 64);
            for s in ["a", "b", "c", "d"] {
                writer.put(&s.to_string()).unwrap();
            }
            writer.finish().unwrap();
        }

        let mux0 = peers[0].clone();
        let mux1 = peers[1].clone();
        let p1 = pool();
        let reader1 = thread::spawn(move || {
            let mut stream: Stream<String> = Stream::new(mux1, p1, StreamKind::Cat, 64);
            stream.reader().unwrap()
        });
        let mut stream0: Stream<String> = Stream::new(mux0, p, StreamKind::Cat, 64);
        stream0.scatter(&source, &[0, 2, 4]).unwrap();

        let mut reader1 = reader1.join().unwrap();
        assert_eq!(reader1.next().unwrap(), Some("c".to_string()));
        assert_eq!(reader1.next().unwrap(), Some("d".to_string()));
        assert_eq!(reader1.next().unwrap(), None);
    }
}
