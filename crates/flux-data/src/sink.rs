//! The two narrow traits [`crate::writer::Writer`] and [`crate::reader::Reader`]
//! are generic over: a place to deposit finalized blocks, and a place to
//! pull them from. [`crate::file::File`] and [`crate::queue::BlockQueue`]
//! both implement these; the stream multiplexer in `flux-net` implements
//! [`BlockSink`] too, stamping its blocks with routing headers on the way
//! out.

use flux_core::Result;

use crate::block_ref::BlockRef;

/// Somewhere a [`crate::writer::Writer`] can hand off finalized blocks.
pub trait BlockSink {
    fn push(&mut self, block_ref: BlockRef) -> Result<()>;
    /// Signal that no more blocks are coming.
    fn close(&mut self) -> Result<()>;
}

/// Somewhere a [`crate::reader::Reader`] can pull finalized blocks from, in
/// order. Returns `Ok(None)` once the source is exhausted and closed.
pub trait BlockSource {
    fn next_ref(&mut self) -> Result<Option<BlockRef>>;
}
