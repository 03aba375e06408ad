//! # flux-data
//!
//! The storage spine underneath everything that moves items around in
//! Flux: fixed-capacity [`block::BlockPool`] pages that spill to disk under
//! RAM pressure (C2), the typed [`writer::Writer`]/[`reader::Reader`] pair
//! that packs/unpacks items into those pages (C3), [`file::File`] for
//! cached stage output (C4), and [`queue::BlockQueue`] for the hand-off
//! between a producer and a consumer (C5).

pub mod block;
pub mod block_ref;
pub mod codec;
pub mod file;
pub mod queue;
pub mod reader;
pub mod sink;
pub mod writer;

pub use block::{BlockId, BlockPool};
pub use block_ref::BlockRef;
pub use codec::{DecodeResult, ItemDecode, ItemEncode};
pub use file::File;
pub use queue::BlockQueue;
pub use reader::Reader;
pub use sink::{BlockSink, BlockSource};
pub use writer::Writer;
