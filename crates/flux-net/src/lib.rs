//! # flux-net
//!
//! The per-host stream multiplexer (C6) and the all-to-all `Stream`
//! abstraction built on top of it (C7): `CatStream`/`MixStream` readers,
//! `w` writer endpoints per stream, and `Scatter`. Everything here moves
//! only [`flux_data::block_ref::BlockRef`]s — the typed side lives in the
//! [`flux_data::writer::Writer`]/[`flux_data::reader::Reader`] pair this
//! crate reuses, not in anything mux-specific.

pub mod header;
pub mod mux;
pub mod stream;

pub use header::{BlockHeader, FLAG_END_OF_STREAM, HEADER_LEN};
pub use mux::{StreamKind, StreamMultiplexer};
pub use stream::{CatSource, MixSource, MuxSink, Stream, StreamSource};
