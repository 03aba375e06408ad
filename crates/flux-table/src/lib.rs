//! # flux-table
//!
//! The reduce pre-table (C8) and post-table (C9): per-worker partitioned
//! hash tables that do local aggregation, spill under memory pressure, and
//! (in the post-table's case) merge a spilled frame back in via a bounded
//! second-stage table on flush. Both share the bucket-block arena in
//! [`bucket`].

pub mod bucket;
pub mod post_table;
pub mod pre_table;

pub use bucket::{hash64, slots_per_block, BucketArena};
pub use post_table::{PostTable, ReduceToIndexTable};
pub use pre_table::PreTable;
