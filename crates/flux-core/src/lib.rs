//! # flux-core
//!
//! Foundational types shared by every layer of the Flux dataflow engine:
//! the structured error taxonomy (§7), per-host configuration (§6), a
//! one-shot `tracing` subscriber, and the group-transport contract (C1)
//! that the stream layer and the flow-control collectives (Barrier,
//! AllReduce, Broadcast, PrefixSum) are built on.
//!
//! Nothing in this crate is specific to *what* a worker computes; that
//! lives in `flux-data` (block store), `flux-net` (streams), `flux-table`
//! (reduce tables), and `flux-exec` (the DIA graph and stage builder).

pub mod config;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::{FlushMode, FluxConfig, HostEndpoint};
pub use error::{FluxError, Result};
pub use logging::init_tracing;
pub use transport::{FlowGroup, LocalFlowGroup, ReduceOp};
