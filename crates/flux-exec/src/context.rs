//! Context (C10): the per-worker aggregate that binds the block pool, the
//! local group identity, the stream multiplexer, and the flow-control group,
//! and hands out `File`/`Stream`/collective primitives to operator nodes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use flux_core::config::FluxConfig;
use flux_core::transport::{FlowGroup, LocalFlowGroup, ReduceOp};
use flux_data::block::BlockPool;
use flux_data::codec::{ItemDecode, ItemEncode};
use flux_data::file::File;
use flux_net::mux::{StreamKind, StreamMultiplexer};
use flux_net::stream::Stream;
use tracing::debug;

/// A small per-worker counter table, read back by tests and by the CLI's
/// shutdown summary. Not shared across threads; each worker owns its own.
#[derive(Default)]
pub struct StatsGraph {
    counters: RefCell<HashMap<&'static str, u64>>,
}

impl StatsGraph {
    pub fn incr(&self, name: &'static str, by: u64) {
        *self.counters.borrow_mut().entry(name).or_insert(0) += by;
    }

    pub fn get(&self, name: &str) -> u64 {
        *self.counters.borrow().get(name).unwrap_or(&0)
    }
}

/// Per-worker aggregate (§3 "Context"). One instance per worker thread of
/// the simulated job; never shared between threads.
pub struct Context {
    pool: BlockPool,
    mux: StreamMultiplexer,
    flow: LocalFlowGroup,
    stats: StatsGraph,
    host_rank: usize,
    local_worker: usize,
    host_count: usize,
    workers_per_host: usize,
    block_size: usize,
    config: FluxConfig,
}

impl Context {
    /// Build one `Context` per worker of a whole job: `num_hosts *
    /// workers_per_host` of them, each sharing its host's block pool and the
    /// job-wide stream multiplexer and flow group, mirroring the way
    /// `StreamMultiplexer::new_job`/`LocalFlowGroup::new_group` already
    /// model a whole deployment in one process.
    pub fn new_job(config: &FluxConfig) -> Vec<Context> {
        let num_hosts = config.num_hosts().max(1);
        let workers_per_host = config.workers_per_host.max(1);
        let total_workers = num_hosts * workers_per_host;

        let host_pools: Vec<BlockPool> = (0..num_hosts)
            .map(|_| BlockPool::new(config.ram_budget, PathBuf::from(&config.disk_scratch_dir)))
            .collect();
        let muxes = StreamMultiplexer::new_job(num_hosts, workers_per_host);
        let flows = LocalFlowGroup::new_group(total_workers);
        debug!(num_hosts, workers_per_host, total_workers, "building job contexts");

        muxes
            .into_iter()
            .zip(flows)
            .enumerate()
            .map(|(worker_id, (mux, flow))| Context {
                pool: host_pools[worker_id / workers_per_host].clone(),
                mux,
                flow,
                stats: StatsGraph::default(),
                host_rank: worker_id / workers_per_host,
                local_worker: worker_id % workers_per_host,
                host_count: num_hosts,
                workers_per_host,
                block_size: config.block_size,
                config: config.clone(),
            })
            .collect()
    }

    /// The resolved configuration this worker's job was built from (§6);
    /// DOps size their reduce tables off `ram_budget`, `bucket_rate`,
    /// `max_partition_fill_rate`/`max_frame_fill_rate`, `table_rate_multiplier`,
    /// and `flush_mode` from here rather than hardcoding table shapes.
    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    pub fn pool(&self) -> BlockPool {
        self.pool.clone()
    }

    pub fn mux(&self) -> &StreamMultiplexer {
        &self.mux
    }

    pub fn flow(&self) -> &LocalFlowGroup {
        &self.flow
    }

    pub fn stats(&self) -> &StatsGraph {
        &self.stats
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn host_rank(&self) -> usize {
        self.host_rank
    }

    pub fn local_worker(&self) -> usize {
        self.local_worker
    }

    pub fn host_count(&self) -> usize {
        self.host_count
    }

    pub fn workers_per_host(&self) -> usize {
        self.workers_per_host
    }

    pub fn num_workers(&self) -> usize {
        self.mux.total_workers() as usize
    }

    pub fn worker_rank(&self) -> usize {
        self.mux.worker_id() as usize
    }

    /// A fresh, empty cache File for a DOp node's output.
    pub fn new_file(&self) -> File {
        self.stats.incr("files_created", 1);
        File::new()
    }

    pub fn new_cat_stream<T>(&self) -> Stream<T>
    where
        T: ItemEncode + ItemDecode,
    {
        self.stats.incr("streams_opened", 1);
        Stream::new(self.mux.clone(), self.pool.clone(), StreamKind::Cat, self.block_size)
    }

    pub fn new_mix_stream<T>(&self) -> Stream<T>
    where
        T: ItemEncode + ItemDecode,
    {
        self.stats.incr("streams_opened", 1);
        Stream::new(self.mux.clone(), self.pool.clone(), StreamKind::Mix, self.block_size)
    }

    pub fn barrier(&self) -> flux_core::Result<()> {
        self.flow.barrier()
    }

    pub fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> flux_core::Result<u64> {
        self.flow.all_reduce(value, op)
    }

    pub fn prefix_sum_u64(&self, value: u64) -> flux_core::Result<u64> {
        self.flow.prefix_sum(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_assigns_ranks_and_shares_host_pools() {
        let mut config = FluxConfig::default();
        config.workers_per_host = 2;
        config.hostlist = vec![
            "a:1".parse().unwrap(),
            "b:2".parse().unwrap(),
        ];
        let ctxs = Context::new_job(&config);
        assert_eq!(ctxs.len(), 4);
        assert_eq!(ctxs[0].host_rank(), 0);
        assert_eq!(ctxs[1].host_rank(), 0);
        assert_eq!(ctxs[2].host_rank(), 1);
        assert_eq!(ctxs[3].host_rank(), 1);
        assert_eq!(ctxs[0].local_worker(), 0);
        assert_eq!(ctxs[1].local_worker(), 1);
    }

    #[test]
    fn stats_graph_accumulates_per_name() {
        let stats = StatsGraph::default();
        stats.incr("blocks", 3);
        stats.incr("blocks", 4);
        assert_eq!(stats.get("blocks"), 7);
        assert_eq!(stats.get("missing"), 0);
    }
}
