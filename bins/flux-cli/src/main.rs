//! Worker process entry point (§1a ambient stack): resolves a [`FluxConfig`]
//! from a YAML file, CLI flags, and the `FLUX_RANK`/`FLUX_HOSTLIST`
//! environment, then spins up one thread per simulated worker and runs a
//! built-in demo pipeline across them.
//!
//! This binary hosts a whole job's worth of workers in one process — the
//! same arrangement [`Context::new_job`] and its test suite already use —
//! rather than launching one process per host; wiring the stream
//! multiplexer and flow group across real processes is out of scope.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tracing::error;

use flux_core::{init_tracing, FluxConfig, HostEndpoint};
use flux_exec::context::Context;
use flux_exec::dia::Dia;
use flux_exec::operators::{materialize, prefix_sum, read_lines, reduce_pair, source, write_lines};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Pipeline {
    WordCount,
    PrefixSum,
}

/// Command-line arguments for a Flux worker process.
#[derive(Parser, Debug)]
#[command(name = "flux-cli")]
#[command(about = "Run a Flux dataflow job")]
#[command(long_about = "
flux-cli resolves a job configuration (a YAML file, CLI flags, and the
FLUX_RANK/FLUX_HOSTLIST environment variables, in that order of
precedence) and runs one of the built-in demo pipelines across every
worker the configuration describes.

Examples:
  flux-cli --pipeline word-count --input corpus.txt
  flux-cli --config job.yml --pipeline prefix-sum
  FLUX_RANK=1 flux-cli --hostlist a:9000,b:9000 --pipeline word-count
")]
struct Args {
    /// Path to a FluxConfig YAML file; falls back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the resolved config's `rank`.
    #[arg(long)]
    rank: Option<usize>,

    /// Overrides the resolved config's `hostlist`, as `host:port,host:port,...`.
    #[arg(long)]
    hostlist: Option<String>,

    /// Overrides the resolved config's `workers_per_host`.
    #[arg(long)]
    workers_per_host: Option<usize>,

    /// Which built-in demo pipeline to run.
    #[arg(long, value_enum, default_value_t = Pipeline::WordCount)]
    pipeline: Pipeline,

    /// Input text file for `word-count`, sharded across workers one line at
    /// a time via `ReadLines`. A small built-in corpus is used if omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output file prefix for `word-count`. Each worker writes its own
    /// partition of the result to `{prefix}.{rank:04}`; printed to stdout
    /// instead if omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<FluxConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            FluxConfig::load(path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => {
            let mut cfg = FluxConfig::default();
            cfg.apply_env_overrides()?;
            cfg
        }
    };
    if let Some(rank) = args.rank {
        cfg.rank = rank;
    }
    if let Some(hostlist) = &args.hostlist {
        cfg.hostlist = hostlist
            .split(',')
            .map(|s| s.parse::<HostEndpoint>())
            .collect::<flux_core::Result<Vec<_>>>()?;
    }
    if let Some(workers_per_host) = args.workers_per_host {
        cfg.workers_per_host = workers_per_host;
    }
    cfg.validate()?;
    Ok(cfg)
}

const SAMPLE_CORPUS: &[&str] = &[
    "the quick brown fox jumps over the lazy dog",
    "the dog barks at the quick fox",
    "a lazy cat sleeps while the fox runs",
];

fn run_word_count(ctx: Context, args: &Args) -> anyhow::Result<Vec<(String, u64)>> {
    let ctx: Rc<Context> = Rc::new(ctx);
    let lines: Dia<String> = match &args.input {
        Some(path) => read_lines(&ctx, path)?,
        None => {
            let total = ctx.num_workers().max(1);
            let rank = ctx.worker_rank();
            let shard: Vec<String> = SAMPLE_CORPUS
                .iter()
                .enumerate()
                .filter_map(|(i, line)| (i % total == rank).then(|| (*line).to_string()))
                .collect();
            source(shard)
        }
    };

    let pairs = lines
        .flat_map(|line: String| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .map(|word| (word, 1u64));
    let counted = reduce_pair(&pairs, ctx.clone(), |a, b| a + b);

    match &args.output {
        Some(prefix) => {
            let as_lines = counted.map(|(word, count)| format!("{word}\t{count}"));
            write_lines(&as_lines, &ctx, prefix)?;
            Ok(Vec::new())
        }
        None => Ok(materialize(&counted)?),
    }
}

fn run_prefix_sum(ctx: Context) -> anyhow::Result<Vec<u64>> {
    let ctx: Rc<Context> = Rc::new(ctx);
    let rank = ctx.worker_rank() as u64;
    let local: Vec<u64> = (1..=5u64).map(|v| v + rank * 10).collect();
    let dia = source(local);
    let summed = prefix_sum(&dia, ctx, 0);
    Ok(materialize(&summed)?)
}

enum WorkerOutput {
    Words(Vec<(String, u64)>),
    Numbers(Vec<u64>),
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args)?;
    let contexts = Context::new_job(&cfg);
    let pipeline = args.pipeline;

    let mut words: Vec<Vec<(String, u64)>> = Vec::new();
    let mut numbers: Vec<Vec<u64>> = Vec::new();

    // `Context` itself is `Send` (every field is `Arc`/channel-backed), but
    // the `Rc<Context>` the operator set runs on is not, so each worker
    // wraps its own bare `Context` in an `Rc` only after it lands on its
    // own thread.
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let mut handles = Vec::new();
        for ctx in contexts {
            let args = &args;
            handles.push(scope.spawn(move || -> anyhow::Result<WorkerOutput> {
                match pipeline {
                    Pipeline::WordCount => Ok(WorkerOutput::Words(run_word_count(ctx, args)?)),
                    Pipeline::PrefixSum => Ok(WorkerOutput::Numbers(run_prefix_sum(ctx)?)),
                }
            }));
        }
        for handle in handles {
            match handle.join().expect("worker thread panicked")? {
                WorkerOutput::Words(w) => words.push(w),
                WorkerOutput::Numbers(n) => numbers.push(n),
            }
        }
        Ok(())
    })?;

    match pipeline {
        Pipeline::WordCount if args.output.is_none() => {
            let mut merged: HashMap<String, u64> = HashMap::new();
            for partition in words {
                for (word, count) in partition {
                    *merged.entry(word).or_insert(0) += count;
                }
            }
            let mut rows: Vec<_> = merged.into_iter().collect();
            rows.sort();
            for (word, count) in rows {
                println!("{word}\t{count}");
            }
        }
        Pipeline::WordCount => {
            println!(
                "wrote word counts to {}.NNNN, one file per worker",
                args.output.as_ref().unwrap().display()
            );
        }
        Pipeline::PrefixSum => {
            for (rank, values) in numbers.into_iter().enumerate() {
                println!("worker {rank}: {values:?}");
            }
        }
    }
    Ok(())
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        error!(error = %err, "flux-cli failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
