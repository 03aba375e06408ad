//! One-shot `tracing` subscriber setup shared by every worker binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber driven by `RUST_LOG`, tagging
/// every line with the owning host/worker so that logs from a whole job
/// can be correlated after the fact.
///
/// Safe to call more than once per process (tests call it repeatedly); the
/// second and later calls are no-ops.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

/// Build the `tracing` span every worker thread should enter for the
/// duration of its run loop, so every log line it emits is tagged with its
/// coordinates in the job.
#[macro_export]
macro_rules! worker_span {
    ($host_rank:expr, $worker_id:expr) => {
        tracing::info_span!("worker", host_rank = $host_rank, worker_id = $worker_id)
    };
}
