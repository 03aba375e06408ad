//! Per-host configuration, resolved from a YAML file, built-in defaults, and
//! (for `rank`/`hostlist` only) process environment variables — mirroring
//! the two-tier resolution the original pipeline-spec loader used.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FluxError, Result};

/// One of the five pluggable pre-table flush ordering policies (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Round-robin schedule forming edge-disjoint matchings; local worker flushed last.
    OneFactor,
    /// Partitions ordered by current item count, smallest first.
    SmallestFirst,
    /// Least-recently-flushed partition first.
    Lru,
    /// Least-frequently-flushed partition first.
    Lfu,
    /// Uniform random partition order, for experimentation.
    Random,
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::OneFactor
    }
}

/// A single `host:port` endpoint, position in the list is the host's rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::str::FromStr for HostEndpoint {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| FluxError::misuse(format!("malformed host endpoint: {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| FluxError::misuse(format!("malformed port in endpoint: {s}")))?;
        Ok(HostEndpoint { host: host.to_string(), port })
    }
}

/// Recognized configuration options (§6), with built-in defaults matching a
/// single-host, in-memory-only development run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxConfig {
    /// Target capacity of a byte block in bytes.
    pub block_size: usize,
    /// Total resident bytes allowed across all block pools on a host.
    pub ram_budget: usize,
    /// Directory for spill files.
    pub disk_scratch_dir: String,
    /// Split between bucket-head pointers and bucket blocks in reduce tables.
    pub bucket_rate: f64,
    /// Pre-table per-partition fill trigger.
    pub max_partition_fill_rate: f64,
    /// Post-table per-frame spill trigger.
    pub max_frame_fill_rate: f64,
    /// Selects one of the five pre-table flush policies.
    pub flush_mode: FlushMode,
    /// Post-table second-stage budget fraction.
    pub table_rate_multiplier: f64,
    /// Number of worker threads per host.
    pub workers_per_host: usize,
    /// Ordered list of `host:port` endpoints; position = host rank.
    pub hostlist: Vec<HostEndpoint>,
    /// This host's rank; must match its position in `hostlist`.
    pub rank: usize,
}

impl Default for FluxConfig {
    fn default() -> Self {
        FluxConfig {
            block_size: 2 * 1024 * 1024,
            ram_budget: 1024 * 1024 * 1024,
            disk_scratch_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            bucket_rate: 0.5,
            max_partition_fill_rate: 0.9,
            max_frame_fill_rate: 0.9,
            flush_mode: FlushMode::OneFactor,
            table_rate_multiplier: 0.1,
            workers_per_host: 1,
            hostlist: vec![HostEndpoint { host: "127.0.0.1".into(), port: 9000 }],
            rank: 0,
        }
    }
}

impl FluxConfig {
    /// Load a config file, layering it over the defaults, then let
    /// `FLUX_RANK`/`FLUX_HOSTLIST` environment variables fill in `rank` and
    /// `hostlist` if the file left them at their (unset) defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| FluxError::io(path, e))?;
        let mut cfg: FluxConfig = serde_yaml::from_str(&contents)
            .map_err(|e| FluxError::misuse(format!("invalid config {}: {e}", path.display())))?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Resolve `rank`/`hostlist` from the environment when the config did
    /// not set them explicitly (§6: "a host reads its rank and hostlist from
    /// process environment when no explicit configuration is passed").
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(rank) = std::env::var("FLUX_RANK") {
            self.rank = rank
                .parse()
                .map_err(|_| FluxError::misuse(format!("FLUX_RANK not an integer: {rank}")))?;
        }
        if let Ok(hostlist) = std::env::var("FLUX_HOSTLIST") {
            self.hostlist = hostlist
                .split(',')
                .map(|s| s.parse())
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(())
    }

    pub fn num_hosts(&self) -> usize {
        self.hostlist.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank >= self.hostlist.len() {
            return Err(FluxError::misuse(format!(
                "rank {} out of range for hostlist of length {}",
                self.rank,
                self.hostlist.len()
            )));
        }
        if self.workers_per_host == 0 {
            return Err(FluxError::misuse("workers_per_host must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_host_valid() {
        let cfg = FluxConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.num_hosts(), 1);
    }

    #[test]
    fn env_overrides_rank_and_hostlist() {
        std::env::set_var("FLUX_RANK", "2");
        std::env::set_var("FLUX_HOSTLIST", "a:1,b:2,c:3");
        let mut cfg = FluxConfig::default();
        cfg.apply_env_overrides().unwrap();
        assert_eq!(cfg.rank, 2);
        assert_eq!(cfg.num_hosts(), 3);
        assert!(cfg.validate().is_ok());
        std::env::remove_var("FLUX_RANK");
        std::env::remove_var("FLUX_HOSTLIST");
    }

    #[test]
    fn host_endpoint_parses() {
        let ep: HostEndpoint = "localhost:9001".parse().unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 9001);
    }

    #[test]
    fn rejects_rank_out_of_range() {
        let mut cfg = FluxConfig::default();
        cfg.rank = 5;
        assert!(cfg.validate().is_err());
    }
}
