//! Core collective trait and backend configuration
//!
//! Every backend exposes the same blocking sum all-reduce over host `f32`
//! and `f64` buffers. Callers must invoke collectives the same number of times and in
//! the same order on every rank.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Collective backend selection
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// Pick `nccl` when compiled in, `tcp` otherwise; `single` for one rank.
    #[default]
    Auto,
    /// Single process, collectives are the identity.
    Single,
    /// Host-side star all-reduce over TCP.
    Tcp,
    /// NCCL all-reduce between GPUs (requires the 'nccl' feature).
    Nccl,
}

impl std::str::FromStr for SyncBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SyncBackend::Auto),
            "single" | "none" => Ok(SyncBackend::Single),
            "tcp" | "cpu" => Ok(SyncBackend::Tcp),
            "nccl" => Ok(SyncBackend::Nccl),
            _ => Err(format!(
                "Unknown collective backend: {}. Valid options: auto, single, tcp, nccl",
                s
            )),
        }
    }
}

impl SyncBackend {
    /// Resolve `Auto` against the world size and compiled features.
    pub fn resolve(&self, world_size: usize) -> SyncBackend {
        match self {
            SyncBackend::Auto if world_size <= 1 => SyncBackend::Single,
            SyncBackend::Auto if cfg!(feature = "nccl") => SyncBackend::Nccl,
            SyncBackend::Auto => SyncBackend::Tcp,
            other => other.clone(),
        }
    }
}

fn default_rendezvous_timeout() -> u64 {
    300
}

fn default_collective_timeout() -> u64 {
    1800
}

/// Configuration for the process group
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub backend: SyncBackend,

    /// How long peers keep trying to reach the rendezvous host.
    #[serde(default = "default_rendezvous_timeout")]
    pub rendezvous_timeout_secs: u64,

    /// Upper bound on a single collective call before it is reported as a
    /// timeout instead of hanging the job.
    #[serde(default = "default_collective_timeout")]
    pub collective_timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: SyncBackend::Auto,
            rendezvous_timeout_secs: default_rendezvous_timeout(),
            collective_timeout_secs: default_collective_timeout(),
        }
    }
}

/// Blocking collective operations among all ranks of the job.
///
/// Implementations track a per-rank call sequence number and reject a peer
/// whose sequence number differs, so a rank that skipped or added a call
/// fails fast instead of deadlocking.
pub trait Collective: Send + Sync {
    /// Elementwise sum across every rank. On return, `buf` holds the same
    /// values on every rank.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Same as [`all_reduce_sum`](Self::all_reduce_sum) at double precision,
    /// for metrics that must survive the round trip unrounded.
    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()>;

    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Wait until every rank reaches this point.
    fn barrier(&self) -> Result<()> {
        let mut token = [0.0f32];
        self.all_reduce_sum(&mut token)
    }

    /// Tear down transport state. Called once at process exit.
    fn shutdown(&self) -> Result<()> {
        self.barrier()
    }
}

/// Collective for a job of one process.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum_f64(&self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}
