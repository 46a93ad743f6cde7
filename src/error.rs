//! Error taxonomy for the training job.
//!
//! Every variant is fatal to the owning process. Nothing in the loop retries;
//! the job scheduler owns relaunch policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DdpError {
    /// Launch environment or configuration is unusable. Raised before any
    /// collective call is made.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Peers could not be reached while forming the process group.
    #[error("rendezvous at {endpoint} failed: {reason}")]
    Rendezvous { endpoint: String, reason: String },

    /// A peer entered a different collective call than this rank.
    #[error(
        "collective desync on rank {rank}: local call #{expected}, peer {peer} sent call #{found}"
    )]
    CollectiveDesync {
        rank: usize,
        peer: usize,
        expected: u64,
        found: u64,
    },

    /// Peers did not arrive at a collective within the configured timeout.
    #[error("collective call #{seq} on rank {rank} timed out after {waited_secs}s")]
    CollectiveTimeout {
        rank: usize,
        seq: u64,
        waited_secs: u64,
    },

    #[error("collective transport error on rank {rank}: {reason}")]
    Transport { rank: usize, reason: String },

    #[error("process group is already initialized in this process")]
    AlreadyInitialized,

    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        epoch: usize,
        batch: usize,
        value: f64,
    },

    #[error(transparent)]
    Compute(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DdpError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(rank: usize, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            rank,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DdpError>;
