//! Data-parallel training support
//!
//! One process per GPU, launched by SLURM. Processes join a process group at
//! startup and keep their model replicas identical by averaging gradients
//! with an all-reduce after every backward pass.
//!
//! # Architecture
//!
//! The module uses a trait-based design with pluggable backends:
//!
//! - `Collective` - Core trait: blocking sum all-reduce over host `f32` / `f64` buffers
//! - `SingleProcess` - World of one, every collective is the identity
//! - `TcpCollective` - Default multi-rank backend, star all-reduce through rank 0
//! - `NcclCollective` - GPU all-reduce via NCCL (feature-gated)
//! - `LocalGroup` - Builds one `LocalCollective` per simulated rank, ranks run
//!   as threads of one process (tests)
//!
//! # Usage
//!
//! ```ignore
//! let group = ProcessGroup::init(&topology, &config.distributed, &config.device)?;
//! let mut model = DistributedModel::new(resnet, varmap, &group)?;
//!
//! // In training loop:
//! let synced_grads = model.backward(&loss, &group)?;
//! optimizer.step(&synced_grads)?;
//! ```

pub mod ddp;
#[cfg(test)]
pub mod local;
pub mod optimizer;
pub mod process_group;
pub mod rendezvous;
pub mod sync;
pub mod tcp;

#[cfg(feature = "nccl")]
pub mod nccl;

// Re-exports for convenience
pub use ddp::DistributedModel;
pub use optimizer::{DistributedSgd, SgdConfig};
pub use process_group::ProcessGroup;
pub use sync::SyncBackend;
