//! NCCL-based collective backend
//!
//! One process per GPU. Rank 0 creates the NCCL unique id and hands it to
//! every other rank over the TCP rendezvous star; each process then builds a
//! single communicator bound to its own device (`local_rank`).
//!
//! # Requirements
//!
//! - CUDA 12.x
//! - NCCL library installed on the system
//! - Compile with `--features nccl`

use std::ffi::c_char;
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, CudaStream, DeviceRepr, ValidAsZeroBits};
use cudarc::nccl::{Comm, Id, NcclType, ReduceOp};

use super::rendezvous::Star;
use super::sync::Collective;
use crate::error::{DdpError, Result};

const NCCL_ID_BYTES: usize = 128;

/// NCCL communicator for this process's GPU.
///
/// NCCL frames carry no call tag, so a desynchronized rank is not detected
/// here; it surfaces as NCCL's own watchdog error or as a hang.
///
/// The communicator is wrapped in a Mutex; collectives are issued from the
/// training thread only, the lock just serializes any stray caller.
pub struct NcclCollective {
    stream: Arc<CudaStream>,
    comm: Mutex<Comm>,
    rank: usize,
    world_size: usize,
}

// SAFETY: The Mutex ensures that NCCL operations are serialized
unsafe impl Send for NcclCollective {}
unsafe impl Sync for NcclCollective {}

impl NcclCollective {
    /// Join the NCCL clique. `star` must already be connected; it is only
    /// used to distribute the unique id.
    pub fn new(star: &mut Star, device_ordinal: usize, rank: usize, world_size: usize) -> Result<Self> {
        let ctx = CudaContext::new(device_ordinal)
            .map_err(|e| DdpError::transport(rank, format!("Failed to create CUDA context: {:?}", e)))?;
        let stream = ctx.default_stream();

        let id = if rank == 0 {
            let id = Id::new()
                .map_err(|e| DdpError::transport(rank, format!("Failed to create NCCL id: {:?}", e)))?;
            let bytes: Vec<u8> = id.internal().iter().map(|&c| c as u8).collect();
            star.broadcast_bytes(Some(&bytes))?;
            id
        } else {
            let bytes = star.broadcast_bytes(None)?;
            if bytes.len() != NCCL_ID_BYTES {
                return Err(DdpError::transport(
                    rank,
                    format!("NCCL id has {} bytes, expected {}", bytes.len(), NCCL_ID_BYTES),
                ));
            }
            let mut internal = [0 as c_char; NCCL_ID_BYTES];
            for (dst, src) in internal.iter_mut().zip(bytes) {
                *dst = src as c_char;
            }
            Id::uninit(internal)
        };

        let comm = Comm::from_rank(stream.clone(), rank, world_size, id)
            .map_err(|e| DdpError::transport(rank, format!("Failed to create NCCL comm: {:?}", e)))?;

        log::info!(
            "NCCL collective initialized: rank {} of {} on GPU {}",
            rank,
            world_size,
            device_ordinal
        );

        Ok(Self {
            stream,
            comm: Mutex::new(comm),
            rank,
            world_size,
        })
    }
}

impl NcclCollective {
    /// Host buffer to device, sum all-reduce, and back.
    fn reduce<T>(&self, buf: &mut [T]) -> Result<()>
    where
        T: NcclType + DeviceRepr + ValidAsZeroBits + Clone + Default,
    {
        let rank = self.rank;
        let comm = self
            .comm
            .lock()
            .map_err(|_| DdpError::transport(rank, "NCCL communicator poisoned"))?;

        // Copy data to GPU
        let host: &[T] = buf;
        let gpu_data = self
            .stream
            .clone_htod(host)
            .map_err(|e| DdpError::transport(rank, format!("Failed to copy to GPU: {:?}", e)))?;

        // Allocate output buffer
        let mut output = self
            .stream
            .alloc_zeros::<T>(buf.len())
            .map_err(|e| DdpError::transport(rank, format!("Failed to allocate output: {:?}", e)))?;

        comm.all_reduce(&gpu_data, &mut output, &ReduceOp::Sum)
            .map_err(|e| DdpError::transport(rank, format!("NCCL all_reduce failed: {:?}", e)))?;

        // Copy result back to CPU
        let result: Vec<T> = self
            .stream
            .clone_dtoh(&output)
            .map_err(|e| DdpError::transport(rank, format!("Failed to copy from GPU: {:?}", e)))?;
        buf.clone_from_slice(&result);
        Ok(())
    }
}

impl Collective for NcclCollective {
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.reduce(buf)
    }

    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()> {
        self.reduce(buf)
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
