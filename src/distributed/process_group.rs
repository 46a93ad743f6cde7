//! Process group bootstrap and handle
//!
//! A [`ProcessGroup`] is created exactly once per process, after the device
//! for this process has been selected and before any collective call. It is
//! passed explicitly to every component that reduces across ranks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use candle_core::{DType, Device, Tensor};

use super::rendezvous::{RendezvousSpec, Star};
use super::sync::{Collective, DistributedConfig, SingleProcess, SyncBackend};
use super::tcp::TcpCollective;
use crate::config::TargetDevice;
use crate::error::{DdpError, Result};
use crate::topology::Topology;

/// Set while a bootstrapped group is alive in this process.
static PROCESS_GROUP_ACTIVE: AtomicBool = AtomicBool::new(false);

pub struct ProcessGroup {
    collective: Box<dyn Collective>,
    device: Device,
    /// Holds the process-wide bootstrap guard.
    guarded: bool,
    closed: bool,
}

impl ProcessGroup {
    /// Bootstrap the process group for this process.
    ///
    /// Selects device `local_rank`, publishes the rendezvous variables and
    /// joins the collective backend. A second call while a group is alive
    /// fails with [`DdpError::AlreadyInitialized`].
    pub fn init(topology: &Topology, config: &DistributedConfig, target: &TargetDevice) -> Result<Self> {
        if PROCESS_GROUP_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DdpError::AlreadyInitialized);
        }

        match Self::bootstrap(topology, config, target) {
            Ok(group) => Ok(group),
            Err(e) => {
                PROCESS_GROUP_ACTIVE.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn bootstrap(topology: &Topology, config: &DistributedConfig, target: &TargetDevice) -> Result<Self> {
        let device = select_device(topology.local_rank, target)?;
        topology.export_env();

        let backend = config.backend.resolve(topology.world_size);
        log::info!(
            "Initializing process group: backend={:?} rendezvous={} device={:?}",
            backend,
            topology.rendezvous_endpoint(),
            device
        );

        let spec = RendezvousSpec {
            rank: topology.global_rank,
            world_size: topology.world_size,
            address: topology.master_address.clone(),
            port: topology.master_port,
            connect_timeout: Duration::from_secs(config.rendezvous_timeout_secs),
            io_timeout: Duration::from_secs(config.collective_timeout_secs),
        };

        let collective: Box<dyn Collective> = match backend {
            SyncBackend::Single | SyncBackend::Auto => {
                if topology.world_size > 1 {
                    return Err(DdpError::config(format!(
                        "single-process backend cannot serve a world of {} ranks",
                        topology.world_size
                    )));
                }
                Box::new(SingleProcess)
            }
            SyncBackend::Tcp => {
                let star = Star::connect(&spec)?;
                Box::new(TcpCollective::new(
                    star,
                    topology.global_rank,
                    topology.world_size,
                    config.collective_timeout_secs,
                ))
            }
            #[cfg(feature = "nccl")]
            SyncBackend::Nccl => {
                let mut star = Star::connect(&spec)?;
                Box::new(super::nccl::NcclCollective::new(
                    &mut star,
                    topology.local_rank,
                    topology.global_rank,
                    topology.world_size,
                )?)
            }
            #[cfg(not(feature = "nccl"))]
            SyncBackend::Nccl => {
                return Err(DdpError::config(
                    "NCCL backend requested but 'nccl' feature is not enabled. \
                     Compile with --features nccl to enable NCCL support.",
                ));
            }
        };

        let group = Self {
            collective,
            device,
            guarded: true,
            closed: false,
        };
        // Nobody proceeds until every rank has a working group.
        group.barrier()?;
        log::info!("Process group ready ({} ranks)", group.world_size());
        Ok(group)
    }

    /// Wrap an already-connected collective without taking the process-wide
    /// guard. Used to run several simulated ranks inside one process.
    #[cfg(test)]
    pub fn from_collective(collective: Box<dyn Collective>, device: Device) -> Self {
        Self {
            collective,
            device,
            guarded: false,
            closed: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn barrier(&self) -> Result<()> {
        self.collective.barrier()
    }

    /// Sum all-reduce of a host buffer, in place.
    pub fn all_reduce_sum_slice(&self, buf: &mut [f32]) -> Result<()> {
        self.collective.all_reduce_sum(buf)
    }

    /// Sum all-reduce of a tensor of any shape. The result keeps the input's
    /// shape, dtype and device. `F64` tensors are reduced at double
    /// precision; every other dtype travels as `f32`.
    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        let flat = tensor.flatten_all()?;
        if tensor.dtype() == DType::F64 {
            let mut buf: Vec<f64> = flat.to_vec1()?;
            self.collective.all_reduce_sum_f64(&mut buf)?;
            return Ok(Tensor::from_vec(buf, tensor.shape(), tensor.device())?);
        }
        let mut buf: Vec<f32> = flat.to_dtype(DType::F32)?.to_vec1()?;
        self.collective.all_reduce_sum(&mut buf)?;
        let reduced = Tensor::from_vec(buf, tensor.shape(), tensor.device())?;
        Ok(reduced.to_dtype(tensor.dtype())?)
    }

    /// Wait for queued device work. Used as a timing barrier only.
    pub fn synchronize_device(&self) -> Result<()> {
        Ok(self.device.synchronize()?)
    }

    /// Final barrier and transport teardown.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.collective.shutdown();
        if self.guarded {
            PROCESS_GROUP_ACTIVE.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.closed {
            // Skip the final barrier: peers may already be gone.
            self.closed = true;
            if self.guarded {
                PROCESS_GROUP_ACTIVE.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// One accelerator per process, indexed by local rank.
pub fn select_device(local_rank: usize, target: &TargetDevice) -> Result<Device> {
    match target {
        TargetDevice::Cpu => Ok(Device::Cpu),
        TargetDevice::Gpu => {
            let device = Device::cuda_if_available(local_rank)?;
            if device.is_cpu() {
                log::warn!("CUDA not available, local rank {} falls back to CPU", local_rank);
            }
            Ok(device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::local::LocalGroup;

    #[test]
    fn test_init_is_guarded_against_reinitialization() {
        let topo = Topology::single_process();
        let config = DistributedConfig::default();

        let group = ProcessGroup::init(&topo, &config, &TargetDevice::Cpu).unwrap();
        assert_eq!(group.world_size(), 1);
        assert!(matches!(
            ProcessGroup::init(&topo, &config, &TargetDevice::Cpu),
            Err(DdpError::AlreadyInitialized)
        ));

        group.shutdown().unwrap();
        let again = ProcessGroup::init(&topo, &config, &TargetDevice::Cpu).unwrap();
        drop(again);
    }

    #[test]
    fn test_tensor_all_reduce_keeps_shape_and_dtype() {
        let groups: Vec<ProcessGroup> = LocalGroup::new(2)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();
        let out: Vec<Tensor> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let t = Tensor::new(&[[1f64, 2.], [3., 4.]], &Device::Cpu).unwrap();
                        g.all_reduce_sum(&t).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for t in out {
            assert_eq!(t.dims(), &[2, 2]);
            assert_eq!(t.dtype(), DType::F64);
            assert_eq!(t.to_vec2::<f64>().unwrap(), vec![vec![2., 4.], vec![6., 8.]]);
        }
    }

    #[test]
    fn test_f64_tensor_is_not_rounded_through_f32() {
        let single = ProcessGroup::from_collective(Box::new(SingleProcess), Device::Cpu);
        let values = [0.1f64, 100.0 / 3.0, 2.302585092994046];
        let t = Tensor::new(&values, &Device::Cpu).unwrap();
        let out = single.all_reduce_sum(&t).unwrap();
        assert_eq!(out.dtype(), DType::F64);
        assert_eq!(out.to_vec1::<f64>().unwrap(), values.to_vec());

        // f32 tensors keep their dtype through the f32 path
        let narrow = Tensor::new(&[1.5f32, -2.0], &Device::Cpu).unwrap();
        let out = single.all_reduce_sum(&narrow).unwrap();
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.5, -2.0]);
    }
}
