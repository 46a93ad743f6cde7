use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::TrainConfig;
use crate::error::{DdpError, Result};

// ============================================================================
// Dataset
// ============================================================================

/// Indexed collection of labelled images, read on the host.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    /// Gather the examples at `indices` into one CPU batch.
    fn batch(&self, indices: &[usize]) -> Result<Batch>;
}

/// One batch: images `[B, C, H, W]` (f32) and labels `[B]` (u32).
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: Tensor,
    pub target: Tensor,
}

impl Batch {
    /// Number of examples, taken from the input's first dimension.
    pub fn batch_size(&self) -> usize {
        self.input.dims().first().copied().unwrap_or(0)
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            input: self.input.to_device(device)?,
            target: self.target.to_device(device)?,
        })
    }
}

/// Dataset held entirely in memory as two tensors.
pub struct TensorDataset {
    images: Tensor,
    labels: Tensor,
}

impl TensorDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let (n, _c, _h, _w) = images.dims4()?;
        let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
        if labels.elem_count() != n {
            return Err(DdpError::config(format!(
                "dataset has {} images but {} labels",
                n,
                labels.elem_count()
            )));
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            labels,
        })
    }

    /// Load tensors `images` `[N, C, H, W]` and `labels` `[N]` from a
    /// safetensors file.
    pub fn from_safetensors<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                DdpError::config(format!("{} has no '{}' tensor", path.display(), name))
            })
        };
        let images = take("images")?;
        let labels = take("labels")?;
        let dataset = Self::new(images, labels)?;
        log::info!("Loaded {} examples from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    /// Random images whose mean intensity depends on the label, so a model
    /// can learn them. Same `seed` gives the same data on every process.
    pub fn synthetic(
        len: usize,
        num_classes: usize,
        channels: usize,
        image_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels = channels * image_size * image_size;
        let mut labels = Vec::with_capacity(len);
        let mut images = Vec::with_capacity(len * pixels);
        for _ in 0..len {
            let label = rng.gen_range(0..num_classes as u32);
            let level = label as f32 / num_classes as f32 - 0.5;
            labels.push(label);
            images.extend((0..pixels).map(|_| level + 0.25 * (rng.gen::<f32>() - 0.5)));
        }
        let images = Tensor::from_vec(images, (len, channels, image_size, image_size), &Device::Cpu)?;
        let labels = Tensor::from_vec(labels, len, &Device::Cpu)?;
        Self::new(images, labels)
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.labels.elem_count()
    }

    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), &Device::Cpu)?;
        Ok(Batch {
            input: self.images.index_select(&idx, 0)?,
            target: self.labels.index_select(&idx, 0)?,
        })
    }
}

/// Train and validation datasets for this run: safetensors files from
/// `data_dir`, or seeded synthetic data when `data_dir` is empty.
pub fn load_datasets(config: &TrainConfig) -> Result<(Arc<dyn Dataset>, Arc<dyn Dataset>)> {
    if config.data_dir.is_empty() {
        let d = &config.data;
        log::info!(
            "No data_dir given, generating synthetic data ({} train / {} val, {}x{})",
            d.synthetic_train_size,
            d.synthetic_val_size,
            d.image_size,
            d.image_size
        );
        let m = &config.model;
        let train = TensorDataset::synthetic(d.synthetic_train_size, m.num_classes, m.in_channels, d.image_size, d.seed)?;
        let val = TensorDataset::synthetic(d.synthetic_val_size, m.num_classes, m.in_channels, d.image_size, d.seed + 1)?;
        return Ok((Arc::new(train), Arc::new(val)));
    }

    let dir = Path::new(&config.data_dir);
    let train = TensorDataset::from_safetensors(dir.join("train.safetensors"))?;
    let val = TensorDataset::from_safetensors(dir.join("val.safetensors"))?;
    Ok((Arc::new(train), Arc::new(val)))
}

// ============================================================================
// Distributed Sampler
// ============================================================================

/// Splits dataset indices into one disjoint shard per rank.
///
/// Every rank gets exactly `ceil(len / world_size)` indices: the index list
/// is padded by wrapping around, then rank `r` takes positions
/// `r, r + world_size, ...`. With shuffling, the permutation is seeded with
/// `seed + epoch`, so all ranks agree on it as long as they call
/// [`set_epoch`](Self::set_epoch) with the same value.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, rank: usize, world_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(DdpError::config(format!(
                "sampler rank {} is outside world of {}",
                rank, world_size
            )));
        }
        Ok(Self {
            dataset_len,
            rank,
            world_size,
            shuffle,
            seed,
            epoch: 0,
        })
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    /// Shard size, identical on every rank.
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size)
    }

    /// This rank's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        let total_size = self.num_samples() * self.world_size;
        let mut i = 0;
        while indices.len() < total_size {
            indices.push(indices[i]);
            i += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

// ============================================================================
// Shard Loader (with optional prefetching)
// ============================================================================

/// Batches one rank's shard of a dataset, epoch by epoch.
pub struct ShardLoader {
    dataset: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    /// Batches assembled ahead of the consumer; 0 assembles inline.
    prefetch: usize,
}

impl ShardLoader {
    pub fn new(dataset: Arc<dyn Dataset>, sampler: DistributedSampler, batch_size: usize, prefetch: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(DdpError::config("batch_size must be > 0"));
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            prefetch,
        })
    }

    /// Batches per epoch. Every rank has the same shard size, so every rank
    /// runs the same number of steps.
    pub fn len(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    /// Iterator over this epoch's CPU batches. The last batch may be short.
    pub fn epoch_batches(&self) -> EpochBatches {
        let chunks: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        if self.prefetch == 0 {
            return EpochBatches::Inline {
                dataset: Arc::clone(&self.dataset),
                chunks: chunks.into_iter(),
            };
        }

        // Channel for passing prefetched batches (bounded to limit memory)
        let (sender, receiver) = mpsc::sync_channel(self.prefetch);
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let dataset = Arc::clone(&self.dataset);

        let worker = thread::spawn(move || {
            prefetch_worker(dataset, chunks, sender, stop_signal_clone);
        });

        EpochBatches::Prefetch {
            receiver: Some(receiver),
            worker: Some(worker),
            stop_signal,
        }
    }
}

/// Background worker that assembles batches ahead of the training thread
fn prefetch_worker(
    dataset: Arc<dyn Dataset>,
    chunks: Vec<Vec<usize>>,
    sender: SyncSender<Result<Batch>>,
    stop_signal: Arc<AtomicBool>,
) {
    for chunk in chunks {
        if stop_signal.load(Ordering::Relaxed) {
            break;
        }
        let batch = dataset.batch(&chunk);
        let failed = batch.is_err();
        // Blocks while the channel is full (backpressure)
        if sender.send(batch).is_err() || failed {
            break;
        }
    }
}

/// One epoch of batches, see [`ShardLoader::epoch_batches`].
pub enum EpochBatches {
    Inline {
        dataset: Arc<dyn Dataset>,
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch {
        receiver: Option<Receiver<Result<Batch>>>,
        worker: Option<JoinHandle<()>>,
        stop_signal: Arc<AtomicBool>,
    },
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            EpochBatches::Inline { dataset, chunks } => chunks.next().map(|c| dataset.batch(&c)),
            // A closed channel means the worker is done
            EpochBatches::Prefetch { receiver, .. } => receiver.as_ref()?.recv().ok(),
        }
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let EpochBatches::Prefetch {
            receiver,
            worker,
            stop_signal,
        } = self
        {
            stop_signal.store(true, Ordering::Relaxed);
            // Drop the receiver first to unblock a sender waiting on a full channel
            receiver.take();
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
