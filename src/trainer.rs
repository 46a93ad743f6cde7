use candle_core::DType;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{CheckpointMeta, TrainConfig};
use crate::data::{Dataset, DistributedSampler, ShardLoader};
use crate::distributed::{DistributedModel, DistributedSgd, ProcessGroup, SgdConfig};
use crate::error::{DdpError, Result};
use crate::metrics::{accuracy, LogCadence, LoggedMetrics, PassMeters, SharedStep};
use crate::model::Classifier;

const TOPK: [usize; 2] = [1, 5];

/// Validation outcome of one epoch, averaged across ranks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    pub top1: f64,
    pub top5: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochResult {
    pub epoch: usize,
    pub validation_top1: f64,
    pub is_new_best: bool,
}

/// `base_lr * factor^(epoch / every)`
pub fn step_decay_lr(base_lr: f64, epoch: usize, every: usize, factor: f64) -> f64 {
    base_lr * factor.powi((epoch / every) as i32)
}

/// Runs the epoch loop for one rank.
///
/// Every rank executes the same sequence of collective calls: one gradient
/// all-reduce per train batch, one metric reduction per logged train batch
/// and per validation batch, plus buffer broadcasts inside the model's
/// forward. Output is printed by the master only.
pub struct Trainer<'a, M: Classifier> {
    config: TrainConfig,
    group: &'a ProcessGroup,
    is_master: bool,
    model: DistributedModel<M>,
    optimizer: DistributedSgd,
    train_loader: ShardLoader,
    val_loader: ShardLoader,
    train_cadence: LogCadence,
    eval_print_cadence: LogCadence,
    // Reset at the start of every pass
    train_meters: PassMeters,
    eval_meters: PassMeters,
    best_top1: f64,
    // JSON logging (master only)
    metrics_path: Option<PathBuf>,
}

impl<'a, M: Classifier> Trainer<'a, M> {
    pub fn new(
        config: TrainConfig,
        group: &'a ProcessGroup,
        is_master: bool,
        model: DistributedModel<M>,
        train_set: Arc<dyn Dataset>,
        val_set: Arc<dyn Dataset>,
    ) -> Result<Self> {
        let (rank, world_size) = (group.rank(), group.world_size());

        // Train shards are reshuffled every epoch; validation keeps its order
        let train_sampler = DistributedSampler::new(train_set.len(), rank, world_size, true, config.data.seed)?;
        let val_sampler = DistributedSampler::new(val_set.len(), rank, world_size, false, config.data.seed)?;
        let train_loader = ShardLoader::new(train_set, train_sampler, config.batch_size, config.prefetch)?;
        let val_loader = ShardLoader::new(val_set, val_sampler, config.batch_size, config.prefetch)?;

        let optimizer = DistributedSgd::new(SgdConfig {
            lr: config.learning_rate,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
        });
        log::debug!("Optimizer ready with {} parameter group(s)", optimizer.param_groups().len());

        let metrics_path = if is_master {
            config.output_path("metrics.jsonl")
        } else {
            None
        };
        if is_master && !config.save_dir.is_empty() {
            std::fs::create_dir_all(&config.save_dir)?;
        }
        if is_master && config.save_model && config.save_dir.is_empty() {
            log::warn!("--save-model given without --save_dir, checkpoints are disabled");
        }

        log::info!(
            "Shards: {} train / {} val batches per epoch per rank",
            train_loader.len(),
            val_loader.len()
        );

        Ok(Self {
            train_cadence: LogCadence::new(config.log_interval)?,
            eval_print_cadence: LogCadence::new(config.eval_log_interval)?,
            config,
            group,
            is_master,
            model,
            optimizer,
            train_loader,
            val_loader,
            train_meters: PassMeters::default(),
            eval_meters: PassMeters::default(),
            best_top1: 0.0,
            metrics_path,
        })
    }

    /// Train and validate for `config.epochs` epochs.
    pub fn fit(&mut self) -> Result<Vec<EpochResult>> {
        let mut results = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            // Same value on every rank keeps the shards disjoint
            self.train_loader.set_epoch(epoch);

            let lr = step_decay_lr(
                self.config.learning_rate,
                epoch,
                self.config.lr_decay_epochs,
                self.config.lr_decay_factor,
            );
            if lr != self.optimizer.learning_rate() {
                log::info!("Epoch {}: learning rate {:.6e}", epoch, lr);
            }
            self.optimizer.set_learning_rate(lr);

            self.train_one_epoch(epoch)?;
            let summary = self.validate(epoch)?;

            let is_new_best = summary.top1 > self.best_top1;
            if is_new_best {
                self.best_top1 = summary.top1;
                if self.is_master && self.config.save_model {
                    self.save_checkpoint(epoch, summary.top1)?;
                }
            }

            if self.is_master {
                println!("Epoch Summary: ");
                println!("\tEpoch Accuracy: {}", summary.top1);
                println!("\tBest Accuracy: {}", self.best_top1);
                self.append_record(serde_json::json!({
                    "kind": "epoch",
                    "epoch": epoch,
                    "learning_rate": lr,
                    "val_loss": summary.loss,
                    "val_top1": summary.top1,
                    "val_top5": summary.top5,
                    "best_top1": self.best_top1,
                    "is_new_best": is_new_best,
                    "timestamp": chrono::Local::now().to_rfc3339(),
                }));
            }

            results.push(EpochResult {
                epoch,
                validation_top1: summary.top1,
                is_new_best,
            });
        }

        Ok(results)
    }

    /// One pass over this rank's training shard.
    pub fn train_one_epoch(&mut self, epoch: usize) -> Result<PassMeters> {
        self.model.train();
        let group = self.group;
        let num_batches = self.train_loader.len();
        self.train_meters.reset();

        let mut window_start = Instant::now();
        let mut window_batches = 0usize;

        for (i, batch) in self.train_loader.epoch_batches().enumerate() {
            let batch = batch?.to_device(group.device())?;
            let batch_size = batch.batch_size();

            let output = self.model.forward(&batch.input, group)?;
            let loss = candle_nn::loss::cross_entropy(&output, &batch.target)?;

            // Gradients are fresh for every backward pass
            let synced_grads = self.model.backward(&loss, group)?;
            self.optimizer.step(&synced_grads)?;
            window_batches += 1;

            if !self.train_cadence.is_due(SharedStep { batch: i }) {
                continue;
            }

            let acc = accuracy(&output, &batch.target, &TOPK)?;
            let local = LoggedMetrics {
                loss: loss.to_dtype(DType::F64)?.to_scalar::<f64>()?,
                top1: acc[0],
                top5: acc[1],
            };
            let reduced = local.reduce(group)?;
            ensure_finite(reduced.loss, epoch, i)?;

            group.synchronize_device()?;
            let batch_time = window_start.elapsed().as_secs_f64() / window_batches as f64;
            self.train_meters.record(reduced, batch_size, batch_time);
            window_start = Instant::now();
            window_batches = 0;

            if self.is_master {
                let header = format!("Epoch: [{}][{}/{}]", epoch, i, num_batches);
                println!("{}", self.train_meters.progress_line(&header, group.world_size(), batch_size));
                self.append_record(serde_json::json!({
                    "kind": "train",
                    "epoch": epoch,
                    "batch": i,
                    "loss": reduced.loss,
                    "top1": reduced.top1,
                    "top5": reduced.top5,
                    "batch_time": batch_time,
                    "learning_rate": self.optimizer.learning_rate(),
                }));
            }
        }

        Ok(self.train_meters.clone())
    }

    /// Forward-only pass over this rank's validation shard. Every batch is
    /// reduced; progress is printed every `eval_log_interval` batches.
    pub fn validate(&mut self, epoch: usize) -> Result<EvalSummary> {
        self.model.eval();
        let group = self.group;
        let num_batches = self.val_loader.len();
        let reduce_cadence = LogCadence::every_batch();
        self.eval_meters.reset();

        let mut window_start = Instant::now();
        let mut window_batches = 0usize;

        for (i, batch) in self.val_loader.epoch_batches().enumerate() {
            let batch = batch?.to_device(group.device())?;
            let batch_size = batch.batch_size();

            let output = self.model.forward(&batch.input, group)?.detach();
            let loss = candle_nn::loss::cross_entropy(&output, &batch.target)?;
            window_batches += 1;

            let step = SharedStep { batch: i };
            if !reduce_cadence.is_due(step) {
                continue;
            }

            let acc = accuracy(&output, &batch.target, &TOPK)?;
            let local = LoggedMetrics {
                loss: loss.to_dtype(DType::F64)?.to_scalar::<f64>()?,
                top1: acc[0],
                top5: acc[1],
            };
            let reduced = local.reduce(group)?;
            ensure_finite(reduced.loss, epoch, i)?;

            group.synchronize_device()?;
            let batch_time = window_start.elapsed().as_secs_f64() / window_batches as f64;
            self.eval_meters.record(reduced, batch_size, batch_time);
            window_start = Instant::now();
            window_batches = 0;

            if self.is_master && self.eval_print_cadence.is_due(step) {
                let header = format!("Test: [{}/{}]", i, num_batches);
                println!("{}", self.eval_meters.progress_line(&header, group.world_size(), batch_size));
            }
        }

        if self.is_master {
            println!(" * Prec@1 {:.3} Prec@5 {:.3}", self.eval_meters.top1.mean, self.eval_meters.top5.mean);
        }

        Ok(EvalSummary {
            top1: self.eval_meters.top1.mean,
            top5: self.eval_meters.top5.mean,
            loss: self.eval_meters.losses.mean,
        })
    }

    pub fn best_top1(&self) -> f64 {
        self.best_top1
    }

    pub fn model(&self) -> &DistributedModel<M> {
        &self.model
    }

    fn save_checkpoint(&self, epoch: usize, top1: f64) -> Result<()> {
        let (Some(path), Some(meta_path)) = (
            self.config.output_path("checkpoint.safetensors"),
            self.config.output_path("checkpoint.meta.json"),
        ) else {
            return Ok(());
        };
        self.model.varmap().save(&path)?;
        CheckpointMeta::new(epoch, top1, self.group.world_size(), &path, &self.config.model).save(&meta_path)?;
        log::info!("Saved checkpoint {} (epoch {}, Prec@1 {:.3})", path.display(), epoch, top1);
        Ok(())
    }

    /// Silent log to file (master only)
    fn append_record(&self, record: serde_json::Value) {
        let Some(path) = &self.metrics_path else {
            return;
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", record));
        if let Err(e) = result {
            log::warn!("Failed to append to {}: {}", path.display(), e);
        }
    }
}

/// The reduced loss is identical on every rank, so every rank fails here
/// together and nobody is left waiting inside a collective.
fn ensure_finite(loss: f64, epoch: usize, batch: usize) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(DdpError::NonFiniteLoss {
            epoch,
            batch,
            value: loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorDataset;
    use crate::distributed::local::LocalGroup;
    use crate::config::ModelConfig;
    use crate::model::tests::TinyClassifier;
    use crate::model::build_resnet;
    use candle_core::Device;
    use std::collections::BTreeMap;

    #[test]
    fn test_step_decay_schedule() {
        let lr = |epoch| step_decay_lr(0.1, epoch, 75, 0.1);
        for epoch in 0..75 {
            assert_eq!(lr(epoch), 0.1);
        }
        for (boundary, expected) in [(75, 0.01), (150, 0.001), (225, 0.0001)] {
            assert!((lr(boundary) - expected).abs() < 1e-15);
            assert!((lr(boundary - 1) / lr(boundary) - 10.0).abs() < 1e-9);
            assert_eq!(lr(boundary), lr(boundary + 74));
        }
    }

    #[test]
    fn test_non_finite_loss_is_error() {
        assert!(ensure_finite(2.5, 0, 0).is_ok());
        assert!(matches!(
            ensure_finite(f64::NAN, 3, 40),
            Err(DdpError::NonFiniteLoss { epoch: 3, batch: 40, .. })
        ));
        assert!(ensure_finite(f64::INFINITY, 0, 0).is_err());
    }

    fn tiny_config(epochs: usize) -> TrainConfig {
        let mut config = TrainConfig {
            batch_size: 4,
            epochs,
            learning_rate: 0.05,
            log_interval: 2,
            eval_log_interval: 1,
            prefetch: 1,
            ..TrainConfig::default()
        };
        config.model.num_classes = 5;
        config.model.in_channels = 3;
        config.data.image_size = 4;
        config
    }

    fn snapshot<M: Classifier>(model: &DistributedModel<M>) -> Vec<f32> {
        let data = model.varmap().data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|n| data[n].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_two_rank_fit_keeps_replicas_identical() {
        let groups: Vec<ProcessGroup> = LocalGroup::new(2)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();

        let outcomes: Vec<(Vec<EpochResult>, Vec<f32>, Vec<f32>)> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let config = tiny_config(2);
                        let train: Arc<dyn Dataset> =
                            Arc::new(TensorDataset::synthetic(30, 5, 3, 4, 1).unwrap());
                        let val: Arc<dyn Dataset> =
                            Arc::new(TensorDataset::synthetic(10, 5, 3, 4, 2).unwrap());

                        let (module, varmap) = TinyClassifier::build(3 * 4 * 4, 5);
                        let model = DistributedModel::new(module, varmap, g).unwrap();
                        let initial = snapshot(&model);

                        let mut trainer = Trainer::new(config, g, g.rank() == 0, model, train, val).unwrap();
                        let results = trainer.fit().unwrap();
                        (results, initial, snapshot(trainer.model()))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let (results0, initial0, final0) = &outcomes[0];
        let (results1, initial1, final1) = &outcomes[1];

        // Replicas start equal, move, and stay equal
        assert_eq!(initial0, initial1);
        assert_eq!(final0, final1);
        assert_ne!(initial0, final0);

        // Validation metrics are reduced, so every rank sees the same values
        assert_eq!(results0, results1);
        assert_eq!(results0.len(), 2);
        assert_eq!(results0[0].epoch, 0);
        assert_eq!(results0[1].epoch, 1);
        assert_eq!(results0[0].is_new_best, results0[0].validation_top1 > 0.0);
    }

    #[test]
    fn test_zero_epochs_does_nothing() {
        let group = ProcessGroup::from_collective(
            Box::new(crate::distributed::sync::SingleProcess),
            Device::Cpu,
        );
        let train: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(8, 5, 3, 4, 1).unwrap());
        let val: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(8, 5, 3, 4, 2).unwrap());
        let (module, varmap) = TinyClassifier::build(48, 5);
        let model = DistributedModel::new(module, varmap, &group).unwrap();
        let mut trainer = Trainer::new(tiny_config(0), &group, true, model, train, val).unwrap();
        assert!(trainer.fit().unwrap().is_empty());
        assert_eq!(trainer.best_top1(), 0.0);
    }

    #[test]
    fn test_single_process_validation_summary() {
        let group = ProcessGroup::from_collective(
            Box::new(crate::distributed::sync::SingleProcess),
            Device::Cpu,
        );
        let train: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(8, 5, 3, 4, 1).unwrap());
        let val: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(12, 5, 3, 4, 2).unwrap());
        let (module, varmap) = TinyClassifier::build(48, 5);
        let model = DistributedModel::new(module, varmap, &group).unwrap();
        let mut trainer = Trainer::new(tiny_config(1), &group, false, model, train, val).unwrap();

        let summary = trainer.validate(0).unwrap();
        // Meters start over each pass, and validation changes nothing
        assert_eq!(trainer.validate(1).unwrap(), summary);
        assert!((0.0..=100.0).contains(&summary.top1));
        assert!(summary.top5 >= summary.top1);
        assert!(summary.loss.is_finite());
        assert!(!trainer.model().is_training());
    }

    fn named_values<M: Classifier>(model: &DistributedModel<M>) -> BTreeMap<String, Vec<f32>> {
        let data = model.varmap().data().lock().unwrap();
        data.iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    #[test]
    fn test_validation_leaves_weights_and_running_stats_untouched() {
        let group = ProcessGroup::from_collective(
            Box::new(crate::distributed::sync::SingleProcess),
            Device::Cpu,
        );
        let model_config = ModelConfig {
            depth: 18,
            num_classes: 5,
            base_width: 4,
            in_channels: 3,
        };
        let (module, varmap) = build_resnet(&model_config, &Device::Cpu).unwrap();
        let model = DistributedModel::new(module, varmap, &group).unwrap();

        let train: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(8, 5, 3, 8, 1).unwrap());
        let val: Arc<dyn Dataset> = Arc::new(TensorDataset::synthetic(12, 5, 3, 8, 2).unwrap());
        let mut config = tiny_config(1);
        config.model = model_config;
        config.data.image_size = 8;
        let mut trainer = Trainer::new(config, &group, false, model, train, val).unwrap();

        // One training pass moves the batch norm statistics away from their init
        trainer.train_one_epoch(0).unwrap();
        let before = named_values(trainer.model());
        assert!(before.contains_key("stem.bn.running_mean"));
        assert!(before.contains_key("layer1.0.conv1.bn.running_var"));

        trainer.validate(0).unwrap();
        assert!(!trainer.model().is_training());
        assert_eq!(named_values(trainer.model()), before);
    }
}
