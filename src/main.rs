mod config;
mod data;
mod distributed;
mod error;
mod metrics;
mod model;
mod topology;
mod trainer;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;

use config::{TargetDevice, TrainConfig};
use distributed::{DistributedModel, ProcessGroup, SyncBackend};
use topology::Topology;
use trainer::Trainer;

/// Synchronous data-parallel ResNet training, launched once per GPU by SLURM
#[derive(Parser, Debug)]
#[command(name = "resnet-ddp")]
#[command(about = "Data-parallel ResNet training under SLURM", long_about = None)]
struct Args {
    /// Path to a configuration YAML file (defaults are used when omitted)
    #[arg(short = 'f', long = "config")]
    config_file: Option<String>,

    /// Directory with train.safetensors and val.safetensors (synthetic data when omitted)
    #[arg(long = "data_dir")]
    data_dir: Option<String>,

    /// Directory for checkpoints and the metrics log
    #[arg(long = "save_dir")]
    save_dir: Option<String>,

    /// Per-process batch size
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    #[arg(long = "epochs")]
    epochs: Option<usize>,

    /// Base learning rate, decayed 10x every 75 epochs
    #[arg(long = "lr")]
    learning_rate: Option<f64>,

    /// Train batches between progress reports
    #[arg(long = "log-interval")]
    log_interval: Option<usize>,

    /// ResNet depth: 18 or 34
    #[arg(long = "depth")]
    depth: Option<usize>,

    /// Save the best model (by validation Prec@1) under save_dir
    #[arg(long = "save-model")]
    save_model: bool,

    /// Collective backend: "auto", "single", "tcp", or "nccl"
    #[arg(long = "backend")]
    backend: Option<String>,

    /// Override target device: "gpu" or "cpu"
    #[arg(long = "target-device")]
    target_device: Option<String>,

    /// Batches prefetched by a background thread (0 = load inline)
    #[arg(long = "prefetch")]
    prefetch: Option<usize>,
}

fn init_logging(rank: Option<usize>) {
    let prefix = rank.map_or_else(|| "?".to_string(), |r| r.to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| writeln!(buf, "{} - [{}] {}", prefix, record.level(), record.args()))
        .init();
}

fn load_config(args: &Args) -> Result<TrainConfig> {
    let mut config = match &args.config_file {
        Some(path) => TrainConfig::from_yaml(path)?,
        None => TrainConfig::default(),
    };

    // CLI overrides
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &args.save_dir {
        config.save_dir = dir.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    if let Some(interval) = args.log_interval {
        config.log_interval = interval;
    }
    if let Some(depth) = args.depth {
        config.model.depth = depth;
    }
    if args.save_model {
        config.save_model = true;
    }
    if let Some(backend) = &args.backend {
        config.distributed.backend = backend.parse::<SyncBackend>().map_err(anyhow::Error::msg)?;
    }
    if let Some(device) = &args.target_device {
        config.target_device = device.parse::<TargetDevice>().map_err(anyhow::Error::msg)?;
    }
    if let Some(prefetch) = args.prefetch {
        config.prefetch = prefetch;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Rank is needed for the log prefix, so resolve it before anything logs
    let topology = Topology::from_env();
    init_logging(topology.as_ref().ok().map(|t| t.global_rank));
    let topology = topology.context("failed to resolve job topology from SLURM environment")?;
    topology.log_summary();

    let config = load_config(&args).context("invalid configuration")?;
    log::debug!("Configuration: {:?}", config);

    let group = ProcessGroup::init(&topology, &config.distributed, &config.target_device)
        .context("process group bootstrap failed")?;

    let (module, varmap) = model::build_resnet(&config.model, group.device())?;
    let model = DistributedModel::new(module, varmap, &group)?;

    let (train_set, val_set) = data::load_datasets(&config).context("failed to load datasets")?;
    log::info!("Datasets: {} train / {} val samples", train_set.len(), val_set.len());

    let mut trainer = Trainer::new(config, &group, topology.is_master, model, train_set, val_set)?;
    let results = trainer.fit()?;

    if topology.is_master {
        let best_epoch = results.iter().filter(|r| r.is_new_best).map(|r| r.epoch).last();
        match best_epoch {
            Some(epoch) => log::info!("Best Prec@1 {:.3} at epoch {}", trainer.best_top1(), epoch),
            None => log::info!("Training finished without a validation improvement"),
        }
    }

    drop(trainer);
    group.shutdown()?;
    Ok(())
}
