use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DdpError, Result};

// Default value functions for serde
fn default_batch_size() -> usize { 32 }
fn default_epochs() -> usize { 300 }
fn default_learning_rate() -> f64 { 0.1 }
fn default_momentum() -> f64 { 0.9 }
fn default_weight_decay() -> f64 { 1e-4 }
fn default_log_interval() -> usize { 10 }
fn default_eval_log_interval() -> usize { 100 }
fn default_lr_decay_epochs() -> usize { 75 }
fn default_lr_decay_factor() -> f64 { 0.1 }
fn default_prefetch() -> usize { 2 }

// Re-export distributed config types
pub use crate::distributed::sync::DistributedConfig;

/// Target device for training
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TargetDevice {
    #[default]
    Gpu,
    Cpu,
}

impl std::str::FromStr for TargetDevice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpu" | "cuda" => Ok(TargetDevice::Gpu),
            "cpu" => Ok(TargetDevice::Cpu),
            _ => Err(format!("Unknown target device: {}. Valid options: gpu, cpu", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// ResNet depth: 18 or 34
    pub depth: usize,
    pub num_classes: usize,
    /// Channels of the first stage; doubled at every later stage
    pub base_width: usize,
    pub in_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            depth: 18,
            num_classes: 1000,
            base_width: 64,
            in_channels: 3,
        }
    }
}

/// Dataset settings. With an empty `data_dir` a synthetic dataset of the
/// given sizes is generated from `seed`, identically on every rank.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Base seed for sampler shuffling and synthetic data
    pub seed: u64,
    pub synthetic_train_size: usize,
    pub synthetic_val_size: usize,
    pub image_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            synthetic_train_size: 1024,
            synthetic_val_size: 256,
            image_size: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainConfig {
    /// Directory holding `train.safetensors` and `val.safetensors`
    #[serde(default)]
    pub data_dir: String,
    /// Output directory for checkpoints and the metrics log
    #[serde(default)]
    pub save_dir: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Train batches between reduced progress reports
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Validation batches between printed progress lines
    #[serde(default = "default_eval_log_interval")]
    pub eval_log_interval: usize,

    /// Step decay: lr = base_lr * factor^(epoch / every)
    #[serde(default = "default_lr_decay_epochs")]
    pub lr_decay_epochs: usize,
    #[serde(default = "default_lr_decay_factor")]
    pub lr_decay_factor: f64,

    #[serde(default)]
    pub save_model: bool,

    /// Batches assembled ahead by the loader thread (0 = no prefetch)
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Target device: "gpu" (default) or "cpu"
    #[serde(default)]
    pub target_device: TargetDevice,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub data: DataConfig,

    /// Distributed training configuration
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            save_dir: String::new(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            log_interval: default_log_interval(),
            eval_log_interval: default_eval_log_interval(),
            lr_decay_epochs: default_lr_decay_epochs(),
            lr_decay_factor: default_lr_decay_factor(),
            save_model: false,
            prefetch: default_prefetch(),
            target_device: TargetDevice::default(),
            model: ModelConfig::default(),
            data: DataConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    ///
    /// Validation is left to the caller, since command-line overrides are
    /// usually applied on top first.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DdpError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| DdpError::config(format!("invalid config: {}", e)))
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DdpError::config("batch_size must be > 0"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DdpError::config(format!(
                "learning rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if self.log_interval == 0 {
            return Err(DdpError::config("log_interval must be > 0"));
        }
        if self.eval_log_interval == 0 {
            return Err(DdpError::config("eval_log_interval must be > 0"));
        }
        if self.lr_decay_epochs == 0 {
            return Err(DdpError::config("lr_decay_epochs must be > 0"));
        }
        if !(self.lr_decay_factor > 0.0 && self.lr_decay_factor <= 1.0) {
            return Err(DdpError::config(format!(
                "lr_decay_factor must be in (0, 1], got {}",
                self.lr_decay_factor
            )));
        }
        if !(self.momentum >= 0.0) {
            return Err(DdpError::config("momentum must be >= 0"));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(DdpError::config("weight_decay must be >= 0"));
        }
        if self.model.num_classes < 5 {
            // top-5 accuracy is always reported
            return Err(DdpError::config(format!(
                "num_classes must be >= 5, got {}",
                self.model.num_classes
            )));
        }
        if self.data_dir.is_empty() && self.data.image_size == 0 {
            return Err(DdpError::config("synthetic image_size must be > 0"));
        }
        Ok(())
    }

    /// Path under `save_dir`, or `None` when no save directory is set.
    pub fn output_path(&self, file: &str) -> Option<PathBuf> {
        if self.save_dir.is_empty() {
            None
        } else {
            Some(Path::new(&self.save_dir).join(file))
        }
    }
}

/// Sidecar written next to a best-model checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub validation_top1: f64,
    pub world_size: usize,
    pub timestamp: String,
    pub checkpoint_file: String,
    pub model: ModelConfig,
}

impl CheckpointMeta {
    pub fn new(
        epoch: usize,
        validation_top1: f64,
        world_size: usize,
        checkpoint_file: &Path,
        model: &ModelConfig,
    ) -> Self {
        Self {
            epoch,
            validation_top1,
            world_size,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            checkpoint_file: checkpoint_file.display().to_string(),
            model: model.clone(),
        }
    }

    /// Save metadata to JSON file alongside checkpoint
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DdpError::config(format!("cannot encode checkpoint metadata: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}
