use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};
use crate::config::ModelConfig;

/// Image classifier driven by the training loop.
///
/// `forward` maps a batch `[B, C, H, W]` to logits `[B, num_classes]`.
/// Layers that behave differently during training (batch norm) follow the
/// current mode.
pub trait Classifier {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }
}

// --- Convolution + BatchNorm ---

struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let conv = candle_nn::conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?;
        let bn = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.conv.forward(x)?.apply_t(&self.bn, train)
    }
}

// --- Basic residual block (two 3x3 convolutions) ---

struct BasicBlock {
    conv1: ConvBn,
    conv2: ConvBn,
    /// 1x1 projection when the block changes resolution or width.
    downsample: Option<ConvBn>,
}

impl BasicBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = ConvBn::new(in_channels, out_channels, 3, stride, 1, vb.pp("conv1"))?;
        let conv2 = ConvBn::new(out_channels, out_channels, 3, 1, 1, vb.pp("conv2"))?;
        let downsample = if stride != 1 || in_channels != out_channels {
            Some(ConvBn::new(in_channels, out_channels, 1, stride, 0, vb.pp("downsample"))?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            downsample,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.conv1.forward_t(x, train)?.relu()?;
        let out = self.conv2.forward_t(&out, train)?;
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };
        (out + identity)?.relu()
    }
}

// --- ResNet ---

pub struct ResNet {
    stem: ConvBn,
    stages: Vec<Vec<BasicBlock>>,
    fc: Linear,
    training: bool,
}

impl ResNet {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = stage_depths(cfg.depth)?;
        let width = cfg.base_width;

        // 7x7 stride 2 stem, followed by a 3x3 stride 2 max pool in forward
        let stem = ConvBn::new(cfg.in_channels, width, 7, 2, 3, vb.pp("stem"))?;

        let mut stages = Vec::with_capacity(blocks.len());
        let mut in_channels = width;
        for (i, &n) in blocks.iter().enumerate() {
            let out_channels = width << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", i + 1));
            let mut stage = Vec::with_capacity(n);
            for b in 0..n {
                let s = if b == 0 { stride } else { 1 };
                stage.push(BasicBlock::new(in_channels, out_channels, s, stage_vb.pp(b.to_string()))?);
                in_channels = out_channels;
            }
            stages.push(stage);
        }

        let fc = candle_nn::linear(in_channels, cfg.num_classes, vb.pp("fc"))?;

        Ok(Self {
            stem,
            stages,
            fc,
            training: true,
        })
    }
}

impl Classifier for ResNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let train = self.is_training();
        let x = self.stem.forward_t(xs, train)?.relu()?;
        // Activations are non-negative after ReLU, so zero padding is
        // equivalent to -inf padding for the max pool.
        let mut x = x
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        for stage in &self.stages {
            for block in stage {
                x = block.forward_t(&x, train)?;
            }
        }

        // Global average pool: [B, C, H, W] -> [B, C]
        let x = x.mean((2, 3))?;
        self.fc.forward(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Number of basic blocks per stage for the supported depths.
fn stage_depths(depth: usize) -> Result<[usize; 4]> {
    match depth {
        18 => Ok([2, 2, 2, 2]),
        34 => Ok([3, 4, 6, 3]),
        other => Err(candle_core::Error::Msg(format!(
            "Unsupported ResNet depth {} (expected 18 or 34)",
            other
        ))),
    }
}

/// Build a freshly initialized ResNet and the VarMap that owns its parameters.
pub fn build_resnet(cfg: &ModelConfig, device: &Device) -> Result<(ResNet, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = ResNet::new(cfg, vb)?;
    Ok((model, varmap))
}
