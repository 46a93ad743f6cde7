//! Distributed SGD Optimizer
//!
//! SGD with momentum and weight decay that works with explicitly provided
//! gradients, so it can consume the averaged gradients produced by
//! [`DistributedModel::backward`](super::ddp::DistributedModel::backward).
//!
//! Candle's built-in optimizers take a `GradStore`, which cannot be replaced
//! by the synchronized gradients.

use candle_core::{Result, Tensor, Var};
use std::collections::{HashMap, HashSet};

use super::ddp::SyncedGradient;

/// SGD optimizer configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor
    pub momentum: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
        }
    }
}

/// A set of parameters sharing one learning rate and regularization setting.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Parameter names; an empty set matches every parameter.
    pub params: HashSet<String>,
}

impl ParamGroup {
    fn matches(&self, name: &str) -> bool {
        self.params.is_empty() || self.params.contains(name)
    }
}

/// Distributed SGD optimizer
///
/// For each parameter θ with gradient g:
/// ```text
/// d = g + λ * θ                       # Weight decay
/// b = d                (first step)
/// b = μ * b + d        (afterwards)   # Momentum buffer
/// θ = θ - lr * b
/// ```
pub struct DistributedSgd {
    groups: Vec<ParamGroup>,
    /// Momentum buffers, created on a parameter's first update
    momentum: HashMap<String, Tensor>,
}

impl DistributedSgd {
    /// Create an optimizer with a single group covering every parameter.
    pub fn new(config: SgdConfig) -> Self {
        Self::with_groups(vec![ParamGroup {
            lr: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            params: HashSet::new(),
        }])
    }

    /// Create an optimizer from explicit groups. A parameter belongs to the
    /// first group that lists it.
    pub fn with_groups(groups: Vec<ParamGroup>) -> Self {
        Self {
            groups,
            momentum: HashMap::new(),
        }
    }

    /// Perform an optimizer step with synchronized gradients
    pub fn step(&mut self, synced_grads: &[SyncedGradient]) -> Result<()> {
        for (name, var, grad) in synced_grads {
            let Some(group) = self.groups.iter().find(|g| g.matches(name)) else {
                continue;
            };
            let (lr, momentum, weight_decay) = (group.lr, group.momentum, group.weight_decay);

            let grad = if grad.device().same_device(var.device()) {
                grad.clone()
            } else {
                grad.to_device(var.device())?
            };

            let param = var.as_tensor();

            // d = g + λθ
            let d = if weight_decay != 0.0 {
                (&grad + (param * weight_decay)?)?
            } else {
                grad
            };

            let update = if momentum != 0.0 {
                let buf = match self.momentum.remove(name) {
                    Some(prev) => ((prev * momentum)? + &d)?,
                    None => d,
                };
                self.momentum.insert(name.clone(), buf.clone());
                buf
            } else {
                d
            };

            apply_update(var, &update, lr)?;
        }

        Ok(())
    }

    /// Learning rate of the first group
    pub fn learning_rate(&self) -> f64 {
        self.groups.first().map(|g| g.lr).unwrap_or(0.0)
    }

    /// Set the learning rate of every group (for learning rate scheduling)
    pub fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }
}

fn apply_update(var: &Var, update: &Tensor, lr: f64) -> Result<()> {
    let new_param = var.as_tensor().sub(&(update * lr)?)?;
    var.set(&new_param)
}
