//! Data-parallel model wrapper
//!
//! Every rank holds a full replica. Replicas start identical (rank 0's
//! parameters are broadcast at construction) and stay identical because each
//! rank applies the same averaged gradient with the same optimizer.
//!
//! All collectives issued here depend only on the model structure, which is
//! the same on every rank, so the call sequence never diverges.

use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;

use super::process_group::ProcessGroup;
use crate::error::{DdpError, Result};
use crate::model::Classifier;

/// Synchronized gradient: (parameter name, variable, averaged gradient)
pub type SyncedGradient = (String, Var, Tensor);

const BUFFER_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

pub struct DistributedModel<M: Classifier> {
    module: M,
    varmap: VarMap,
    /// Trainable variables in name order.
    params: Vec<(String, Var)>,
    /// Batch norm running statistics; rank 0's copy is authoritative.
    buffers: Vec<(String, Var)>,
}

impl<M: Classifier> DistributedModel<M> {
    /// Wrap `module` and make its parameters identical on every rank.
    pub fn new(module: M, varmap: VarMap, group: &ProcessGroup) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| DdpError::config("model variables are poisoned"))?;
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect()
        };
        // HashMap order differs between processes; the packed layout must not.
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let (buffers, params): (Vec<_>, Vec<_>) = vars
            .into_iter()
            .partition(|(name, _)| BUFFER_SUFFIXES.iter().any(|s| name.ends_with(s)));

        let model = Self {
            module,
            varmap,
            params,
            buffers,
        };

        model.broadcast(&model.params, group)?;
        model.broadcast(&model.buffers, group)?;
        log::info!(
            "Model replicated from rank 0: {} parameter tensors ({} values), {} buffers",
            model.params.len(),
            model.num_parameters(),
            model.buffers.len()
        );
        Ok(model)
    }

    /// Forward pass. Running statistics are first refreshed from rank 0 so
    /// every replica normalizes with the same buffers.
    pub fn forward(&self, xs: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
        if group.world_size() > 1 && !self.buffers.is_empty() {
            self.broadcast(&self.buffers, group)?;
        }
        Ok(self.module.forward(xs)?)
    }

    /// Run autograd for `loss` and average the gradients across ranks with a
    /// single all-reduce.
    ///
    /// Parameters that received no gradient on this rank contribute zeros and
    /// are left out of the result.
    pub fn backward(&self, loss: &Tensor, group: &ProcessGroup) -> Result<Vec<SyncedGradient>> {
        let grads = loss.backward()?;

        let mut packed: Vec<f32> = Vec::with_capacity(self.num_parameters());
        let mut present = Vec::with_capacity(self.params.len());
        for (_, var) in &self.params {
            match grads.get(var.as_tensor()) {
                Some(g) => {
                    packed.extend(g.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
                    present.push(true);
                }
                None => {
                    packed.resize(packed.len() + var.elem_count(), 0.0);
                    present.push(false);
                }
            }
        }

        group.all_reduce_sum_slice(&mut packed)?;

        let scale = 1.0 / group.world_size() as f32;
        let mut synced = Vec::with_capacity(self.params.len());
        let mut offset = 0;
        for ((name, var), has_grad) in self.params.iter().zip(present) {
            let n = var.elem_count();
            if has_grad {
                let avg: Vec<f32> = packed[offset..offset + n].iter().map(|g| g * scale).collect();
                let grad = Tensor::from_vec(avg, var.shape(), var.device())?.to_dtype(var.dtype())?;
                synced.push((name.clone(), var.clone(), grad));
            }
            offset += n;
        }
        Ok(synced)
    }

    /// Overwrite `vars` on every rank with rank 0's values.
    fn broadcast(&self, vars: &[(String, Var)], group: &ProcessGroup) -> Result<()> {
        if group.world_size() <= 1 || vars.is_empty() {
            return Ok(());
        }
        let total: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
        let mut packed: Vec<f32> = Vec::with_capacity(total);
        if group.rank() == 0 {
            for (_, var) in vars {
                packed.extend(var.as_tensor().flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
            }
        } else {
            packed.resize(total, 0.0);
        }

        group.all_reduce_sum_slice(&mut packed)?;

        let mut offset = 0;
        for (_, var) in vars {
            let n = var.elem_count();
            let value = Tensor::from_slice(&packed[offset..offset + n], var.shape(), var.device())?
                .to_dtype(var.dtype())?;
            var.set(&value)?;
            offset += n;
        }
        Ok(())
    }

    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    pub fn train(&mut self) {
        self.module.train();
    }

    pub fn eval(&mut self) {
        self.module.eval();
    }

    #[cfg(test)]
    pub fn is_training(&self) -> bool {
        self.module.is_training()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}
