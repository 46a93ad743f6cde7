//! Streaming statistics and cross-rank metric reduction
//!
//! Metrics are computed locally per rank, then averaged across ranks with a
//! sum all-reduce divided by the world size. Accuracy therefore becomes an
//! average of per-rank accuracies, not an exact accuracy over the union of
//! samples; ranks with a short final batch weigh as much as full ones.

use candle_core::{DType, Device, Tensor};
use serde::Serialize;

use crate::distributed::ProcessGroup;
use crate::error::{DdpError, Result};

/// Current value plus weighted running mean of a stream of observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunningStatistic {
    pub value: f64,
    pub sum: f64,
    pub count: usize,
    pub mean: f64,
}

impl RunningStatistic {
    /// Zero every field, as if freshly constructed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `value` observed `weight` times. Precondition: `weight > 0`.
    pub fn update(&mut self, value: f64, weight: usize) {
        self.value = value;
        self.sum += value * weight as f64;
        self.count += weight;
        self.mean = self.sum / self.count as f64;
    }
}

/// Top-k accuracy in percent for each requested `k`.
///
/// `output` holds scores `[B, C]`, `target` the true class of each example.
/// An example is correct at `k` when its label is among the `k` highest
/// scores; equal scores rank by class index. Labels outside `[0, C)` are
/// never correct.
pub fn accuracy(output: &Tensor, target: &Tensor, topk: &[usize]) -> Result<Vec<f64>> {
    let (batch_size, num_classes) = output.dims2()?;
    for &k in topk {
        if k == 0 || k > num_classes {
            return Err(DdpError::config(format!(
                "top-{} accuracy requested for {} classes",
                k, num_classes
            )));
        }
    }
    if batch_size == 0 {
        return Ok(vec![0.0; topk.len()]);
    }

    let scores = output.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let labels = target.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    if labels.len() != batch_size {
        return Err(DdpError::config(format!(
            "{} labels for a batch of {} outputs",
            labels.len(),
            batch_size
        )));
    }

    // Position of the true label in each example's descending ranking.
    let ranks: Vec<Option<usize>> = scores
        .iter()
        .zip(&labels)
        .map(|(row, &label)| {
            let label = usize::try_from(label).ok().filter(|&l| l < num_classes)?;
            let s = row[label];
            Some(
                row.iter()
                    .enumerate()
                    .filter(|&(j, &v)| v > s || (v == s && j < label))
                    .count(),
            )
        })
        .collect();

    Ok(topk
        .iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|r| matches!(r, Some(r) if *r < k)).count();
            100.0 * correct as f64 / batch_size as f64
        })
        .collect())
}

/// Cross-rank mean of a metric tensor. Blocking; every rank must call it at
/// the same point.
///
/// Rank 0's value is shared first (a sum against zeros, which is exact), then
/// the deviations from it are summed and divided by the world size. Ranks
/// that all hold the same value get it back bit for bit, which a plain
/// `sum / world_size` does not guarantee in floating point.
pub fn reduce_tensor(tensor: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
    let reference = if group.rank() == 0 {
        tensor.clone()
    } else {
        tensor.zeros_like()?
    };
    let reference = group.all_reduce_sum(&reference)?;
    let deviation = group.all_reduce_sum(&(tensor - &reference)?)?;
    Ok((reference + (deviation / group.world_size() as f64)?)?)
}

/// The three values reported for a logged batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoggedMetrics {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
}

impl LoggedMetrics {
    /// Average across ranks, all three values packed into one tensor.
    pub fn reduce(self, group: &ProcessGroup) -> Result<Self> {
        let local = Tensor::new(&[self.loss, self.top1, self.top5], &Device::Cpu)?;
        let reduced = reduce_tensor(&local, group)?.to_vec1::<f64>()?;
        Ok(Self {
            loss: reduced[0],
            top1: reduced[1],
            top5: reduced[2],
        })
    }
}

/// Loop position shared by every rank: the batch counter advances
/// identically on all ranks regardless of the data each one sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedStep {
    pub batch: usize,
}

/// Decides which batches get reduced and logged.
///
/// Only the shared loop position enters the decision, never a locally
/// computed value, so all ranks agree on when to enter the collective.
#[derive(Debug, Clone, Copy)]
pub struct LogCadence {
    interval: usize,
}

impl LogCadence {
    pub fn new(interval: usize) -> Result<Self> {
        if interval == 0 {
            return Err(DdpError::config("log interval must be > 0"));
        }
        Ok(Self { interval })
    }

    /// Reduce on every batch.
    pub fn every_batch() -> Self {
        Self { interval: 1 }
    }

    pub fn is_due(&self, step: SharedStep) -> bool {
        step.batch % self.interval == 0
    }
}

/// Accumulators for one train or eval pass.
#[derive(Debug, Clone, Default)]
pub struct PassMeters {
    pub batch_time: RunningStatistic,
    pub losses: RunningStatistic,
    pub top1: RunningStatistic,
    pub top5: RunningStatistic,
}

impl PassMeters {
    /// Start a new pass.
    pub fn reset(&mut self) {
        self.batch_time.reset();
        self.losses.reset();
        self.top1.reset();
        self.top5.reset();
    }

    pub fn record(&mut self, reduced: LoggedMetrics, batch_size: usize, batch_time: f64) {
        self.losses.update(reduced.loss, batch_size);
        self.top1.update(reduced.top1, batch_size);
        self.top5.update(reduced.top5, batch_size);
        self.batch_time.update(batch_time, 1);
    }

    /// Progress line: `header` is e.g. `Epoch: [3][40/500]` or `Test: [40/50]`.
    /// Speed is examples per second over the whole job.
    pub fn progress_line(&self, header: &str, world_size: usize, batch_size: usize) -> String {
        let examples = (world_size * batch_size) as f64;
        let speed = |t: f64| if t > 0.0 { examples / t } else { 0.0 };
        format!(
            "{}\tTime {:.3} ({:.3})\tSpeed {:.3} ({:.3})\tLoss {:.10} ({:.4})\tPrec@1 {:.3} ({:.3})\tPrec@5 {:.3} ({:.3})",
            header,
            self.batch_time.value,
            self.batch_time.mean,
            speed(self.batch_time.value),
            speed(self.batch_time.mean),
            self.losses.value,
            self.losses.mean,
            self.top1.value,
            self.top1.mean,
            self.top5.value,
            self.top5.mean,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::local::LocalGroup;
    use crate::distributed::sync::SingleProcess;

    #[test]
    fn test_weighted_mean_law() {
        let mut stat = RunningStatistic::default();
        let observations = [(2.0, 4), (5.0, 1), (1.0, 3)];
        for (v, n) in observations {
            stat.update(v, n);
        }
        let expected = (2.0 * 4.0 + 5.0 + 3.0) / 8.0;
        assert!((stat.mean - expected).abs() < 1e-12);
        assert_eq!(stat.value, 1.0);
        assert_eq!(stat.count, 8);

        // Long-running accumulation stays exact
        for _ in 0..10_000 {
            stat.update(1.0, 1);
        }
        let expected = (16.0 + 10_000.0) / 10_008.0;
        assert!((stat.mean - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reset_then_update_is_single_observation() {
        let mut stat = RunningStatistic::default();
        stat.update(9.0, 3);
        stat.reset();
        assert_eq!(stat, RunningStatistic::default());
        stat.update(4.0, 2);

        let mut fresh = RunningStatistic::default();
        fresh.update(4.0, 2);
        assert_eq!(stat, fresh);
        assert_eq!(stat.mean, 4.0);
    }

    #[test]
    fn test_pass_meters_reset_clears_every_statistic() {
        let mut meters = PassMeters::default();
        meters.record(
            LoggedMetrics {
                loss: 1.0,
                top1: 50.0,
                top5: 90.0,
            },
            4,
            0.2,
        );
        meters.reset();
        assert_eq!(meters.losses, RunningStatistic::default());
        assert_eq!(meters.top1, RunningStatistic::default());
        assert_eq!(meters.top5, RunningStatistic::default());
        assert_eq!(meters.batch_time, RunningStatistic::default());
    }

    fn scores(rows: &[[f32; 6]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 6), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_accuracy_all_correct() {
        let output = scores(&[[9., 1., 1., 1., 1., 1.], [1., 1., 9., 1., 1., 1.]]);
        let target = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        assert_eq!(accuracy(&output, &target, &[1, 5]).unwrap(), vec![100.0, 100.0]);
    }

    #[test]
    fn test_accuracy_label_never_ranked() {
        // Label is the lowest score with six classes, so outside the top 5
        let output = scores(&[[1., 2., 3., 4., 5., 0.], [0., 6., 5., 4., 3., 2.]]);
        let target = Tensor::new(&[5u32, 0], &Device::Cpu).unwrap();
        assert_eq!(accuracy(&output, &target, &[1, 5]).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_accuracy_half_top1_all_top5() {
        let output = scores(&[
            [9., 1., 1., 1., 1., 0.],
            [1., 9., 1., 1., 1., 0.],
            [9., 8., 1., 1., 1., 0.],
            [1., 2., 9., 1., 1., 0.],
        ]);
        let target = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu).unwrap();
        assert_eq!(accuracy(&output, &target, &[1, 5]).unwrap(), vec![50.0, 100.0]);
    }

    #[test]
    fn test_accuracy_top5_at_least_top1() {
        let output = Tensor::randn(0f32, 1f32, (64, 10), &Device::Cpu).unwrap();
        let labels: Vec<u32> = (0..64).map(|i| i % 10).collect();
        let target = Tensor::new(labels.as_slice(), &Device::Cpu).unwrap();
        let acc = accuracy(&output, &target, &[1, 5]).unwrap();
        assert!(acc[1] >= acc[0]);
    }

    #[test]
    fn test_accuracy_rejects_k_above_classes() {
        let output = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        assert!(accuracy(&output, &target, &[1, 5]).is_err());
    }

    #[test]
    fn test_reduction_of_identical_values_is_identity() {
        let single = ProcessGroup::from_collective(Box::new(SingleProcess), Device::Cpu);
        let m = LoggedMetrics {
            loss: 0.75,
            top1: 12.5,
            top5: 50.0,
        };
        assert_eq!(m.reduce(&single).unwrap(), m);

        let groups: Vec<ProcessGroup> = LocalGroup::new(3)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();
        std::thread::scope(|s| {
            for g in &groups {
                s.spawn(move || {
                    let t = Tensor::new(&[0.5f64, 2.0], &Device::Cpu).unwrap();
                    let r = reduce_tensor(&t, g).unwrap().to_vec1::<f64>().unwrap();
                    assert_eq!(r, vec![0.5, 2.0]);
                });
            }
        });
    }

    #[test]
    fn test_reduction_keeps_values_f32_cannot_hold() {
        let m = LoggedMetrics {
            loss: 2.302585092994046,
            top1: 100.0 / 3.0,
            top5: 0.1,
        };
        let single = ProcessGroup::from_collective(Box::new(SingleProcess), Device::Cpu);
        assert_eq!(m.reduce(&single).unwrap(), m);

        let groups: Vec<ProcessGroup> = LocalGroup::new(3)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();
        let reduced: Vec<LoggedMetrics> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| s.spawn(move || m.reduce(g).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(reduced, vec![m; 3]);
    }

    #[test]
    fn test_uneven_values_reduce_to_the_same_mean_everywhere() {
        let groups: Vec<ProcessGroup> = LocalGroup::new(3)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();
        let reduced: Vec<f64> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let t = Tensor::new(&[0.1f64 * (g.rank() + 1) as f64], &Device::Cpu).unwrap();
                        reduce_tensor(&t, g).unwrap().to_vec1::<f64>().unwrap()[0]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!((reduced[0] - 0.2).abs() < 1e-12);
        assert!(reduced.iter().all(|&r| r == reduced[0]));
    }

    #[test]
    fn test_two_ranks_average_loss() {
        let groups: Vec<ProcessGroup> = LocalGroup::new(2)
            .into_iter()
            .map(|c| ProcessGroup::from_collective(Box::new(c), Device::Cpu))
            .collect();
        let recorded: Vec<f64> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|g| {
                    s.spawn(move || {
                        let local = LoggedMetrics {
                            loss: if g.rank() == 0 { 1.0 } else { 3.0 },
                            top1: 0.0,
                            top5: 0.0,
                        };
                        let mut meters = PassMeters::default();
                        meters.record(local.reduce(g).unwrap(), 8, 0.1);
                        meters.losses.mean
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(recorded, vec![2.0, 2.0]);
    }

    #[test]
    fn test_log_cadence() {
        assert!(LogCadence::new(0).is_err());
        let cadence = LogCadence::new(10).unwrap();
        let due: Vec<usize> = (0..35)
            .filter(|&batch| cadence.is_due(SharedStep { batch }))
            .collect();
        assert_eq!(due, vec![0, 10, 20, 30]);
        assert!(LogCadence::every_batch().is_due(SharedStep { batch: 7 }));
    }

    #[test]
    fn test_progress_line_format() {
        let mut meters = PassMeters::default();
        meters.record(
            LoggedMetrics {
                loss: 0.5,
                top1: 25.0,
                top5: 75.0,
            },
            4,
            0.5,
        );
        let line = meters.progress_line("Epoch: [0][0/10]", 2, 4);
        assert_eq!(
            line,
            "Epoch: [0][0/10]\tTime 0.500 (0.500)\tSpeed 16.000 (16.000)\tLoss 0.5000000000 (0.5000)\tPrec@1 25.000 (25.000)\tPrec@5 75.000 (75.000)"
        );
    }
}
