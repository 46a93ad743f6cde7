//! In-process collective group
//!
//! Simulates `world_size` ranks as threads of one process. Each rank owns a
//! [`LocalCollective`] handle; all handles share one reduction slot guarded
//! by a mutex and condition variable. Used to exercise multi-rank training
//! without GPUs or sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::sync::Collective;
use crate::error::{DdpError, Result};

struct Round {
    /// Completed rounds so far; waiters watch this to see their round finish.
    generation: u64,
    arrived: usize,
    /// Sequence number and rank of the first arrival of the open round.
    opened_by: Option<(u64, usize)>,
    /// Contributions are accumulated at double precision for both entry points.
    acc: Vec<f64>,
    result: Vec<f64>,
}

struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    done: Condvar,
}

/// One rank's handle into an in-process group.
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Shared>,
    seq: AtomicU64,
}

pub struct LocalGroup;

impl LocalGroup {
    /// Create `world_size` connected handles, one per simulated rank.
    pub fn new(world_size: usize) -> Vec<LocalCollective> {
        Self::with_timeout(world_size, Duration::from_secs(60))
    }

    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<LocalCollective> {
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                opened_by: None,
                acc: Vec::new(),
                result: Vec::new(),
            }),
            done: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                shared: Arc::clone(&shared),
                seq: AtomicU64::new(0),
            })
            .collect()
    }
}

impl LocalCollective {
    fn reduce(&self, buf: &mut [f64]) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if self.shared.world_size <= 1 {
            return Ok(());
        }

        let mut round = self
            .shared
            .round
            .lock()
            .map_err(|_| DdpError::transport(self.rank, "local group state poisoned"))?;

        match round.opened_by {
            None => {
                round.opened_by = Some((seq, self.rank));
                round.acc = buf.to_vec();
            }
            Some((open_seq, opener)) => {
                if open_seq != seq {
                    return Err(DdpError::CollectiveDesync {
                        rank: self.rank,
                        peer: opener,
                        expected: seq,
                        found: open_seq,
                    });
                }
                if round.acc.len() != buf.len() {
                    return Err(DdpError::transport(
                        self.rank,
                        format!(
                            "buffer length {} does not match peer length {}",
                            buf.len(),
                            round.acc.len()
                        ),
                    ));
                }
                for (a, v) in round.acc.iter_mut().zip(buf.iter()) {
                    *a += *v;
                }
            }
        }
        round.arrived += 1;

        let my_generation = round.generation;
        if round.arrived == self.shared.world_size {
            round.result = std::mem::take(&mut round.acc);
            round.arrived = 0;
            round.opened_by = None;
            round.generation += 1;
            self.shared.done.notify_all();
        } else {
            let (guard, wait) = self
                .shared
                .done
                .wait_timeout_while(round, self.shared.timeout, |r| r.generation == my_generation)
                .map_err(|_| DdpError::transport(self.rank, "local group state poisoned"))?;
            round = guard;
            if wait.timed_out() {
                return Err(DdpError::CollectiveTimeout {
                    rank: self.rank,
                    seq,
                    waited_secs: self.shared.timeout.as_secs(),
                });
            }
        }

        // The result stays put until the next round completes, which needs
        // this rank to arrive again.
        buf.copy_from_slice(&round.result);
        Ok(())
    }
}

impl Collective for LocalCollective {
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let mut wide: Vec<f64> = buf.iter().map(|&v| f64::from(v)).collect();
        self.reduce(&mut wide)?;
        for (b, w) in buf.iter_mut().zip(wide) {
            *b = w as f32;
        }
        Ok(())
    }

    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()> {
        self.reduce(buf)
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_reduce_sums_across_ranks() {
        let group = LocalGroup::new(3);
        let results: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut buf = vec![c.rank() as f32, 1.0];
                        c.all_reduce_sum(&mut buf).unwrap();
                        buf
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![3.0, 3.0]);
        }
    }

    #[test]
    fn test_f64_sum_keeps_double_precision() {
        let group = LocalGroup::new(3);
        let results: Vec<Vec<f64>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut buf = vec![0.1f64, 100.0 / 3.0];
                        c.all_reduce_sum_f64(&mut buf).unwrap();
                        buf
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let third = 100.0f64 / 3.0;
        let expected = vec![0.1 + 0.1 + 0.1, third + third + third];
        for r in results {
            assert_eq!(r, expected);
        }
    }

    #[test]
    fn test_repeated_rounds_stay_in_lockstep() {
        let group = LocalGroup::new(2);
        std::thread::scope(|s| {
            for c in &group {
                s.spawn(move || {
                    for i in 0..50 {
                        let mut buf = vec![i as f32];
                        c.all_reduce_sum(&mut buf).unwrap();
                        assert_eq!(buf[0], 2.0 * i as f32);
                    }
                });
            }
        });
    }

    #[test]
    fn test_skipped_call_is_desync_not_hang() {
        let group = LocalGroup::with_timeout(2, Duration::from_millis(500));
        let (first, second) = (&group[0], &group[1]);
        let outcome = std::thread::scope(|s| {
            let a = s.spawn(move || {
                let mut buf = [1.0f32];
                // rank 0 enters call #0 and waits
                first.all_reduce_sum(&mut buf)
            });
            let b = s.spawn(move || {
                // rank 1 skipped call #0 and enters #1
                second.seq.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                let mut buf = [1.0f32];
                second.all_reduce_sum(&mut buf)
            });
            (a.join().unwrap(), b.join().unwrap())
        });
        // Whichever rank arrives second sees the mismatch; the other times out.
        let outcomes = [outcome.0, outcome.1];
        let desyncs = outcomes
            .iter()
            .filter(|r| matches!(r, Err(DdpError::CollectiveDesync { .. })))
            .count();
        let timeouts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(DdpError::CollectiveTimeout { .. })))
            .count();
        assert_eq!((desyncs, timeouts), (1, 1));
    }
}
