//! Host-side all-reduce over the TCP rendezvous star
//!
//! Rank 0 receives every peer's contribution, sums them in rank order and
//! sends the identical result back, so all ranks observe bit-equal values.
//! Each frame carries the sender's call sequence number; a mismatch is
//! reported as a desync rather than silently mixing different calls.

use bytemuck::Pod;
use std::io::ErrorKind;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::rendezvous::{read_header, read_payload, write_frame, Star};
use super::sync::Collective;
use crate::error::{DdpError, Result};

pub struct TcpCollective {
    star: Mutex<Star>,
    rank: usize,
    world_size: usize,
    io_timeout_secs: u64,
    seq: AtomicU64,
}

impl TcpCollective {
    pub fn new(star: Star, rank: usize, world_size: usize, io_timeout_secs: u64) -> Self {
        log::info!(
            "TCP collective ready: rank {} of {}",
            rank,
            world_size
        );
        Self {
            star: Mutex::new(star),
            rank,
            world_size,
            io_timeout_secs,
            seq: AtomicU64::new(0),
        }
    }

    fn io_error(&self, seq: u64, e: std::io::Error) -> DdpError {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => DdpError::CollectiveTimeout {
                rank: self.rank,
                seq,
                waited_secs: self.io_timeout_secs,
            },
            _ => DdpError::transport(self.rank, e),
        }
    }

    fn check_frame(&self, peer: usize, seq: u64, found_seq: u64, found_len: usize, len: usize) -> Result<()> {
        if found_seq != seq {
            return Err(DdpError::CollectiveDesync {
                rank: self.rank,
                peer,
                expected: seq,
                found: found_seq,
            });
        }
        if found_len != len {
            return Err(DdpError::transport(
                self.rank,
                format!(
                    "peer {} sent {} bytes for call #{}, expected {}",
                    peer, found_len, seq, len
                ),
            ));
        }
        Ok(())
    }

    fn reduce<T: Pod + AddAssign>(&self, buf: &mut [T]) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let byte_len = std::mem::size_of_val(buf);
        let mut star = self
            .star
            .lock()
            .map_err(|_| DdpError::transport(self.rank, "collective state poisoned"))?;

        match &mut *star {
            Star::Solo => Ok(()),
            Star::Hub { peers } => {
                let mut incoming = vec![T::zeroed(); buf.len()];
                for (i, peer) in peers.iter_mut().enumerate() {
                    let header = read_header(peer).map_err(|e| self.io_error(seq, e))?;
                    self.check_frame(i + 1, seq, header.seq, header.len, byte_len)?;
                    read_payload(peer, &mut incoming).map_err(|e| self.io_error(seq, e))?;
                    for (b, v) in buf.iter_mut().zip(&incoming) {
                        *b += *v;
                    }
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, seq, buf).map_err(|e| self.io_error(seq, e))?;
                }
                Ok(())
            }
            Star::Spoke { hub } => {
                write_frame(hub, seq, buf).map_err(|e| self.io_error(seq, e))?;
                let header = read_header(hub).map_err(|e| self.io_error(seq, e))?;
                self.check_frame(0, seq, header.seq, header.len, byte_len)?;
                read_payload(hub, buf).map_err(|e| self.io_error(seq, e))
            }
        }
    }
}

impl Collective for TcpCollective {
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.reduce(buf)
    }

    fn all_reduce_sum_f64(&self, buf: &mut [f64]) -> Result<()> {
        self.reduce(buf)
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
