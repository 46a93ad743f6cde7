//! TCP rendezvous at `MASTER_ADDR:MASTER_PORT`
//!
//! Rank 0 binds the fixed port and accepts one connection from every other
//! rank. The resulting star is used directly by the TCP collective and, for
//! NCCL, to hand the communicator id from rank 0 to everyone else.
//!
//! Wire format: every frame starts with a little-endian `u64` call sequence
//! number and a `u64` payload byte count, followed by the payload bytes.

use bytemuck::Pod;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DdpError, Result};

const HELLO_MAGIC: u32 = 0x4444_5031; // "DDP1"
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Connected rendezvous star, seen from one rank.
pub enum Star {
    /// Rank 0: one stream per peer, indexed by `rank - 1`.
    Hub { peers: Vec<TcpStream> },
    /// Any other rank: the stream to rank 0.
    Spoke { hub: TcpStream },
    /// World of one, nothing to connect.
    Solo,
}

#[derive(Debug, Clone)]
pub struct RendezvousSpec {
    pub rank: usize,
    pub world_size: usize,
    pub address: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Read/write timeout applied to every established stream.
    pub io_timeout: Duration,
}

impl RendezvousSpec {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn fail(&self, reason: impl std::fmt::Display) -> DdpError {
        DdpError::Rendezvous {
            endpoint: self.endpoint(),
            reason: reason.to_string(),
        }
    }
}

impl Star {
    /// Form the star. Blocks until every rank has joined or the connect
    /// timeout elapses.
    pub fn connect(spec: &RendezvousSpec) -> Result<Self> {
        if spec.world_size <= 1 {
            return Ok(Star::Solo);
        }
        if spec.rank == 0 {
            Self::accept_peers(spec)
        } else {
            Self::join_hub(spec)
        }
    }

    fn accept_peers(spec: &RendezvousSpec) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", spec.port)).map_err(|e| spec.fail(e))?;
        listener.set_nonblocking(true).map_err(|e| spec.fail(e))?;

        let deadline = Instant::now() + spec.connect_timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..spec.world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < slots.len() {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    stream.set_nonblocking(false).map_err(|e| spec.fail(e))?;
                    stream
                        .set_read_timeout(Some(spec.connect_timeout))
                        .map_err(|e| spec.fail(e))?;
                    let peer = read_hello(&mut stream, spec.world_size).map_err(|e| spec.fail(e))?;
                    let slot = &mut slots[peer - 1];
                    if slot.is_some() {
                        return Err(spec.fail(format!("rank {} joined twice (from {})", peer, addr)));
                    }
                    log::debug!("rendezvous: rank {} joined from {}", peer, addr);
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(spec.fail(format!(
                            "only {} of {} peers joined before the timeout",
                            joined,
                            slots.len()
                        )));
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(spec.fail(e)),
            }
        }

        let mut peers = Vec::with_capacity(slots.len());
        for mut stream in slots.into_iter().flatten() {
            configure_stream(&stream, spec.io_timeout).map_err(|e| spec.fail(e))?;
            // Release the peer only once everyone is in.
            stream.write_all(&[1u8]).map_err(|e| spec.fail(e))?;
            peers.push(stream);
        }
        Ok(Star::Hub { peers })
    }

    fn join_hub(spec: &RendezvousSpec) -> Result<Self> {
        let deadline = Instant::now() + spec.connect_timeout;
        let mut stream = loop {
            match connect_once(spec) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    log::trace!("rendezvous: {} not reachable yet ({})", spec.endpoint(), e);
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(spec.fail(e)),
            }
        };

        let mut hello = Vec::with_capacity(12);
        hello.extend_from_slice(&HELLO_MAGIC.to_le_bytes());
        hello.extend_from_slice(&(spec.rank as u32).to_le_bytes());
        hello.extend_from_slice(&(spec.world_size as u32).to_le_bytes());
        stream.write_all(&hello).map_err(|e| spec.fail(e))?;

        // Wait for the whole world to assemble.
        stream
            .set_read_timeout(Some(spec.connect_timeout))
            .map_err(|e| spec.fail(e))?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).map_err(|e| spec.fail(e))?;

        configure_stream(&stream, spec.io_timeout).map_err(|e| spec.fail(e))?;
        Ok(Star::Spoke { hub: stream })
    }

    /// Send `payload` from rank 0 to every rank. Non-zero ranks pass `None`
    /// and receive rank 0's bytes.
    #[cfg(any(feature = "nccl", test))]
    pub fn broadcast_bytes(&mut self, payload: Option<&[u8]>) -> std::io::Result<Vec<u8>> {
        match self {
            Star::Solo => Ok(payload.map(<[u8]>::to_vec).unwrap_or_default()),
            Star::Hub { peers } => {
                let bytes = payload.ok_or_else(|| {
                    std::io::Error::new(ErrorKind::InvalidInput, "rank 0 must supply the payload")
                })?;
                for peer in peers.iter_mut() {
                    peer.write_all(&(bytes.len() as u64).to_le_bytes())?;
                    peer.write_all(bytes)?;
                }
                Ok(bytes.to_vec())
            }
            Star::Spoke { hub } => {
                let mut len = [0u8; 8];
                hub.read_exact(&mut len)?;
                let mut bytes = vec![0u8; u64::from_le_bytes(len) as usize];
                hub.read_exact(&mut bytes)?;
                Ok(bytes)
            }
        }
    }
}

fn connect_once(spec: &RendezvousSpec) -> std::io::Result<TcpStream> {
    let addrs = (spec.address.as_str(), spec.port).to_socket_addrs()?;
    let mut last_err = std::io::Error::new(ErrorKind::NotFound, "address resolved to nothing");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, RETRY_INTERVAL * 5) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn configure_stream(stream: &TcpStream, io_timeout: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))
}

fn read_hello(stream: &mut TcpStream, world_size: usize) -> std::io::Result<usize> {
    let mut raw = [0u8; 12];
    stream.read_exact(&mut raw)?;
    let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
    let (magic, rank, peer_world) = (word(0), word(4) as usize, word(8) as usize);

    let invalid = |msg: String| std::io::Error::new(ErrorKind::InvalidData, msg);
    if magic != HELLO_MAGIC {
        return Err(invalid(format!("bad hello magic {:#x}", magic)));
    }
    if peer_world != world_size {
        return Err(invalid(format!(
            "peer reports world size {}, expected {}",
            peer_world, world_size
        )));
    }
    if rank == 0 || rank >= world_size {
        return Err(invalid(format!("peer reports invalid rank {}", rank)));
    }
    Ok(rank)
}

/// Header of one collective frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq: u64,
    /// Payload length in bytes, so peers reducing different element types
    /// at the same call are told apart.
    pub len: usize,
}

pub fn write_frame<T: Pod>(stream: &mut TcpStream, seq: u64, payload: &[T]) -> std::io::Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(payload);
    let mut header = [0u8; 16];
    header[..8].copy_from_slice(&seq.to_le_bytes());
    header[8..].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(bytes)
}

pub fn read_header(stream: &mut TcpStream) -> std::io::Result<FrameHeader> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header)?;
    let mut seq = [0u8; 8];
    let mut len = [0u8; 8];
    seq.copy_from_slice(&header[..8]);
    len.copy_from_slice(&header[8..]);
    Ok(FrameHeader {
        seq: u64::from_le_bytes(seq),
        len: u64::from_le_bytes(len) as usize,
    })
}

/// Read `out.len()` elements of payload following a header.
pub fn read_payload<T: Pod>(stream: &mut TcpStream, out: &mut [T]) -> std::io::Result<()> {
    stream.read_exact(bytemuck::cast_slice_mut(out))
}
