//! Job topology resolution from the SLURM launch environment.
//!
//! This is the only module that reads scheduler state from the process
//! environment. Everything downstream receives an immutable [`Topology`].

use serde::Serialize;

use crate::error::{DdpError, Result};

/// Fixed rendezvous port used by every process in the job.
pub const RENDEZVOUS_PORT: u16 = 29500;

pub const ENV_NUM_NODES: &str = "SLURM_JOB_NUM_NODES";
pub const ENV_NODE_ID: &str = "SLURM_NODEID";
pub const ENV_LOCAL_ID: &str = "SLURM_LOCALID";
pub const ENV_PROC_ID: &str = "SLURM_PROCID";
pub const ENV_NTASKS: &str = "SLURM_NTASKS";
pub const ENV_NODELIST: &str = "SLURM_JOB_NODELIST";
pub const ENV_NODENAME: &str = "SLURMD_NODENAME";

/// Per-process placement within the job. Computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub node_count: usize,
    pub node_id: usize,
    pub local_rank: usize,
    pub global_rank: usize,
    pub world_size: usize,
    pub gpus_per_node: usize,
    /// True only for (node 0, local rank 0). Gates every logging and
    /// checkpoint side effect.
    pub is_master: bool,
    pub master_address: String,
    pub master_port: u16,
    pub hostname: Option<String>,
}

impl Topology {
    /// Build and validate a topology from explicit identifiers.
    pub fn new(
        node_count: usize,
        node_id: usize,
        local_rank: usize,
        global_rank: usize,
        world_size: usize,
        master_address: impl Into<String>,
    ) -> Result<Self> {
        if node_count == 0 {
            return Err(DdpError::config("node count must be at least 1"));
        }
        if world_size == 0 {
            return Err(DdpError::config("world size must be at least 1"));
        }
        let gpus_per_node = world_size / node_count;
        if gpus_per_node * node_count != world_size {
            return Err(DdpError::config(format!(
                "world size {} is not divisible across {} nodes",
                world_size, node_count
            )));
        }
        if node_id >= node_count {
            return Err(DdpError::config(format!(
                "node id {} out of range for {} nodes",
                node_id, node_count
            )));
        }
        if local_rank >= gpus_per_node {
            return Err(DdpError::config(format!(
                "local rank {} out of range for {} processes per node",
                local_rank, gpus_per_node
            )));
        }
        if global_rank >= world_size {
            return Err(DdpError::config(format!(
                "global rank {} out of range for world size {}",
                global_rank, world_size
            )));
        }

        Ok(Self {
            node_count,
            node_id,
            local_rank,
            global_rank,
            world_size,
            gpus_per_node,
            is_master: node_id == 0 && local_rank == 0,
            master_address: master_address.into(),
            master_port: RENDEZVOUS_PORT,
            hostname: None,
        })
    }

    /// Single process, single node topology on localhost.
    #[cfg(test)]
    pub fn single_process() -> Self {
        Self {
            node_count: 1,
            node_id: 0,
            local_rank: 0,
            global_rank: 0,
            world_size: 1,
            gpus_per_node: 1,
            is_master: true,
            master_address: "127.0.0.1".to_string(),
            master_port: RENDEZVOUS_PORT,
            hostname: None,
        }
    }

    /// Resolve the topology from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the topology through an arbitrary variable lookup.
    ///
    /// Every scheduler identifier is required. A missing or non-numeric value
    /// is a configuration error; the process must not guess its rank.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| {
                DdpError::config(format!("required environment variable {} is not set", key))
            })
        };
        let numeric = |key: &str| -> Result<usize> {
            let raw = required(key)?;
            raw.trim().parse::<usize>().map_err(|_| {
                DdpError::config(format!("{}={:?} is not a non-negative integer", key, raw))
            })
        };

        let node_count = numeric(ENV_NUM_NODES)?;
        let node_id = numeric(ENV_NODE_ID)?;
        let local_rank = numeric(ENV_LOCAL_ID)?;
        let global_rank = numeric(ENV_PROC_ID)?;
        let world_size = numeric(ENV_NTASKS)?;
        let master_address = first_hostname(&required(ENV_NODELIST)?)?;

        let mut topology = Self::new(
            node_count,
            node_id,
            local_rank,
            global_rank,
            world_size,
            master_address,
        )?;
        topology.hostname = lookup(ENV_NODENAME);
        Ok(topology)
    }

    pub fn rendezvous_endpoint(&self) -> String {
        format!("{}:{}", self.master_address, self.master_port)
    }

    pub fn multi_node(&self) -> bool {
        self.node_count > 1
    }

    pub fn multi_gpu(&self) -> bool {
        self.world_size > 1
    }

    /// Publish the rendezvous variables consumed by collective bootstrap
    /// tooling (`MASTER_ADDR`, `MASTER_PORT`, `WORLD_SIZE`, `RANK`).
    pub fn export_env(&self) {
        std::env::set_var("MASTER_ADDR", &self.master_address);
        std::env::set_var("MASTER_PORT", self.master_port.to_string());
        std::env::set_var("WORLD_SIZE", self.world_size.to_string());
        std::env::set_var("RANK", self.global_rank.to_string());
    }

    pub fn log_summary(&self) {
        log::info!("Number of nodes: {}", self.node_count);
        log::info!("Node ID        : {}", self.node_id);
        log::info!("Local rank     : {}", self.local_rank);
        log::info!("Global rank    : {}", self.global_rank);
        log::info!("World size     : {}", self.world_size);
        log::info!("GPUs per node  : {}", self.gpus_per_node);
        log::info!("Master         : {}", self.is_master);
        log::info!("Multi-node     : {}", self.multi_node());
        log::info!("Multi-GPU      : {}", self.multi_gpu());
        log::info!(
            "Hostname       : {}",
            self.hostname.as_deref().unwrap_or("<unknown>")
        );
        log::info!("Rendezvous     : {}", self.rendezvous_endpoint());
    }
}

/// First host of a SLURM node list, i.e. the head of
/// `scontrol show hostnames <nodelist>`.
pub fn first_hostname(nodelist: &str) -> Result<String> {
    expand_nodelist(nodelist)?
        .into_iter()
        .next()
        .ok_or_else(|| DdpError::config(format!("node list {:?} names no hosts", nodelist)))
}

/// Expand a compressed SLURM node list such as `gpu[01-03,07],login1`.
pub fn expand_nodelist(nodelist: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for entry in split_top_level(nodelist.trim()) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        hosts.extend(expand_entry(entry)?);
    }
    Ok(hosts)
}

/// Split on commas that are not inside brackets.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

fn expand_entry(entry: &str) -> Result<Vec<String>> {
    let Some(open) = entry.find('[') else {
        if entry.contains(']') {
            return Err(DdpError::config(format!("unbalanced ']' in node list entry {:?}", entry)));
        }
        return Ok(vec![entry.to_string()]);
    };
    let close = entry[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| DdpError::config(format!("unterminated '[' in node list entry {:?}", entry)))?;

    let prefix = &entry[..open];
    let body = &entry[open + 1..close];
    let suffixes = expand_entry(&entry[close + 1..])?;

    let mut hosts = Vec::new();
    for item in body.split(',') {
        let (lo, hi) = item.split_once('-').unwrap_or((item, item));
        let parse = |s: &str| {
            s.trim().parse::<u64>().map_err(|_| {
                DdpError::config(format!("bad range {:?} in node list entry {:?}", item, entry))
            })
        };
        let (start, end) = (parse(lo)?, parse(hi)?);
        if end < start {
            return Err(DdpError::config(format!(
                "descending range {:?} in node list entry {:?}",
                item, entry
            )));
        }
        let width = lo.trim().len();
        for n in start..=end {
            for suffix in &suffixes {
                hosts.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
            }
        }
    }
    Ok(hosts)
}
