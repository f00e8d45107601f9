//! Assignment of clusters to controller replicas
//!
//! Every cluster is owned by exactly one shard. Applications are processed
//! by the shard owning their destination cluster.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use tracing::{debug, info};

use crate::clients::Cluster;
use crate::error::{Error, Result};

/// Headroom of the consistent hashing ring over a perfectly even split
const LOAD_FACTOR: f64 = 1.25;
const VIRTUAL_NODES: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShardingAlgorithm {
    /// FNV-1a hash of the cluster id modulo the replica count
    #[default]
    Legacy,
    RoundRobin,
    ConsistentHashing,
}

impl FromStr for ShardingAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" | "" => Ok(ShardingAlgorithm::Legacy),
            "round-robin" => Ok(ShardingAlgorithm::RoundRobin),
            "consistent-hashing" => Ok(ShardingAlgorithm::ConsistentHashing),
            other => Err(Error::ConfigError(format!(
                "unknown sharding algorithm '{}'",
                other
            ))),
        }
    }
}

/// 32 bit FNV-1a
pub fn fnv32a(data: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Shard number from a StatefulSet style hostname such as `controller-2`
pub fn infer_shard(hostname: &str) -> Option<i64> {
    hostname.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

pub struct ClusterSharding {
    shard: i64,
    replicas: i64,
    algorithm: ShardingAlgorithm,
    /// Precomputed owners by cluster id for the list based algorithms
    assignments: RwLock<HashMap<String, i64>>,
}

impl ClusterSharding {
    pub fn new(shard: i64, replicas: i64, algorithm: ShardingAlgorithm) -> Self {
        Self {
            shard,
            replicas: replicas.max(1),
            algorithm,
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Single replica owning everything
    pub fn single() -> Self {
        Self::new(0, 1, ShardingAlgorithm::Legacy)
    }

    pub fn shard(&self) -> i64 {
        self.shard
    }

    pub fn replicas(&self) -> i64 {
        self.replicas
    }

    /// Recompute list based assignments after the cluster set changed
    pub fn update(&self, clusters: &[Cluster]) {
        let mut ids: Vec<String> = clusters.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids.dedup();

        let assignments = match self.algorithm {
            ShardingAlgorithm::Legacy => HashMap::new(),
            ShardingAlgorithm::RoundRobin => ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i as i64 % self.replicas))
                .collect(),
            ShardingAlgorithm::ConsistentHashing => self.bounded_load_assignment(&ids),
        };
        debug!(clusters = ids.len(), "Recomputed shard assignments");
        *self
            .assignments
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = assignments;
    }

    fn bounded_load_assignment(&self, ids: &[String]) -> HashMap<String, i64> {
        let mut ring: Vec<(u32, i64)> = (0..self.replicas)
            .flat_map(|shard| {
                (0..VIRTUAL_NODES).map(move |v| (fnv32a(&format!("shard-{}-{}", shard, v)), shard))
            })
            .collect();
        ring.sort();

        let capacity = ((ids.len() as f64 * LOAD_FACTOR) / self.replicas as f64).ceil().max(1.0) as usize;
        let mut load: HashMap<i64, usize> = HashMap::new();
        let mut assignments = HashMap::new();
        for id in ids {
            let hash = fnv32a(id);
            let start = ring.partition_point(|(h, _)| *h < hash);
            for offset in 0..ring.len() {
                let (_, shard) = ring[(start + offset) % ring.len()];
                let used = load.entry(shard).or_insert(0);
                if *used < capacity {
                    *used += 1;
                    assignments.insert(id.clone(), shard);
                    break;
                }
            }
        }
        assignments
    }

    /// Shard owning a cluster
    pub fn shard_of(&self, cluster: &Cluster) -> i64 {
        if let Some(pinned) = cluster.shard {
            if pinned >= 0 && pinned < self.replicas {
                return pinned;
            }
        }
        if self.replicas <= 1 {
            return 0;
        }
        if self.algorithm != ShardingAlgorithm::Legacy {
            if let Some(shard) = self
                .assignments
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&cluster.id)
            {
                return *shard;
            }
        }
        if cluster.id.is_empty() {
            return 0;
        }
        (fnv32a(&cluster.id) % self.replicas as u32) as i64
    }

    pub fn is_managed(&self, cluster: &Cluster) -> bool {
        self.shard_of(cluster) == self.shard
    }

    pub fn log_assignment(&self, cluster: &Cluster) {
        info!(
            server = %cluster.server,
            shard = self.shard_of(cluster),
            "Cluster shard assignment"
        );
    }
}
