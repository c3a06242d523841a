//! Static cluster membership loaded from a TOML file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::utils::ViewstampError;
use crate::server::ReplicaId;

use serde::{Serialize, Deserialize};

/// Statically configured role of a replica.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Backup,
}

/// One member of the cluster.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    pub role: Role,

    /// Address peers connect to for replication traffic.
    pub p2p_addr: SocketAddr,

    /// Address clients connect to.
    pub api_addr: SocketAddr,
}

/// Read-only membership map. Example file:
///
/// ```toml
/// [[replicas]]
/// id = 0
/// role = "primary"
/// p2p_addr = "127.0.0.1:52800"
/// api_addr = "127.0.0.1:52700"
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterMap {
    /// Sorted by ID after validation.
    replicas: Vec<ReplicaSpec>,
}

impl ClusterMap {
    /// Builds a map from given members, validating it.
    pub fn new(mut replicas: Vec<ReplicaSpec>) -> Result<Self, ViewstampError> {
        replicas.sort_by_key(|r| r.id);
        if replicas.is_empty() || replicas.len() > u8::MAX as usize {
            return Err(ViewstampError::msg(format!(
                "invalid cluster size {}",
                replicas.len()
            )));
        }
        for (idx, r) in replicas.iter().enumerate() {
            if r.id as usize != idx {
                return Err(ViewstampError::msg(format!(
                    "replica IDs must be 0..{} without gaps, found {}",
                    replicas.len(),
                    r.id
                )));
            }
        }
        let primaries: Vec<ReplicaId> = replicas
            .iter()
            .filter(|r| r.role == Role::Primary)
            .map(|r| r.id)
            .collect();
        if primaries != [0] {
            return Err(ViewstampError::msg(format!(
                "replica 0 must be the only primary, found {:?}",
                primaries
            )));
        }
        Ok(ClusterMap { replicas })
    }

    /// Parses and validates a TOML membership description.
    pub fn from_toml_str(s: &str) -> Result<Self, ViewstampError> {
        let parsed: ClusterMap = toml::from_str(s)?;
        Self::new(parsed.replicas)
    }

    /// Loads and validates a TOML membership file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ViewstampError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    /// Number of replicas in the cluster.
    #[inline]
    pub fn population(&self) -> u8 {
        self.replicas.len() as u8
    }

    /// Primary replica of the given view.
    #[inline]
    pub fn primary_of(&self, view: u64) -> ReplicaId {
        (view % self.replicas.len() as u64) as ReplicaId
    }

    /// Looks up a member by ID.
    pub fn get(&self, id: ReplicaId) -> Result<&ReplicaSpec, ViewstampError> {
        self.replicas.get(id as usize).ok_or_else(|| {
            ViewstampError::msg(format!("replica {} not in cluster", id))
        })
    }

    /// Peer-to-peer addresses of everyone except `me`.
    pub fn peer_p2p_addrs(&self, me: ReplicaId) -> HashMap<ReplicaId, SocketAddr> {
        self.replicas
            .iter()
            .filter(|r| r.id != me)
            .map(|r| (r.id, r.p2p_addr))
            .collect()
    }

    /// All members in ID order.
    #[inline]
    pub fn replicas(&self) -> &[ReplicaSpec] {
        &self.replicas
    }
}
