//! Viewstamped Replication -- peer-peer message types.

use crate::server::{ReplicaId, OpNum, OpRecord, Request};

use serde::{Serialize, Deserialize};

/// Replica mode (status).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Mode {
    Primary,
    Backup,
    ViewChangeInit,
    ViewChange,
    Recovery,
}

impl Mode {
    /// True in the modes where the replica takes part in normal replication.
    #[inline]
    pub fn is_normal(self) -> bool {
        matches!(self, Mode::Primary | Mode::Backup)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PrepareArgs {
    pub view: u64,
    pub request: Request,
    pub op_num: OpNum,
    pub commit: OpNum,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DoViewChangeArgs {
    /// Proposed new view.
    pub view: u64,
    pub log: Vec<OpRecord>,

    /// View in which the sender's log was last accepted in normal mode.
    pub latest_normal_view: u64,
    pub op_num: OpNum,
    pub commit: OpNum,
    pub replica: ReplicaId,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartViewArgs {
    pub view: u64,
    pub log: Vec<OpRecord>,
    pub op_num: OpNum,
    pub commit: OpNum,
}

/// State only a primary hands out in a recovery response.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PrimaryState {
    pub log: Vec<OpRecord>,
    pub op_num: OpNum,
    pub commit: OpNum,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub view: u64,
    pub nonce: u64,
    pub replica: ReplicaId,
    pub mode: Mode,
    pub primary_state: Option<PrimaryState>,
}

/// Peer-peer call type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    Prepare(PrepareArgs),

    /// Primary heartbeat carrying its commit number while idle.
    Commit { view: u64, commit: OpNum },

    StartViewChange { view: u64, replica: ReplicaId },
    DoViewChange(DoViewChangeArgs),
    StartView(StartViewArgs),
    Recovery { replica: ReplicaId, nonce: u64 },
}

/// Peer-peer reply type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    PrepareOk {
        view: u64,
        op_num: OpNum,
        replica: ReplicaId,
    },
    Ack,
    Recovery(RecoveryResponse),
}
