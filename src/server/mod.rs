//! Viewstamp's protocol-agnostic server functionality modules.

mod statemach;
mod oplog;
mod clienttable;
mod transport;
mod external;
mod cluster;
mod crashmark;

#[cfg(test)]
mod localnet;

/// Server replica ID type.
pub type ReplicaId = u8;

pub use statemach::{CommandId, Command, CommandResult};
pub use oplog::{OpNum, RequestNum, Request, OpRecord, OpLog};
pub use clienttable::{Response, ClientTable};
pub use transport::{RpcTransport, RpcHandler, TransportHub};
pub use external::{ApiRequest, ApiReply, ApiError, ApiHandler, ExternalApi};
pub use cluster::{Role, ReplicaSpec, ClusterMap};
pub use crashmark::CrashMarker;

pub(crate) use statemach::StateMachine;

#[cfg(test)]
pub(crate) use localnet::LocalNet;
