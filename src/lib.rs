//! Public interface to the Viewstamp core library, linked by the server and
//! client executables.

#[macro_use]
mod utils;

mod server;
mod protocol;
mod client;

// Helper utilities:
pub use crate::utils::{ViewstampError, ReplicaMap, Timer, logger_init};

// Server-side types:
pub use crate::server::{
    ReplicaId, Command, CommandResult, OpNum, RequestNum, Request, OpRecord,
    OpLog, Response, ClientTable, RpcTransport, RpcHandler, TransportHub,
    ApiRequest, ApiReply, ApiError, ApiHandler, ExternalApi, Role,
    ReplicaSpec, ClusterMap, CrashMarker,
};

// Replication protocol:
pub use crate::protocol::{
    VrReplica, ReplicaConfigVr, ReplicaStatus, Mode, PeerMsg, PeerReply,
};

// Client-side types:
pub use crate::client::{ClientId, ClientApiStub, ClientConfig, ClientEndpoint};
