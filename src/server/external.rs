//! Server external client-facing API module implementation.

use std::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::utils::{ViewstampError, safe_tcp_read, tcp_write_obj};
use crate::server::{ReplicaId, Command, CommandResult, RequestNum};
use crate::client::ClientId;

use async_trait::async_trait;

use bytes::BytesMut;

use serde::{Serialize, Deserialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Regular request.
    Execute {
        /// Client-assigned request number, increasing per client.
        req_num: RequestNum,

        /// Command to be replicated and executed.
        cmd: Command,
    },

    /// Client leave notification.
    Leave,
}

/// Hint returned instead of a result.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ApiError {
    /// Talk to the primary of the returned view instead.
    NotPrimary,

    /// A view change is in progress, retry later.
    ViewChange,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotPrimary => write!(f, "not primary"),
            Self::ViewChange => write!(f, "view change"),
        }
    }
}

impl From<ApiError> for ViewstampError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::NotPrimary => ViewstampError::NotPrimary,
            ApiError::ViewChange => ViewstampError::UnderViewChange,
        }
    }
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to regular request.
    Reply {
        /// View number known to the replying replica.
        view: u64,

        /// Number of the corresponding client request.
        req_num: RequestNum,

        /// Command result, or `None` if unsuccessful or still in flight.
        result: Option<CommandResult>,

        /// Set if the request was not served.
        error: Option<ApiError>,
    },

    /// Reply to client leave notification.
    Leave,
}

/// Serving side of the client API, implemented by the replica. The returned
/// future resolves once the request is answered.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn execute(
        &self,
        client: ClientId,
        req_num: RequestNum,
        cmd: Command,
    ) -> ApiReply;
}

/// The external client-facing API module.
pub struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Address the client listener is bound to.
    api_addr: SocketAddr,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a TCP listener for client connections and spawns the client
    /// acceptor task, which serves clients through `handler` until `rx_term`
    /// fires.
    pub async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        handler: Arc<dyn ApiHandler>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, ViewstampError> {
        let client_listener = TcpListener::bind(api_addr).await?;
        let api_addr = client_listener.local_addr()?;

        let client_acceptor_handle = tokio::spawn(
            Self::client_acceptor_task(me, client_listener, handler, rx_term),
        );

        Ok(ExternalApi {
            me,
            api_addr,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }

    /// Address the client listener is bound to.
    #[inline]
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    #[inline]
    pub fn me(&self) -> ReplicaId {
        self.me
    }
}

// ExternalApi client_acceptor task implementation
impl ExternalApi {
    /// Client acceptor task function.
    async fn client_acceptor_task(
        me: ReplicaId,
        client_listener: TcpListener,
        handler: Arc<dyn ApiHandler>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "client_acceptor task spawned");
        if let Ok(local_addr) = client_listener.local_addr() {
            pf_info!(me; "accepting clients on '{}'", local_addr);
        }

        let mut client_servant_handles: HashMap<ClientId, JoinHandle<()>> =
            HashMap::new();

        loop {
            tokio::select! {
                accepted = client_listener.accept() => {
                    let (mut stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!(me; "error accepting client connection: {}", e);
                            continue;
                        }
                    };

                    let id = match stream.read_u64().await { // receive client ID
                        Ok(id) => id,
                        Err(e) => {
                            pf_error!(me; "error receiving new client ID: {}", e);
                            continue;
                        }
                    };

                    if let Some(handle) = client_servant_handles.get(&id) {
                        if !handle.is_finished() {
                            pf_error!(me; "duplicate client ID listened: {}", id);
                            continue;
                        }
                    }
                    pf_info!(me; "accepted new client {}", id);

                    let client_servant_handle =
                        tokio::spawn(Self::client_servant_task(
                            me,
                            id,
                            addr,
                            stream,
                            handler.clone(),
                            rx_term.clone(),
                        ));
                    client_servant_handles.insert(id, client_servant_handle);
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(me; "client_acceptor task exitted");
    }
}

// ExternalApi client_servant task implementation
impl ExternalApi {
    /// Client request listener and reply sender task function. Every request
    /// is handled in its own task so a request blocked on replication does
    /// not stall the connection.
    async fn client_servant_task(
        me: ReplicaId,
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        handler: Arc<dyn ApiHandler>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "client_servant task for {} ({}) spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.into_split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);
        let (tx_reply, mut rx_reply) = mpsc::unbounded_channel::<ApiReply>();

        loop {
            tokio::select! {
                // select between getting a new reply to send back and receiving
                // new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    let Some(reply) = reply else { break };
                    if let Err(e) = tcp_write_obj(&reply, &mut conn_write).await {
                        pf_error!(me; "error replying to {}: {}", id, e);
                    }
                },

                // receives client request
                req = safe_tcp_read(&mut req_buf, &mut conn_read) => {
                    match req {
                        // client leaving, send dummy reply and break
                        Ok(ApiRequest::Leave) => {
                            if let Err(e) = tcp_write_obj(&ApiReply::Leave, &mut conn_write).await {
                                pf_error!(me; "error replying to {}: {}", id, e);
                            } else {
                                pf_info!(me; "client {} has left", id);
                            }
                            break;
                        },

                        Ok(ApiRequest::Execute { req_num, cmd }) => {
                            pf_trace!(me; "request from {} #{} {:?}", id, req_num, cmd);
                            let handler = handler.clone();
                            let tx_reply = tx_reply.clone();
                            tokio::spawn(async move {
                                let reply = handler.execute(id, req_num, cmd).await;
                                let _ = tx_reply.send(reply);
                            });
                        },

                        Err(e) => {
                            pf_error!(me; "error reading request from {}: {}", id, e);
                            break; // probably the client exitted without `leave()`
                        }
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(me; "client_servant task for {} ({}) exitted", id, addr);
    }
}
