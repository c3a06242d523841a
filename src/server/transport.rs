//! Server internal RPC transport module implementation.

use std::fmt;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::utils::{ViewstampError, safe_tcp_read, tcp_write_obj};
use crate::server::ReplicaId;

use async_trait::async_trait;

use bytes::BytesMut;

use serde::{Serialize, de::DeserializeOwned};

use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Sequence number tagging a call so its reply can be matched on a
/// multiplexed connection.
type CallSeq = u64;

/// Reply slot handed to a peer messenger alongside the request.
type ReplySlot<Rep> = oneshot::Sender<Result<Rep, ViewstampError>>;

/// Logical RPC surface used by the replica to talk to its peers.
#[async_trait]
pub trait RpcTransport<Req, Rep>: Send + Sync {
    /// Issues one call to a peer and waits for its reply. Failures are not
    /// retried here.
    async fn call(&self, peer: ReplicaId, req: Req)
        -> Result<Rep, ViewstampError>;
}

/// Serving side of the RPC surface, implemented by the replica.
#[async_trait]
pub trait RpcHandler<Req, Rep>: Send + Sync {
    /// Handles one call from peer `from`.
    async fn handle(&self, from: ReplicaId, req: Req)
        -> Result<Rep, ViewstampError>;
}

/// Server internal TCP transport hub. Keeps at most one outbound connection
/// per peer, over which concurrent calls are multiplexed.
pub struct TransportHub<Req, Rep> {
    /// My replica ID.
    me: ReplicaId,

    /// Map from peer ID -> its listening address.
    peer_addrs: HashMap<ReplicaId, SocketAddr>,

    /// Map from peer ID -> cached sender into that peer's messenger task.
    /// Each slot is locked across connection establishment, so concurrent
    /// first use results in a single connection.
    conns: HashMap<ReplicaId, Mutex<Option<mpsc::UnboundedSender<(Req, ReplySlot<Rep>)>>>>,

    /// TCP listener for peer connections, taken by `serve()`.
    peer_listener: Mutex<Option<TcpListener>>,

    _phantom: PhantomData<Rep>,
}

// TransportHub public API implementation
impl<Req, Rep> TransportHub<Req, Rep>
where
    Req: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    Rep: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new transport hub and binds its peer listener. Outbound
    /// connections are established lazily on first call.
    pub async fn new_and_setup(
        me: ReplicaId,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
    ) -> Result<Self, ViewstampError> {
        if peer_addrs.contains_key(&me) {
            return logged_err!(me; "peer_addrs contains myself");
        }
        let peer_listener = TcpListener::bind(p2p_addr).await?;
        pf_info!(me; "accepting peers on '{}'", p2p_addr);

        let conns = peer_addrs
            .keys()
            .map(|&peer| (peer, Mutex::new(None)))
            .collect();
        Ok(TransportHub {
            me,
            peer_addrs,
            conns,
            peer_listener: Mutex::new(Some(peer_listener)),
            _phantom: PhantomData,
        })
    }

    /// Spawns the peer acceptor task, which dispatches incoming calls to
    /// `handler` until `rx_term` fires.
    pub async fn serve(
        &self,
        handler: Arc<dyn RpcHandler<Req, Rep>>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ViewstampError> {
        match self.peer_listener.lock().await.take() {
            Some(peer_listener) => Ok(tokio::spawn(Self::peer_acceptor_task(
                self.me,
                peer_listener,
                handler,
                rx_term,
            ))),
            None => logged_err!(self.me; "serve already called"),
        }
    }

    /// Returns a live sender into the messenger task of `peer`, connecting
    /// first if there is none.
    async fn conn_to(
        &self,
        peer: ReplicaId,
    ) -> Result<mpsc::UnboundedSender<(Req, ReplySlot<Rep>)>, ViewstampError>
    {
        let (slot, addr) = match (self.conns.get(&peer), self.peer_addrs.get(&peer)) {
            (Some(slot), Some(addr)) => (slot, *addr),
            _ => return logged_err!(self.me; "unknown peer ID {}", peer),
        };

        let mut slot = slot.lock().await;
        if let Some(tx_call) = slot.as_ref() {
            if !tx_call.is_closed() {
                return Ok(tx_call.clone());
            }
            pf_debug!(self.me; "connection to {} lost, reconnecting", peer);
        }

        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_u8(self.me).await?; // send my ID
        let (conn_read, conn_write) = stream.into_split();

        let (tx_call, rx_call) = mpsc::unbounded_channel();
        tokio::spawn(Self::peer_messenger_task(
            self.me, peer, conn_read, conn_write, rx_call,
        ));
        pf_debug!(self.me; "connected to peer {} '{}'", peer, addr);

        *slot = Some(tx_call.clone());
        Ok(tx_call)
    }
}

#[async_trait]
impl<Req, Rep> RpcTransport<Req, Rep> for TransportHub<Req, Rep>
where
    Req: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    Rep: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn call(
        &self,
        peer: ReplicaId,
        req: Req,
    ) -> Result<Rep, ViewstampError> {
        let tx_call = self.conn_to(peer).await?;
        let (tx_reply, rx_reply) = oneshot::channel();
        tx_call.send((req, tx_reply))?;
        // a dropped slot means the connection died with this call in flight
        rx_reply.await?
    }
}

// TransportHub peer_messenger task implementation
impl<Req, Rep> TransportHub<Req, Rep>
where
    Req: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    Rep: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Outbound connection task: writes calls, routes replies back by call
    /// sequence number. Exits on any connection error, dropping all pending
    /// reply slots.
    async fn peer_messenger_task(
        me: ReplicaId,
        peer: ReplicaId,
        mut conn_read: OwnedReadHalf,
        mut conn_write: OwnedWriteHalf,
        mut rx_call: mpsc::UnboundedReceiver<(Req, ReplySlot<Rep>)>,
    ) {
        pf_debug!(me; "peer_messenger task for {} spawned", peer);

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut pending: HashMap<CallSeq, ReplySlot<Rep>> = HashMap::new();
        let mut next_seq: CallSeq = 0;

        loop {
            tokio::select! {
                call = rx_call.recv() => {
                    let Some((req, tx_reply)) = call else {
                        break; // hub dropped
                    };
                    let seq = next_seq;
                    next_seq += 1;
                    if let Err(e) = tcp_write_obj(&(seq, &req), &mut conn_write).await {
                        pf_warn!(me; "error sending to {}: {}", peer, e);
                        let _ = tx_reply.send(Err(e));
                        break;
                    }
                    pending.insert(seq, tx_reply);
                },

                reply = safe_tcp_read::<(CallSeq, Result<Rep, ViewstampError>), _>(
                    &mut read_buf, &mut conn_read
                ) => {
                    match reply {
                        Ok((seq, rep)) => match pending.remove(&seq) {
                            Some(tx_reply) => {
                                let _ = tx_reply.send(rep);
                            }
                            None => {
                                pf_warn!(me; "unmatched reply seq {} from {}", seq, peer);
                            }
                        },
                        Err(e) => {
                            pf_debug!(me; "connection to {} closed: {}", peer, e);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!(me; "peer_messenger task for {} exitted", peer);
    }
}

// TransportHub peer_acceptor task implementation
impl<Req, Rep> TransportHub<Req, Rep>
where
    Req: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    Rep: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Peer acceptor task function.
    async fn peer_acceptor_task(
        me: ReplicaId,
        peer_listener: TcpListener,
        handler: Arc<dyn RpcHandler<Req, Rep>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                accepted = peer_listener.accept() => {
                    let mut stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            pf_warn!(me; "error accepting peer connection: {}", e);
                            continue;
                        }
                    };
                    let peer = match stream.read_u8().await {
                        Ok(peer) => peer,
                        Err(e) => {
                            pf_error!(me; "error receiving peer ID: {}", e);
                            continue;
                        }
                    };
                    let (conn_read, conn_write) = stream.into_split();
                    tokio::spawn(Self::peer_servant_task(
                        me,
                        peer,
                        conn_read,
                        conn_write,
                        handler.clone(),
                        rx_term.clone(),
                    ));
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(me; "peer_acceptor task exitted");
    }

    /// Inbound connection task: each call is handled in its own task, and
    /// replies are written back in completion order.
    async fn peer_servant_task(
        me: ReplicaId,
        peer: ReplicaId,
        mut conn_read: OwnedReadHalf,
        mut conn_write: OwnedWriteHalf,
        handler: Arc<dyn RpcHandler<Req, Rep>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "peer_servant task for {} spawned", peer);

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let (tx_done, mut rx_done) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                biased;

                // writes back a finished reply
                done = rx_done.recv() => {
                    let Some((seq, rep)) = done else { break };
                    let frame: (CallSeq, Result<Rep, ViewstampError>) = (seq, rep);
                    if let Err(e) = tcp_write_obj(&frame, &mut conn_write).await {
                        pf_error!(me; "error replying to {}: {}", peer, e);
                        break;
                    }
                },

                // receives a new call
                call = safe_tcp_read::<(CallSeq, Req), _>(&mut read_buf, &mut conn_read) => {
                    match call {
                        Ok((seq, req)) => {
                            let handler = handler.clone();
                            let tx_done = tx_done.clone();
                            tokio::spawn(async move {
                                let rep = handler.handle(peer, req).await;
                                let _ = tx_done.send((seq, rep));
                            });
                        }
                        Err(e) => {
                            pf_debug!(me; "peer {} disconnected: {}", peer, e);
                            break;
                        }
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(me; "peer_servant task for {} exitted", peer);
    }
}
