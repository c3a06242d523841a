//! In-process transport for running whole clusters inside one test.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use crate::utils::ViewstampError;
use crate::server::{ReplicaId, RpcHandler, RpcTransport};

use async_trait::async_trait;

/// Shared registry of handlers, one per replica ID, plus the set of replicas
/// currently cut off from everyone.
pub(crate) struct LocalNet<Req, Rep> {
    handlers: RwLock<HashMap<ReplicaId, Weak<dyn RpcHandler<Req, Rep>>>>,
    down: RwLock<HashSet<ReplicaId>>,
}

impl<Req, Rep> LocalNet<Req, Rep>
where
    Req: Send + Sync + 'static,
    Rep: Send + Sync + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(LocalNet {
            handlers: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
        })
    }

    /// Registers (or replaces) the handler serving replica `id`.
    pub(crate) fn register(
        &self,
        id: ReplicaId,
        handler: Weak<dyn RpcHandler<Req, Rep>>,
    ) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(id, handler);
        }
    }

    /// Makes replica `id` unreachable (both directions) or reachable again.
    pub(crate) fn set_down(&self, id: ReplicaId, down: bool) {
        if let Ok(mut set) = self.down.write() {
            if down {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }
    }

    fn is_down(&self, id: ReplicaId) -> bool {
        self.down.read().map_or(false, |set| set.contains(&id))
    }

    /// Transport endpoint for replica `me`.
    pub(crate) fn endpoint(self: &Arc<Self>, me: ReplicaId) -> LocalTransport<Req, Rep> {
        LocalTransport {
            me,
            net: self.clone(),
        }
    }
}

/// Per-replica view onto a `LocalNet`.
pub(crate) struct LocalTransport<Req, Rep> {
    me: ReplicaId,
    net: Arc<LocalNet<Req, Rep>>,
}

#[async_trait]
impl<Req, Rep> RpcTransport<Req, Rep> for LocalTransport<Req, Rep>
where
    Req: Send + Sync + 'static,
    Rep: Send + Sync + 'static,
{
    async fn call(
        &self,
        peer: ReplicaId,
        req: Req,
    ) -> Result<Rep, ViewstampError> {
        if self.net.is_down(self.me) || self.net.is_down(peer) {
            return Err(ViewstampError::msg(format!(
                "{} -> {} unreachable",
                self.me, peer
            )));
        }
        let handler = self
            .net
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&peer).and_then(Weak::upgrade));
        match handler {
            // served in its own task so an abandoned call still completes at
            // the callee, as it would over TCP
            Some(handler) => {
                let me = self.me;
                tokio::spawn(async move { handler.handle(me, req).await })
                    .await?
            }
            None => Err(ViewstampError::msg(format!("no replica {}", peer))),
        }
    }
}
