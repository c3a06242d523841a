//! Viewstamped Replication -- client request entrance and primary pipeline.

use super::*;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Client request waiting in the primary's queue.
pub(crate) struct PendingRequest {
    request: Request,
    tx_done: oneshot::Sender<ApiReply>,
}

// VrReplica client request entrance
impl VrReplica {
    /// Answers a client request: redirects if not primary, answers
    /// duplicates from the client table, else runs it through the pipeline.
    pub(crate) async fn execute_request(&self, request: Request) -> ApiReply {
        let (client, req_num) = (request.client, request.req_num);
        let view = {
            let core = self.core.lock().await;
            match core.mode {
                Mode::Primary => {}
                Mode::Backup => {
                    return error_reply(core.view, req_num, ApiError::NotPrimary)
                }
                _ => {
                    return error_reply(core.view, req_num, ApiError::ViewChange)
                }
            }
            if let Some(resp) = core.table.get(client) {
                if resp.req_num >= req_num {
                    pf_debug!(self.me; "duplicate request {}#{}", client, req_num);
                    return table_reply(core.view, req_num, resp);
                }
            }
            core.view
        };

        match self.submit(request).await {
            Ok(rx_done) => rx_done.await.unwrap_or_else(|_| {
                error_reply(view, req_num, ApiError::ViewChange)
            }),
            Err(_) => error_reply(view, req_num, ApiError::ViewChange),
        }
    }

    /// Enqueues a request on the primary pipeline. The returned receiver gets
    /// the reply, or is dropped if the pipeline stops before committing it.
    pub async fn submit(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<ApiReply>, ViewstampError> {
        let tx_req = self
            .tx_req
            .lock()
            .await
            .clone()
            .ok_or(ViewstampError::UnderViewChange)?;
        let (tx_done, rx_done) = oneshot::channel();
        tx_req
            .send(PendingRequest { request, tx_done })
            .await
            .map_err(|_| ViewstampError::UnderViewChange)?;
        Ok(rx_done)
    }
}

// VrReplica primary mode behavior
impl VrReplica {
    /// Runs as primary until a handler moves the replica out of this epoch
    /// or termination. Idle backups get periodic commit heartbeats.
    pub(crate) async fn run_primary(
        self: &Arc<Self>,
        epoch: u64,
        rx_signal: &mut mpsc::UnboundedReceiver<Signal>,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<Option<Mode>, ViewstampError> {
        let (pipeline_handle, tx_cancel) = self.start_pipeline().await;
        let mut ticker =
            time::interval(Duration::from_millis(self.config.commit_interval_ms));

        let next = loop {
            tokio::select! {
                signal = rx_signal.recv() => match signal {
                    Some(Signal::ModeChanged) => {
                        if let Some(mode) = self.moved_on(epoch).await {
                            break Some(mode);
                        }
                    }
                    Some(Signal::HeardPrimary) => {}
                    None => break None,
                },

                _ = ticker.tick() => {
                    let core = self.core.lock().await;
                    let msg = PeerMsg::Commit { view: core.view, commit: core.commit };
                    drop(core);
                    self.broadcast(msg);
                },

                _ = rx_term.changed() => break None,
            }
        };

        self.stop_pipeline(pipeline_handle, tx_cancel).await?;
        Ok(next)
    }

    /// Opens the request queue and spawns the pipeline task. The returned
    /// sender cancels it.
    pub(crate) async fn start_pipeline(
        self: &Arc<Self>,
    ) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx_req, rx_req) = mpsc::channel(self.config.chan_req_cap);
        let (tx_cancel, rx_cancel) = watch::channel(false);
        *self.tx_req.lock().await = Some(tx_req);
        let handle = tokio::spawn(self.clone().pipeline_task(rx_req, rx_cancel));
        (handle, tx_cancel)
    }

    /// Closes the request queue, cancels the pipeline task, and waits for it
    /// to finish answering what was queued.
    pub(crate) async fn stop_pipeline(
        &self,
        handle: JoinHandle<()>,
        tx_cancel: watch::Sender<bool>,
    ) -> Result<(), ViewstampError> {
        self.tx_req.lock().await.take();
        let _ = tx_cancel.send(true);
        handle.await?;
        Ok(())
    }

    /// Pipeline task function: one request at a time, in queue order.
    async fn pipeline_task(
        self: Arc<Self>,
        mut rx_req: mpsc::Receiver<PendingRequest>,
        mut rx_cancel: watch::Receiver<bool>,
    ) {
        pf_debug!(self.me; "primary pipeline started");

        loop {
            tokio::select! {
                biased;

                _ = rx_cancel.changed() => break,

                pending = rx_req.recv() => {
                    let Some(PendingRequest { request, tx_done }) = pending else {
                        break;
                    };
                    let req_num = request.req_num;
                    match self.process_request(request, &mut rx_cancel).await {
                        Ok(reply) => {
                            let _ = tx_done.send(reply);
                        }
                        // abandoned; the client retries against the new primary
                        Err(ViewstampError::Cancelled)
                        | Err(ViewstampError::QuorumTimeout) => break,
                        Err(e) => {
                            pf_error!(self.me; "error processing request: {}", e);
                            let view = self.core.lock().await.view;
                            let _ = tx_done.send(
                                error_reply(view, req_num, ApiError::ViewChange)
                            );
                        }
                    }
                },
            }
        }

        // requests queued behind the last one are told to retry
        rx_req.close();
        let view = self.core.lock().await.view;
        while let Ok(PendingRequest { request, tx_done }) = rx_req.try_recv() {
            let _ = tx_done.send(error_reply(
                view,
                request.req_num,
                ApiError::ViewChange,
            ));
        }

        pf_debug!(self.me; "primary pipeline stopped");
    }

    /// Orders, replicates, commits, and executes one request. On cancellation
    /// the optimistic append is undone and `Cancelled` returned, or
    /// `QuorumTimeout` if every backup had already answered short of quorum.
    async fn process_request(
        &self,
        request: Request,
        rx_cancel: &mut watch::Receiver<bool>,
    ) -> Result<ApiReply, ViewstampError> {
        let (client, req_num) = (request.client, request.req_num);

        // assign op number, append, and mark the request in flight
        let (args, log_gen) = {
            let mut core = self.core.lock().await;
            if core.mode != Mode::Primary {
                return Err(ViewstampError::UnderViewChange);
            }
            if let Some(resp) = core.table.get(client) {
                if resp.req_num >= req_num {
                    return Ok(table_reply(core.view, req_num, resp));
                }
            }

            let op_num = core.op + 1;
            core.log.append(request.clone(), op_num)?;
            core.op = op_num;
            let view = core.view;
            core.table.set(
                client,
                Response {
                    view,
                    req_num,
                    result: None,
                },
            );
            let args = PrepareArgs {
                view,
                request,
                op_num,
                commit: core.commit,
            };
            (args, core.log_gen)
        };
        let (view, op_num) = (args.view, args.op_num);
        pf_trace!(self.me; "prepare op {} for {}#{}", op_num, client, req_num);

        // replicate to all backups concurrently
        let (tx_ok, mut rx_ok) = mpsc::unbounded_channel();
        for peer in self.peers() {
            let transport = self.transport.clone();
            let msg = PeerMsg::Prepare(args.clone());
            let tx_ok = tx_ok.clone();
            let me = self.me;
            tokio::spawn(async move {
                match transport.call(peer, msg).await {
                    Ok(PeerReply::PrepareOk {
                        view,
                        op_num,
                        replica,
                    }) => {
                        let _ = tx_ok.send((replica, view, op_num));
                    }
                    Ok(reply) => {
                        pf_warn!(me; "unexpected prepare reply from {}: {:?}", peer, reply);
                    }
                    Err(e) => {
                        pf_debug!(me; "prepare to {} failed: {}", peer, e);
                    }
                }
            });
        }
        drop(tx_ok);

        // wait for subquorum distinct acks of this exact (view, op)
        let mut acks = ReplicaMap::new(self.population, false)?;
        while acks.count() < self.subquorum() {
            tokio::select! {
                biased;

                _ = rx_cancel.changed() => {
                    self.undo_request(op_num, log_gen, client).await;
                    return Err(ViewstampError::Cancelled);
                },

                ok = rx_ok.recv() => match ok {
                    Some((replica, ok_view, ok_op)) => {
                        if ok_view == view && ok_op == op_num
                            && replica != self.me && replica < self.population
                        {
                            acks.set(replica, true)?;
                        } else {
                            pf_warn!(self.me; "ignoring prepare ok {:?} for op {}",
                                              (replica, ok_view, ok_op), op_num);
                        }
                    }
                    None => {
                        // all backups answered or failed; only stepping down
                        // unblocks this request
                        pf_warn!(self.me; "op {} short of quorum {:?}", op_num, acks);
                        let _ = rx_cancel.changed().await;
                        self.undo_request(op_num, log_gen, client).await;
                        return Err(ViewstampError::QuorumTimeout);
                    }
                },
            }
        }

        // commit and execute
        {
            let mut core = self.core.lock().await;
            if core.log_gen != log_gen {
                return Err(ViewstampError::UnderViewChange);
            }
            core.commit = core.commit.max(op_num);
        }
        self.execute_committed().await?;

        let core = self.core.lock().await;
        match core.table.get(client) {
            Some(resp) => Ok(table_reply(view, req_num, resp)),
            None => logged_err!(self.me; "client {} missing from table", client),
        }
    }

    /// Reverts the optimistic append of `op_num`, unless the log has been
    /// replaced or extended since.
    async fn undo_request(&self, op_num: OpNum, log_gen: u64, client: ClientId) {
        let mut core = self.core.lock().await;
        if core.log_gen != log_gen || core.log.last_op() != op_num {
            pf_warn!(self.me; "log changed since op {}, not undoing", op_num);
            return;
        }
        match core.log.undo_last() {
            Ok(_) => {
                core.op = core.log.last_op();
                core.table.undo(client);
                pf_info!(self.me; "undid op {} of client {}", op_num, client);
            }
            Err(e) => pf_error!(self.me; "error undoing op {}: {}", op_num, e),
        }
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::server::LocalNet;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_quorum_undone() -> Result<(), ViewstampError> {
        let net = LocalNet::<PeerMsg, PeerReply>::new();
        let primary = VrReplica::new_and_setup(
            0,
            3,
            Role::Primary,
            false,
            ReplicaConfigVr::default(),
            Arc::new(net.endpoint(0)),
        )?;
        net.set_down(1, true);
        net.set_down(2, true);

        let (tx_cancel, mut rx_cancel) = watch::channel(false);
        let stepper = tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            let _ = tx_cancel.send(true);
        });
        let request = Request {
            cmd: Command::Put {
                key: "q".into(),
                value: "1".into(),
            },
            client: 11,
            req_num: 1,
        };
        assert_eq!(
            primary.process_request(request, &mut rx_cancel).await.err(),
            Some(ViewstampError::QuorumTimeout)
        );
        stepper.await?;

        let status = primary.status().await;
        assert_eq!((status.op_num, status.commit), (0, 0));
        assert!(primary.log_snapshot().await.is_empty());
        assert_eq!(primary.table_entry(11).await, None);
        Ok(())
    }
}
