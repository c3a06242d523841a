//! Viewstamped Replication -- backup prepare handling.

use std::collections::BTreeMap;

use super::*;

use crate::utils::Timer;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Prepare waiting in the backup's queue.
pub(crate) struct PendingPrepare {
    args: PrepareArgs,
    tx_done: oneshot::Sender<Result<PeerReply, ViewstampError>>,
}

// VrReplica prepare entrance
impl VrReplica {
    /// Handler of Prepare message from the primary. Resolves to PrepareOk
    /// once the prepare has been appended in op order.
    pub(crate) async fn handle_prepare(
        &self,
        args: PrepareArgs,
    ) -> Result<PeerReply, ViewstampError> {
        {
            let core = self.core.lock().await;
            if core.mode == Mode::Recovery {
                return Err(ViewstampError::msg("recovering"));
            }
            if args.view < core.view {
                return Err(ViewstampError::StaleMessage);
            }
            if args.view > core.view {
                return Err(ViewstampError::msg(format!(
                    "prepare from future view {} (at {})",
                    args.view, core.view
                )));
            }
            if core.mode != Mode::Backup {
                return Err(ViewstampError::UnderViewChange);
            }
        }

        let (tx_done, rx_done) = oneshot::channel();
        self.tx_prepare
            .send(PendingPrepare { args, tx_done })
            .await
            .map_err(|_| ViewstampError::UnderViewChange)?;
        rx_done.await?
    }

    /// Handler of Commit heartbeat from the primary. A heartbeat committing
    /// past the end of my log does not count as hearing from the primary,
    /// so a backup stuck behind a gap eventually starts a view change.
    pub(crate) async fn handle_commit(
        &self,
        view: u64,
        commit: OpNum,
    ) -> Result<PeerReply, ViewstampError> {
        let caught_up = {
            let mut core = self.core.lock().await;
            if core.mode != Mode::Backup || view != core.view {
                pf_trace!(self.me; "ignoring commit {} of view {}", commit, view);
                return Ok(PeerReply::Ack);
            }
            core.commit = core.commit.max(commit.min(core.op));
            commit <= core.op
        };
        if caught_up {
            self.signal(Signal::HeardPrimary);
        } else {
            pf_debug!(self.me; "primary committed {} beyond my op", commit);
        }
        self.execute_committed().await?;
        Ok(PeerReply::Ack)
    }
}

// VrReplica backup mode behavior
impl VrReplica {
    /// Runs as backup until the view timer expires, a handler moves the
    /// replica out of this epoch, or termination.
    pub(crate) async fn run_backup(
        self: &Arc<Self>,
        epoch: u64,
        rx_signal: &mut mpsc::UnboundedReceiver<Signal>,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<Option<Mode>, ViewstampError> {
        let (backup_handle, tx_cancel) = self.start_backup_task().await?;
        let mut view_timer = Timer::new();
        view_timer
            .kickoff(Duration::from_millis(self.config.backup_timeout_ms))?;

        let next = loop {
            tokio::select! {
                signal = rx_signal.recv() => match signal {
                    Some(Signal::ModeChanged) => {
                        if let Some(mode) = self.moved_on(epoch).await {
                            break Some(mode);
                        }
                    }
                    Some(Signal::HeardPrimary) => {
                        if let Err(e) = view_timer.rekick() {
                            pf_error!(self.me; "error rekicking view timer: {}", e);
                        }
                    }
                    None => break None,
                },

                _ = view_timer.timeout() => {
                    let mut core = self.core.lock().await;
                    if core.epoch == epoch {
                        pf_warn!(self.me; "no word from primary {} in {} ms",
                                          self.primary_of(core.view),
                                          self.config.backup_timeout_ms);
                        core.set_mode(Mode::ViewChangeInit);
                    }
                    break Some(core.mode);
                },

                _ = rx_term.changed() => break None,
            }
        };

        self.stop_backup_task(backup_handle, tx_cancel).await?;
        Ok(next)
    }

    async fn start_backup_task(
        self: &Arc<Self>,
    ) -> Result<
        (JoinHandle<mpsc::Receiver<PendingPrepare>>, watch::Sender<bool>),
        ViewstampError,
    > {
        let rx_prepare = match self.rx_prepare.lock().await.take() {
            Some(rx_prepare) => rx_prepare,
            None => return logged_err!(self.me; "prepare queue already taken"),
        };
        let (tx_cancel, rx_cancel) = watch::channel(false);
        let handle =
            tokio::spawn(self.clone().backup_task(rx_prepare, rx_cancel));
        Ok((handle, tx_cancel))
    }

    async fn stop_backup_task(
        &self,
        handle: JoinHandle<mpsc::Receiver<PendingPrepare>>,
        tx_cancel: watch::Sender<bool>,
    ) -> Result<(), ViewstampError> {
        let _ = tx_cancel.send(true);
        let rx_prepare = handle.await?;
        *self.rx_prepare.lock().await = Some(rx_prepare);
        Ok(())
    }

    /// Backup prepare task function: appends prepares strictly in op order.
    /// A prepare that arrives ahead of a gap is parked until the gap fills.
    /// Hands the queue back on exit.
    async fn backup_task(
        self: Arc<Self>,
        mut rx_prepare: mpsc::Receiver<PendingPrepare>,
        mut rx_cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<PendingPrepare> {
        pf_debug!(self.me; "backup prepare task started");
        let mut parked: BTreeMap<OpNum, PendingPrepare> = BTreeMap::new();

        loop {
            tokio::select! {
                biased;

                _ = rx_cancel.changed() => break,

                pending = rx_prepare.recv() => {
                    let Some(pending) = pending else { break };
                    self.accept_prepare(pending, &mut parked).await;
                },
            }
        }

        // everything not yet appended is refused
        for (_, pending) in parked {
            let _ = pending.tx_done.send(Err(ViewstampError::UnderViewChange));
        }
        while let Ok(pending) = rx_prepare.try_recv() {
            let _ = pending.tx_done.send(Err(ViewstampError::UnderViewChange));
        }

        pf_debug!(self.me; "backup prepare task stopped");
        rx_prepare
    }

    /// Applies a prepare if it is next in line (or already present), else
    /// parks it, refusing it once `chan_prepare_cap` prepares are parked.
    /// Then applies any parked prepares that became next in line.
    async fn accept_prepare(
        &self,
        pending: PendingPrepare,
        parked: &mut BTreeMap<OpNum, PendingPrepare>,
    ) {
        let last_op = self.core.lock().await.log.last_op();
        if pending.args.op_num > last_op + 1 {
            let op_num = pending.args.op_num;
            if parked.len() >= self.config.chan_prepare_cap
                && !parked.contains_key(&op_num)
            {
                pf_warn!(self.me; "gap before op {} (last {}), parking full",
                                  op_num, last_op);
                let _ = pending.tx_done.send(Err(ViewstampError::msg(format!(
                    "op {} beyond gap after {} refused",
                    op_num, last_op
                ))));
                return;
            }
            pf_debug!(self.me; "gap before op {} (last {}), parking",
                               op_num, last_op);
            if let Some(older) = parked.insert(op_num, pending) {
                let _ = older.tx_done.send(Err(ViewstampError::StaleMessage));
            }
            return;
        }
        let reply = self.apply_prepare(&pending.args).await;
        let _ = pending.tx_done.send(reply);

        loop {
            let last_op = self.core.lock().await.log.last_op();
            match parked.first_key_value() {
                Some((&op_num, _)) if op_num <= last_op + 1 => {
                    if let Some((_, pending)) = parked.pop_first() {
                        let reply = self.apply_prepare(&pending.args).await;
                        let _ = pending.tx_done.send(reply);
                    }
                }
                _ => break,
            }
        }
    }

    /// Appends one prepare that is next in line, follows the primary's commit
    /// number, and executes what became committed. A prepare already in the
    /// log is acknowledged again without appending. Only an acknowledged
    /// prepare re-arms the view timer.
    async fn apply_prepare(
        &self,
        args: &PrepareArgs,
    ) -> Result<PeerReply, ViewstampError> {
        let reply = {
            let mut core = self.core.lock().await;
            if core.mode != Mode::Backup {
                return Err(ViewstampError::UnderViewChange);
            }
            if args.view != core.view {
                return Err(ViewstampError::StaleMessage);
            }

            let last_op = core.log.last_op();
            if args.op_num <= last_op {
                pf_trace!(self.me; "op {} already in log", args.op_num);
            } else if args.op_num == last_op + 1 {
                core.log.append(args.request.clone(), args.op_num)?;
                core.op = args.op_num;
                let (client, req_num) = (args.request.client, args.request.req_num);
                if !core.table.is_duplicate(client, req_num) {
                    let view = core.view;
                    core.table.set(
                        client,
                        Response {
                            view,
                            req_num,
                            result: None,
                        },
                    );
                }
            } else {
                return logged_err!(self.me; "op {} applied across a gap", args.op_num);
            }
            core.commit = core.commit.max(args.commit.min(core.op));

            PeerReply::PrepareOk {
                view: core.view,
                op_num: args.op_num,
                replica: self.me,
            }
        };

        self.signal(Signal::HeardPrimary);
        if let Err(e) = self.execute_committed().await {
            pf_error!(self.me; "error executing committed ops: {}", e);
        }
        Ok(reply)
    }
}
