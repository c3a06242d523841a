//! Viewstamped Replication -- view change.

use super::*;

use crate::utils::Timer;

use tokio::task::JoinSet;
use tokio::time::{self, Duration};

/// Picks the log to install from collected DoViewChange messages: largest
/// latest normal view, ties broken by largest op number. Returns its index.
pub(crate) fn select_log(dvcs: &[DoViewChangeArgs]) -> Option<usize> {
    dvcs.iter()
        .enumerate()
        .max_by_key(|(_, dvc)| (dvc.latest_normal_view, dvc.op_num))
        .map(|(idx, _)| idx)
}

// VrReplica view change mode behaviors
impl VrReplica {
    /// ViewChangeInit behavior: proposes the view after the last one
    /// attempted and broadcasts StartViewChange.
    pub(crate) async fn start_view_change(&self) -> Result<Mode, ViewstampError> {
        let (proposed, dvc) = {
            let mut ballot = self.ballot.lock().await;
            let mut core = self.core.lock().await;
            if core.mode != Mode::ViewChangeInit {
                // a peer's proposal got adopted in between
                return Ok(core.mode);
            }
            let proposed = ballot.proposed.max(core.view) + 1;
            ballot.reset_to(proposed);
            core.set_mode(Mode::ViewChange);
            (proposed, self.dvc_if_ready(&mut ballot, &core))
        };

        pf_info!(self.me; "proposing view {}", proposed);
        self.broadcast(PeerMsg::StartViewChange {
            view: proposed,
            replica: self.me,
        });
        if let Some(dvc) = dvc {
            self.send_do_view_change(dvc).await;
        }
        Ok(Mode::ViewChange)
    }

    /// ViewChange behavior: waits for the attempt to complete. On timeout,
    /// goes back to ViewChangeInit to retry with a higher view.
    pub(crate) async fn run_view_change(
        self: &Arc<Self>,
        epoch: u64,
        rx_signal: &mut mpsc::UnboundedReceiver<Signal>,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<Option<Mode>, ViewstampError> {
        let mut vc_timer = Timer::new();
        vc_timer.kickoff(Duration::from_millis(self.config.viewchange_timeout_ms))?;

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

                _ = vc_timer.timeout() => {
                    let mut ballot = self.ballot.lock().await;
                    let mut core = self.core.lock().await;
                    if core.epoch == epoch {
                        pf_warn!(self.me; "view change to {} timed out", ballot.proposed);
                        let proposed = ballot.proposed;
                        ballot.reset_to(proposed);
                        core.set_mode(Mode::ViewChangeInit);
                    }
                    break Some(core.mode);
                },

                _ = rx_term.changed() => break None,
            }
        };

        Ok(next)
    }
}

// VrReplica view change message handlers
impl VrReplica {
    /// Marks the DoViewChange of the current attempt as sent and builds it,
    /// if enough StartViewChange messages have been collected.
    fn dvc_if_ready(
        &self,
        ballot: &mut Ballot,
        core: &ReplicaCore,
    ) -> Option<DoViewChangeArgs> {
        if ballot.dvc_sent || ballot.svc_from.count() < self.subquorum() {
            return None;
        }
        ballot.dvc_sent = true;
        Some(DoViewChangeArgs {
            view: ballot.proposed,
            log: core.log.records().to_vec(),
            latest_normal_view: core.view,
            op_num: core.op,
            commit: core.commit,
            replica: self.me,
        })
    }

    /// Delivers DoViewChange to the primary of its view; handled in place if
    /// that is myself.
    async fn send_do_view_change(&self, dvc: DoViewChangeArgs) {
        let target = self.primary_of(dvc.view);
        pf_debug!(self.me; "sending DoViewChange for view {} to {}", dvc.view, target);
        if target == self.me {
            if let Err(e) = self.handle_do_view_change(dvc).await {
                pf_error!(self.me; "error handling own DoViewChange: {}", e);
            }
        } else {
            let transport = self.transport.clone();
            let me = self.me;
            tokio::spawn(async move {
                if let Err(e) =
                    transport.call(target, PeerMsg::DoViewChange(dvc)).await
                {
                    pf_warn!(me; "DoViewChange to {} failed: {}", target, e);
                }
            });
        }
    }

    /// Handler of StartViewChange message.
    pub(crate) async fn handle_start_view_change(
        &self,
        view: u64,
        from: ReplicaId,
    ) -> Result<PeerReply, ViewstampError> {
        let (adopted, dvc) = {
            let mut ballot = self.ballot.lock().await;
            let mut core = self.core.lock().await;
            if core.mode == Mode::Recovery
                || view <= core.view
                || view < ballot.proposed
            {
                pf_trace!(self.me; "ignoring StartViewChange {} from {}", view, from);
                return Ok(PeerReply::Ack);
            }

            let adopted = view > ballot.proposed;
            if adopted {
                ballot.reset_to(view);
                core.set_mode(Mode::ViewChange);
            }
            if from != self.me {
                ballot.svc_from.set(from, true)?;
            }
            (adopted, self.dvc_if_ready(&mut ballot, &core))
        };

        if adopted {
            pf_info!(self.me; "joining view change to {} started by {}", view, from);
            self.signal(Signal::ModeChanged);
            self.broadcast(PeerMsg::StartViewChange {
                view,
                replica: self.me,
            });
        }
        if let Some(dvc) = dvc {
            self.send_do_view_change(dvc).await;
        }
        Ok(PeerReply::Ack)
    }

    /// Handler of DoViewChange message. Once subquorum + 1 distinct senders
    /// are collected, installs the most up-to-date log and becomes primary.
    pub(crate) async fn handle_do_view_change(
        &self,
        args: DoViewChangeArgs,
    ) -> Result<PeerReply, ViewstampError> {
        let view = args.view;
        if self.primary_of(view) != self.me {
            return Err(ViewstampError::msg(format!(
                "DoViewChange for view {} sent to non-primary {}",
                view, self.me
            )));
        }

        let (adopted, installed) = {
            let mut ballot = self.ballot.lock().await;
            let mut core = self.core.lock().await;
            if core.mode == Mode::Recovery
                || view <= core.view
                || view < ballot.proposed
            {
                pf_trace!(self.me; "ignoring DoViewChange {} from {}", view, args.replica);
                return Ok(PeerReply::Ack);
            }

            let adopted = view > ballot.proposed;
            if adopted {
                ballot.reset_to(view);
                core.set_mode(Mode::ViewChange);
            }

            let installed = if ballot
                .dvc_args
                .iter()
                .any(|dvc| dvc.replica == args.replica)
            {
                pf_debug!(self.me; "duplicate DoViewChange from {}", args.replica);
                Ok(None)
            } else {
                ballot.dvc_args.push(args);
                if ballot.dvc_args.len() > self.subquorum() as usize {
                    let dvcs = std::mem::take(&mut ballot.dvc_args);
                    let installed = self.install_view(&mut core, dvcs);
                    if installed.is_ok() {
                        ballot.reset_to(view);
                    }
                    installed.map(|start_view| Some((start_view, core.log_gen)))
                } else {
                    Ok(None)
                }
            };
            (adopted, installed)
        };

        if adopted {
            self.signal(Signal::ModeChanged);
            self.broadcast(PeerMsg::StartViewChange {
                view,
                replica: self.me,
            });
        }

        let (start_view, log_gen) = match installed {
            Ok(Some(installed)) => installed,
            Ok(None) => return Ok(PeerReply::Ack),
            Err(e) => {
                pf_error!(self.me; "failed to install view {}: {}", view, e);
                return Err(e);
            }
        };
        pf_info!(self.me; "became primary of view {} with op {} commit {}",
                          view, start_view.op_num, start_view.commit);

        let op_num = start_view.op_num;
        let adopters = self.send_start_view(start_view).await?;
        if adopters >= self.subquorum() {
            self.commit_adopted_log(view, op_num, log_gen).await;
        } else {
            pf_warn!(self.me; "only {} peers took view {}, ops past commit stay pending",
                              adopters, view);
        }
        self.signal(Signal::ModeChanged);
        self.execute_committed().await?;
        Ok(PeerReply::Ack)
    }

    /// Commits the whole log installed for `view` once a subquorum of peers
    /// has adopted it, unless the log was replaced since.
    async fn commit_adopted_log(&self, view: u64, op_num: OpNum, log_gen: u64) {
        let mut core = self.core.lock().await;
        if core.mode != Mode::Primary || core.view != view || core.log_gen != log_gen {
            pf_debug!(self.me; "view {} log moved on, not committing op {}", view, op_num);
            return;
        }
        if op_num > core.commit {
            pf_info!(self.me; "committing adopted ops {}..={}", core.commit + 1, op_num);
            core.commit = op_num.min(core.op);
        }
    }

    /// Reconciles collected DoViewChange messages into my state and switches
    /// to primary. Leaves state untouched on error.
    pub(crate) fn install_view(
        &self,
        core: &mut ReplicaCore,
        mut dvcs: Vec<DoViewChangeArgs>,
    ) -> Result<StartViewArgs, ViewstampError> {
        let view = match dvcs.first() {
            Some(dvc) => dvc.view,
            None => return logged_err!(self.me; "no DoViewChange collected"),
        };
        if dvcs.iter().any(|dvc| dvc.view != view) {
            let views: Vec<u64> = dvcs.iter().map(|dvc| dvc.view).collect();
            pf_error!(self.me; "DoViewChange views disagree: {:?}", views);
            return Err(ViewstampError::ViewMismatch);
        }

        let commit = dvcs.iter().map(|dvc| dvc.commit).max().unwrap_or(0);
        let best = match select_log(&dvcs) {
            Some(best) => best,
            None => return logged_err!(self.me; "no log to select"),
        };
        let chosen = dvcs.swap_remove(best);
        pf_debug!(self.me; "adopting log of {} (normal view {}, op {})",
                           chosen.replica, chosen.latest_normal_view, chosen.op_num);

        core.adopt_log(chosen.log, view, commit)?;
        core.set_mode(Mode::Primary);
        Ok(StartViewArgs {
            view,
            log: core.log.records().to_vec(),
            op_num: core.op,
            commit: core.commit,
        })
    }

    /// Sends StartView to every peer and waits (bounded) until each has
    /// answered or failed, so backups know the new view before the first
    /// prepare of it. Returns the number of peers that adopted the log.
    async fn send_start_view(
        &self,
        start_view: StartViewArgs,
    ) -> Result<u8, ViewstampError> {
        let (view, op_num) = (start_view.view, start_view.op_num);
        let mut adopters = ReplicaMap::new(self.population, false)?;
        let mut calls = JoinSet::new();
        for peer in self.peers() {
            let transport = self.transport.clone();
            let msg = PeerMsg::StartView(start_view.clone());
            calls.spawn(async move { (peer, transport.call(peer, msg).await) });
        }

        let wait_all = async {
            while let Some(joined) = calls.join_next().await {
                match joined {
                    Ok((peer, Ok(PeerReply::PrepareOk { view: v, op_num: o, .. })))
                        if v == view && o == op_num =>
                    {
                        if let Err(e) = adopters.set(peer, true) {
                            pf_error!(self.me; "error marking adopter {}: {}", peer, e);
                        }
                    }
                    Ok((peer, Ok(reply))) => {
                        pf_debug!(self.me; "StartView to {} answered {:?}", peer, reply);
                    }
                    Ok((peer, Err(e))) => {
                        pf_debug!(self.me; "StartView to {} failed: {}", peer, e);
                    }
                    Err(e) => pf_error!(self.me; "StartView task error: {}", e),
                }
            }
        };
        let bound = Duration::from_millis(self.config.backup_timeout_ms);
        if time::timeout(bound, wait_all).await.is_err() {
            pf_warn!(self.me; "StartView not answered by all peers in time");
        }
        Ok(adopters.count())
    }

    /// Handler of StartView message: adopts the new primary's state and
    /// becomes backup. Answers with a PrepareOk covering the whole adopted
    /// log.
    pub(crate) async fn handle_start_view(
        &self,
        args: StartViewArgs,
    ) -> Result<PeerReply, ViewstampError> {
        let reply = {
            let mut ballot = self.ballot.lock().await;
            let mut core = self.core.lock().await;
            if core.mode == Mode::Recovery || args.view <= core.view {
                pf_trace!(self.me; "ignoring StartView {}", args.view);
                return Ok(PeerReply::Ack);
            }

            let (view, op_num) = (args.view, args.op_num);
            core.adopt_log(args.log, view, args.commit)?;
            if core.op != op_num {
                pf_warn!(self.me; "StartView op {} but log ends at {}", op_num, core.op);
            }
            core.set_mode(Mode::Backup);
            ballot.reset_to(view);
            pf_info!(self.me; "entering view {} as backup of {}",
                              view, self.primary_of(view));
            PeerReply::PrepareOk {
                view,
                op_num: core.op,
                replica: self.me,
            }
        };

        self.signal(Signal::ModeChanged);
        self.execute_committed().await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod viewchange_tests {
    use super::*;
    use crate::server::{Command, LocalNet};

    fn dvc(
        replica: ReplicaId,
        view: u64,
        latest_normal_view: u64,
        op_num: OpNum,
    ) -> DoViewChangeArgs {
        let log = (1..=op_num)
            .map(|op| OpRecord {
                request: Request {
                    cmd: Command::Put {
                        key: format!("k{}", op),
                        value: format!("r{}", replica),
                    },
                    client: replica as u64,
                    req_num: op,
                },
                op_num: op,
            })
            .collect();
        DoViewChangeArgs {
            view,
            log,
            latest_normal_view,
            op_num,
            commit: op_num.saturating_sub(1),
            replica,
        }
    }

    #[test]
    fn select_log_tie_break() {
        let dvcs = vec![dvc(0, 6, 2, 9), dvc(1, 6, 5, 4), dvc(2, 6, 5, 7)];
        assert_eq!(select_log(&dvcs), Some(2));
        let dvcs = vec![dvc(2, 6, 5, 7), dvc(1, 6, 5, 4), dvc(0, 6, 2, 9)];
        assert_eq!(select_log(&dvcs), Some(0));
        assert_eq!(select_log(&[]), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_picks_best_log() -> Result<(), ViewstampError> {
        let net = LocalNet::<PeerMsg, PeerReply>::new();
        let replica = VrReplica::new_and_setup(
            1,
            3,
            Role::Backup,
            false,
            ReplicaConfigVr::default(),
            Arc::new(net.endpoint(1)),
        )?;
        let mut core = replica.core.lock().await;
        let start_view = replica.install_view(
            &mut core,
            vec![dvc(1, 4, 2, 9), dvc(0, 4, 3, 5), dvc(2, 4, 3, 6)],
        )?;
        assert_eq!(start_view.view, 4);
        assert_eq!(start_view.op_num, 6);
        assert_eq!(start_view.commit, 6); // max commit 8, bounded by op
        assert_eq!(core.mode, Mode::Primary);
        assert_eq!(core.view, 4);
        assert_eq!(core.log.last_op(), 6);
        assert_eq!(core.log.records(), &dvc(2, 4, 3, 6).log[..]);
        assert!(core.table.get(2).is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_rejects_view_mismatch() -> Result<(), ViewstampError> {
        let net = LocalNet::<PeerMsg, PeerReply>::new();
        let replica = VrReplica::new_and_setup(
            1,
            3,
            Role::Backup,
            false,
            ReplicaConfigVr::default(),
            Arc::new(net.endpoint(1)),
        )?;
        let mut core = replica.core.lock().await;
        assert_eq!(
            replica
                .install_view(&mut core, vec![dvc(1, 4, 0, 2), dvc(2, 7, 0, 3)])
                .err(),
            Some(ViewstampError::ViewMismatch)
        );
        assert_eq!(core.mode, Mode::Backup);
        assert_eq!(core.view, 0);
        assert!(core.log.is_empty());
        Ok(())
    }
}
