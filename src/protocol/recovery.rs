//! Viewstamped Replication -- crash recovery.

use super::*;

use tokio::time::{self, Duration};

/// Checks a set of recovery responses against the nonce sent out and picks
/// the primary's state. Every response must echo the nonce, and exactly one
/// must come from a primary carrying its state.
pub(crate) fn validate_recovery(
    responses: &[RecoveryResponse],
    nonce: u64,
) -> Result<(u64, PrimaryState), ViewstampError> {
    if responses.iter().any(|resp| resp.nonce != nonce) {
        return Err(ViewstampError::NonceMismatch);
    }

    let mut primaries = responses.iter().filter(|resp| resp.mode == Mode::Primary);
    match (primaries.next(), primaries.next()) {
        (Some(primary), None) => match &primary.primary_state {
            Some(state) => Ok((primary.view, state.clone())),
            None => Err(ViewstampError::NoPrimaryFound),
        },
        _ => Err(ViewstampError::NoPrimaryFound),
    }
}

// VrReplica recovery mode behavior
impl VrReplica {
    /// Recovery behavior: keeps attempting recovery until one succeeds or
    /// termination. Returns the mode entered after recovering.
    pub(crate) async fn run_recovery(
        &self,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<Option<Mode>, ViewstampError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            tokio::select! {
                result = self.perform_recovery() => match result {
                    Ok(mode) => {
                        pf_info!(self.me; "recovered after {} attempt(s)", attempt);
                        return Ok(Some(mode));
                    }
                    Err(e) => {
                        pf_warn!(self.me; "recovery attempt {} failed: {}", attempt, e);
                    }
                },
                _ = rx_term.changed() => return Ok(None),
            }

            tokio::select! {
                _ = time::sleep(Duration::from_millis(self.config.recovery_retry_ms)) => {},
                _ = rx_term.changed() => return Ok(None),
            }
        }
    }

    /// One recovery attempt: asks all peers with a fresh nonce, waits for the
    /// primary plus a subquorum of others, then adopts the primary's state.
    async fn perform_recovery(&self) -> Result<Mode, ViewstampError> {
        let nonce: u64 = rand::random();
        pf_debug!(self.me; "starting recovery with nonce {}", nonce);

        let (tx_resp, mut rx_resp) = mpsc::unbounded_channel();
        for peer in self.peers() {
            let transport = self.transport.clone();
            let tx_resp = tx_resp.clone();
            let me = self.me;
            tokio::spawn(async move {
                match transport
                    .call(peer, PeerMsg::Recovery { replica: me, nonce })
                    .await
                {
                    Ok(PeerReply::Recovery(resp)) => {
                        let _ = tx_resp.send(resp);
                    }
                    Ok(reply) => {
                        pf_warn!(me; "unexpected recovery reply from {}: {:?}", peer, reply);
                    }
                    Err(e) => pf_debug!(me; "recovery to {} failed: {}", peer, e),
                }
            });
        }
        drop(tx_resp);

        let mut responses: Vec<RecoveryResponse> = vec![];
        let deadline =
            time::sleep(Duration::from_millis(self.config.recovery_timeout_ms));
        tokio::pin!(deadline);
        while !self.recovery_quorum(&responses) {
            tokio::select! {
                resp = rx_resp.recv() => match resp {
                    Some(resp) => {
                        if responses.iter().all(|r| r.replica != resp.replica) {
                            responses.push(resp);
                        }
                    }
                    None => return Err(ViewstampError::RecoveryTimeout),
                },
                _ = &mut deadline => return Err(ViewstampError::RecoveryTimeout),
            }
        }

        let (view, state) = validate_recovery(&responses, nonce)?;
        let mode = {
            let mut ballot = self.ballot.lock().await;
            let mut core = self.core.lock().await;
            if core.mode != Mode::Recovery {
                return logged_err!(self.me; "left recovery mode mid-attempt");
            }
            core.adopt_log(state.log, view, state.commit)?;
            let mode = if self.role == Role::Primary && self.primary_of(view) == self.me {
                Mode::Primary
            } else {
                Mode::Backup
            };
            core.set_mode(mode);
            ballot.reset_to(view);
            pf_info!(self.me; "adopted view {} op {} commit {} from primary",
                              view, core.op, core.commit);
            mode
        };

        self.execute_committed().await?;
        Ok(mode)
    }

    /// True once responses hold a primary and a subquorum of non-primaries.
    fn recovery_quorum(&self, responses: &[RecoveryResponse]) -> bool {
        let primaries = responses
            .iter()
            .filter(|resp| resp.mode == Mode::Primary)
            .count();
        primaries >= 1
            && responses.len() - primaries >= self.subquorum() as usize
    }
}

// VrReplica recovery message handler
impl VrReplica {
    /// Handler of Recovery message. Only replicas in normal mode answer; the
    /// primary includes its log and commit number.
    pub(crate) async fn handle_recovery(
        &self,
        from: ReplicaId,
        nonce: u64,
    ) -> Result<PeerReply, ViewstampError> {
        let core = self.core.lock().await;
        if !core.mode.is_normal() {
            pf_debug!(self.me; "not answering recovery of {} in {:?}", from, core.mode);
            return Err(ViewstampError::UnderViewChange);
        }

        let primary_state = if core.mode == Mode::Primary {
            Some(PrimaryState {
                log: core.log.records().to_vec(),
                op_num: core.op,
                commit: core.commit,
            })
        } else {
            None
        };
        pf_info!(self.me; "answering recovery of {} at view {}", from, core.view);
        Ok(PeerReply::Recovery(RecoveryResponse {
            view: core.view,
            nonce,
            replica: self.me,
            mode: core.mode,
            primary_state,
        }))
    }
}
