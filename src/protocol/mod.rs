//! Replication protocol: Viewstamped Replication.
//!
//! A statically designated primary orders client requests, replicates them to
//! backups, and commits once a majority (itself included) holds them. Backups
//! that stop hearing from the primary elect a new one through the three-phase
//! view change; replicas restarting after a crash rebuild their state from
//! the current primary through nonce-protected recovery.

mod messages;
mod request;
mod backup;
mod viewchange;
mod recovery;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::utils::{ViewstampError, ReplicaMap};
use crate::server::{
    ReplicaId, Role, OpNum, OpRecord, OpLog, Request, RequestNum, Command,
    Response, ClientTable, StateMachine, RpcTransport, RpcHandler, ApiHandler,
    ApiReply, ApiError,
};
use crate::client::ClientId;

pub use messages::{
    Mode, PeerMsg, PeerReply, PrepareArgs, DoViewChangeArgs, StartViewArgs,
    PrimaryState, RecoveryResponse,
};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::{mpsc, watch, Mutex};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicaConfigVr {
    /// Backup declares the primary dead after this long without hearing
    /// from it.
    pub backup_timeout_ms: u64,

    /// Bound on one view change attempt before retrying with a higher view.
    pub viewchange_timeout_ms: u64,

    /// Bound on collecting recovery responses.
    pub recovery_timeout_ms: u64,

    /// Pause between failed recovery attempts.
    pub recovery_retry_ms: u64,

    /// Interval of the primary's commit heartbeats to idle backups.
    pub commit_interval_ms: u64,

    /// Capacity of the primary's client request queue.
    pub chan_req_cap: usize,

    /// Capacity of the backup's prepare queue.
    pub chan_prepare_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigVr {
    fn default() -> Self {
        ReplicaConfigVr {
            backup_timeout_ms: 5000,
            viewchange_timeout_ms: 10000,
            recovery_timeout_ms: 3000,
            recovery_retry_ms: 500,
            commit_interval_ms: 1000,
            chan_req_cap: 5,
            chan_prepare_cap: 5,
        }
    }
}

impl ReplicaConfigVr {
    /// Parses a config from an optional TOML string on top of the defaults.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, ViewstampError> {
        let config = parsed_config!(config_str => ReplicaConfigVr;
                                    backup_timeout_ms, viewchange_timeout_ms,
                                    recovery_timeout_ms, recovery_retry_ms,
                                    commit_interval_ms, chan_req_cap,
                                    chan_prepare_cap)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ViewstampError> {
        for (name, value) in [
            ("backup_timeout_ms", self.backup_timeout_ms),
            ("viewchange_timeout_ms", self.viewchange_timeout_ms),
            ("recovery_timeout_ms", self.recovery_timeout_ms),
            ("recovery_retry_ms", self.recovery_retry_ms),
            ("commit_interval_ms", self.commit_interval_ms),
            ("chan_req_cap", self.chan_req_cap as u64),
            ("chan_prepare_cap", self.chan_prepare_cap as u64),
        ] {
            if value == 0 {
                return Err(ViewstampError::msg(format!(
                    "invalid config {} = 0",
                    name
                )));
            }
        }
        if self.commit_interval_ms >= self.backup_timeout_ms {
            return Err(ViewstampError::msg(format!(
                "commit_interval_ms {} must be below backup_timeout_ms {}",
                self.commit_interval_ms, self.backup_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Replica state guarded by one lock. Never held across a peer call.
pub(crate) struct ReplicaCore {
    /// Current view; also the latest view accepted in normal mode, since it
    /// only changes when entering `Primary` or `Backup`.
    view: u64,

    /// Op number of the last log entry.
    op: OpNum,

    /// Highest op number known committed.
    commit: OpNum,

    /// Highest op number applied to the state machine.
    exec_upto: OpNum,

    mode: Mode,

    /// Bumped on every mode write, so the supervisor notices transitions
    /// that keep the mode but change the view.
    epoch: u64,

    log: OpLog,

    /// Bumped on every wholesale log replacement.
    log_gen: u64,

    table: ClientTable,
}

impl ReplicaCore {
    fn new(mode: Mode) -> Self {
        ReplicaCore {
            view: 0,
            op: 0,
            commit: 0,
            exec_upto: 0,
            mode,
            epoch: 0,
            log: OpLog::new(),
            log_gen: 0,
            table: ClientTable::new(),
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.epoch += 1;
    }

    /// Adopts a log wholesale together with the view and commit number that
    /// come with it.
    fn adopt_log(
        &mut self,
        log: Vec<OpRecord>,
        view: u64,
        commit: OpNum,
    ) -> Result<(), ViewstampError> {
        self.log.replace(log)?;
        self.log_gen += 1;
        self.op = self.log.last_op();
        self.view = view;
        self.commit = self.commit.max(commit).min(self.op);
        self.table.rebuild_from(self.log.records(), view);
        Ok(())
    }
}

/// State of one view change attempt.
pub(crate) struct Ballot {
    proposed: u64,
    svc_from: ReplicaMap,
    dvc_args: Vec<DoViewChangeArgs>,
    dvc_sent: bool,
}

impl Ballot {
    fn new(population: u8) -> Result<Self, ViewstampError> {
        Ok(Ballot {
            proposed: 0,
            svc_from: ReplicaMap::new(population, false)?,
            dvc_args: vec![],
            dvc_sent: false,
        })
    }

    /// Starts a fresh attempt advocating `view`.
    fn reset_to(&mut self, view: u64) {
        self.proposed = view;
        self.svc_from.clear();
        self.dvc_args.clear();
        self.dvc_sent = false;
    }
}

/// Nudges from protocol handlers to the mode supervisor.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Signal {
    /// Mode (or view) was changed by a handler.
    ModeChanged,

    /// A prepare or commit from the current primary arrived.
    HeardPrimary,
}

/// Snapshot of the replica's numbers, for observation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReplicaStatus {
    pub view: u64,
    pub op_num: OpNum,
    pub commit: OpNum,
    pub exec_upto: OpNum,
    pub mode: Mode,
}

/// Viewstamped Replication server replica module.
pub struct VrReplica {
    /// Replica ID in cluster.
    me: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Statically configured role, restored after recovery.
    role: Role,

    /// Configuration parameters struct.
    config: ReplicaConfigVr,

    core: Mutex<ReplicaCore>,

    /// Locked before `core` whenever both are needed.
    ballot: Mutex<Ballot>,

    /// Peer RPC transport.
    transport: Arc<dyn RpcTransport<PeerMsg, PeerReply>>,

    tx_signal: mpsc::UnboundedSender<Signal>,

    /// Taken by the supervisor.
    rx_signal: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,

    /// Entrance of the primary pipeline, present only while it runs.
    tx_req: Mutex<Option<mpsc::Sender<request::PendingRequest>>>,

    /// Entrance of the backup prepare handler; lives as long as the replica
    /// so prepares arriving mid-transition are queued, not lost.
    tx_prepare: mpsc::Sender<backup::PendingPrepare>,

    /// Taken by the backup prepare task while it runs.
    rx_prepare: Mutex<Option<mpsc::Receiver<backup::PendingPrepare>>>,

    /// StateMachine module; its lock also serializes execution.
    state_machine: Mutex<StateMachine>,
}

// VrReplica construction and observation
impl VrReplica {
    /// Creates a replica. It starts in `Recovery` if `recovering` is set
    /// (a crash marker was found), else in its configured role. Nothing runs
    /// until `run()` is called.
    pub fn new_and_setup(
        me: ReplicaId,
        population: u8,
        role: Role,
        recovering: bool,
        config: ReplicaConfigVr,
        transport: Arc<dyn RpcTransport<PeerMsg, PeerReply>>,
    ) -> Result<Arc<Self>, ViewstampError> {
        if population == 0 || me >= population {
            return logged_err!(
                me;
                "invalid replica ID {} in population {}",
                me,
                population
            );
        }
        config.validate()?;

        let mode = if recovering {
            Mode::Recovery
        } else {
            Self::role_mode(role)
        };
        let (tx_signal, rx_signal) = mpsc::unbounded_channel();
        let (tx_prepare, rx_prepare) = mpsc::channel(config.chan_prepare_cap);

        Ok(Arc::new(VrReplica {
            me,
            population,
            role,
            core: Mutex::new(ReplicaCore::new(mode)),
            ballot: Mutex::new(Ballot::new(population)?),
            transport,
            tx_signal,
            rx_signal: Mutex::new(Some(rx_signal)),
            tx_req: Mutex::new(None),
            tx_prepare,
            rx_prepare: Mutex::new(Some(rx_prepare)),
            state_machine: Mutex::new(StateMachine::new_and_setup(me)),
            config,
        }))
    }

    fn role_mode(role: Role) -> Mode {
        match role {
            Role::Primary => Mode::Primary,
            Role::Backup => Mode::Backup,
        }
    }

    #[inline]
    pub fn id(&self) -> ReplicaId {
        self.me
    }

    /// Current view, op, commit, and execution numbers plus mode.
    pub async fn status(&self) -> ReplicaStatus {
        let core = self.core.lock().await;
        ReplicaStatus {
            view: core.view,
            op_num: core.op,
            commit: core.commit,
            exec_upto: core.exec_upto,
            mode: core.mode,
        }
    }

    /// Copy of the operation log.
    pub async fn log_snapshot(&self) -> Vec<OpRecord> {
        self.core.lock().await.log.records().to_vec()
    }

    /// Client table entry of given client.
    pub async fn table_entry(&self, client: ClientId) -> Option<Response> {
        self.core.lock().await.table.get(client).cloned()
    }

    /// Number of acknowledgements needed beyond the acting replica.
    #[inline]
    fn subquorum(&self) -> u8 {
        self.population / 2
    }

    #[inline]
    fn primary_of(&self, view: u64) -> ReplicaId {
        (view % self.population as u64) as ReplicaId
    }

    fn peers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.population).filter(move |&p| p != self.me)
    }

    fn signal(&self, signal: Signal) {
        if self.tx_signal.send(signal).is_err() {
            pf_trace!(self.me; "supervisor gone, dropping {:?}", signal);
        }
    }

    /// Sends a message to every peer without waiting for replies.
    fn broadcast(&self, msg: PeerMsg) {
        for peer in self.peers() {
            let transport = self.transport.clone();
            let msg = msg.clone();
            let me = self.me;
            tokio::spawn(async move {
                if let Err(e) = transport.call(peer, msg).await {
                    pf_debug!(me; "call to {} failed: {}", peer, e);
                }
            });
        }
    }
}

// VrReplica mode supervisor
impl VrReplica {
    /// Runs the mode supervisor until `rx_term` fires: dispatches to the
    /// behavior of the current mode and switches when it reports a change.
    pub async fn run(
        self: Arc<Self>,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ViewstampError> {
        let mut rx_signal = match self.rx_signal.lock().await.take() {
            Some(rx_signal) => rx_signal,
            None => return logged_err!(self.me; "supervisor already running"),
        };
        pf_info!(self.me; "supervisor started, population {}", self.population);

        loop {
            let (mode, epoch, view) = {
                let core = self.core.lock().await;
                (core.mode, core.epoch, core.view)
            };
            pf_info!(self.me; "entering {:?} mode in view {}", mode, view);

            let next = match mode {
                Mode::Primary => {
                    self.run_primary(epoch, &mut rx_signal, &mut rx_term)
                        .await?
                }
                Mode::Backup => {
                    self.run_backup(epoch, &mut rx_signal, &mut rx_term)
                        .await?
                }
                Mode::ViewChangeInit => Some(self.start_view_change().await?),
                Mode::ViewChange => {
                    self.run_view_change(epoch, &mut rx_signal, &mut rx_term)
                        .await?
                }
                Mode::Recovery => self.run_recovery(&mut rx_term).await?,
            };

            match next {
                Some(next) => pf_debug!(self.me; "{:?} -> {:?}", mode, next),
                None => break,
            }
        }

        pf_info!(self.me; "supervisor terminated");
        Ok(())
    }

    /// Checks whether a handler moved the replica out of the behavior that
    /// started at `epoch`. Returns the new mode if so.
    async fn moved_on(&self, epoch: u64) -> Option<Mode> {
        let core = self.core.lock().await;
        if core.epoch != epoch {
            Some(core.mode)
        } else {
            None
        }
    }
}

// VrReplica state machine execution
impl VrReplica {
    /// Applies committed entries not yet executed, in op order, and records
    /// their results in the client table.
    pub(crate) async fn execute_committed(&self) -> Result<(), ViewstampError> {
        let mut state_machine = self.state_machine.lock().await;
        loop {
            let rec = {
                let core = self.core.lock().await;
                if core.exec_upto >= core.commit {
                    break;
                }
                match core.log.get(core.exec_upto + 1) {
                    Some(rec) => rec.clone(),
                    None => {
                        return logged_err!(
                            self.me;
                            "committed op {} missing from log",
                            core.exec_upto + 1
                        );
                    }
                }
            };

            let result = state_machine
                .do_sync_cmd(rec.op_num, rec.request.cmd.clone())
                .await?;
            pf_trace!(self.me; "executed op {} {:?}", rec.op_num, result);

            let mut core = self.core.lock().await;
            core.table.fill_result(
                rec.request.client,
                rec.request.req_num,
                result,
            );
            core.exec_upto = rec.op_num;
        }
        Ok(())
    }
}

#[async_trait]
impl RpcHandler<PeerMsg, PeerReply> for VrReplica {
    async fn handle(
        &self,
        from: ReplicaId,
        msg: PeerMsg,
    ) -> Result<PeerReply, ViewstampError> {
        match msg {
            PeerMsg::Prepare(args) => self.handle_prepare(args).await,
            PeerMsg::Commit { view, commit } => {
                self.handle_commit(view, commit).await
            }
            PeerMsg::StartViewChange { view, replica } => {
                if replica != from {
                    pf_warn!(self.me; "svc relayed by {} for {}", from, replica);
                }
                self.handle_start_view_change(view, replica).await
            }
            PeerMsg::DoViewChange(args) => {
                self.handle_do_view_change(args).await
            }
            PeerMsg::StartView(args) => self.handle_start_view(args).await,
            PeerMsg::Recovery { replica, nonce } => {
                self.handle_recovery(replica, nonce).await
            }
        }
    }
}

#[async_trait]
impl ApiHandler for VrReplica {
    async fn execute(
        &self,
        client: ClientId,
        req_num: RequestNum,
        cmd: Command,
    ) -> ApiReply {
        self.execute_request(Request {
            cmd,
            client,
            req_num,
        })
        .await
    }
}

/// Builds a reply carrying an error hint.
fn error_reply(view: u64, req_num: RequestNum, error: ApiError) -> ApiReply {
    ApiReply::Reply {
        view,
        req_num,
        result: None,
        error: Some(error),
    }
}

/// Builds a reply from a client table entry. The result is `None` while the
/// matching request is still in flight.
fn table_reply(view: u64, req_num: RequestNum, resp: &Response) -> ApiReply {
    ApiReply::Reply {
        view,
        req_num,
        result: if resp.req_num == req_num {
            resp.result.clone()
        } else {
            None
        },
        error: None,
    }
}
