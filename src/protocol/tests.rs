//! Whole-cluster tests over the in-process transport.

use std::future::Future;
use std::sync::{Mutex as StdMutex, Weak};

use super::*;

use crate::server::{CommandResult, LocalNet};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

type Net = Arc<LocalNet<PeerMsg, PeerReply>>;

fn fast_config() -> ReplicaConfigVr {
    ReplicaConfigVr {
        backup_timeout_ms: 300,
        viewchange_timeout_ms: 1000,
        recovery_timeout_ms: 300,
        recovery_retry_ms: 100,
        commit_interval_ms: 50,
        chan_req_cap: 5,
        chan_prepare_cap: 5,
    }
}

/// Replica whose supervisor can be stopped individually.
struct Running {
    replica: Arc<VrReplica>,
    tx_term: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ViewstampError>>,
}

impl Running {
    async fn stop(self) -> Result<Arc<VrReplica>, ViewstampError> {
        let _ = self.tx_term.send(true);
        self.handle.await??;
        Ok(self.replica)
    }
}

fn register(net: &Net, id: ReplicaId, handler: Weak<dyn RpcHandler<PeerMsg, PeerReply>>) {
    net.register(id, handler);
}

fn launch(
    net: &Net,
    me: ReplicaId,
    population: u8,
    recovering: bool,
    config: ReplicaConfigVr,
) -> Result<Running, ViewstampError> {
    let role = if me == 0 { Role::Primary } else { Role::Backup };
    launch_as(net, me, role, population, recovering, config)
}

fn launch_as(
    net: &Net,
    me: ReplicaId,
    role: Role,
    population: u8,
    recovering: bool,
    config: ReplicaConfigVr,
) -> Result<Running, ViewstampError> {
    let replica = VrReplica::new_and_setup(
        me,
        population,
        role,
        recovering,
        config,
        Arc::new(net.endpoint(me)),
    )?;
    let weak: Weak<VrReplica> = Arc::downgrade(&replica);
    register(net, me, weak);
    let (tx_term, rx_term) = watch::channel(false);
    let handle = tokio::spawn(replica.clone().run(rx_term));
    Ok(Running {
        replica,
        tx_term,
        handle,
    })
}

fn launch_cluster(
    net: &Net,
    population: u8,
    config: &ReplicaConfigVr,
) -> Result<Vec<Running>, ViewstampError> {
    (0..population)
        .map(|id| launch(net, id, population, false, config.clone()))
        .collect()
}

/// Polls `cond` until it holds or `timeout_ms` passes.
async fn wait_until<F, Fut>(timeout_ms: u64, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    cond().await
}

async fn reached(replica: &Arc<VrReplica>, timeout_ms: u64, f: fn(ReplicaStatus) -> bool) -> bool {
    wait_until(timeout_ms, || {
        let replica = replica.clone();
        async move { f(replica.status().await) }
    })
    .await
}

fn put(key: &str, value: &str) -> Command {
    Command::Put {
        key: key.into(),
        value: value.into(),
    }
}

fn get(key: &str) -> Command {
    Command::Get { key: key.into() }
}

/// Executes through `replica`, resending while it answers with a hint (its
/// pipeline may open just after it became primary).
async fn execute_settled(
    replica: &Arc<VrReplica>,
    client: ClientId,
    req_num: RequestNum,
    cmd: Command,
) -> ApiReply {
    let mut reply = replica.execute(client, req_num, cmd.clone()).await;
    for _ in 0..50 {
        if error_of(&reply).is_none() {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
        reply = replica.execute(client, req_num, cmd.clone()).await;
    }
    reply
}

fn result_of(reply: &ApiReply) -> Option<&CommandResult> {
    match reply {
        ApiReply::Reply { result, .. } => result.as_ref(),
        ApiReply::Leave => None,
    }
}

fn error_of(reply: &ApiReply) -> Option<ApiError> {
    match reply {
        ApiReply::Reply { error, .. } => *error,
        ApiReply::Leave => None,
    }
}

fn prepare(op_num: OpNum) -> PrepareArgs {
    PrepareArgs {
        view: 0,
        request: Request {
            cmd: put(&format!("p{}", op_num), "v"),
            client: 20,
            req_num: op_num,
        },
        op_num,
        commit: 0,
    }
}

fn do_view_change(view: u64, replica: ReplicaId, ops: OpNum) -> DoViewChangeArgs {
    let log = (1..=ops)
        .map(|op_num| OpRecord {
            request: Request {
                cmd: put("d", &op_num.to_string()),
                client: 30,
                req_num: op_num,
            },
            op_num,
        })
        .collect();
    DoViewChangeArgs {
        view,
        log,
        latest_normal_view: 0,
        op_num: ops,
        commit: 0,
        replica,
    }
}

/// Handler that records every message and acknowledges it.
struct Spy {
    seen: StdMutex<Vec<(ReplicaId, PeerMsg)>>,
}

impl Spy {
    fn new() -> Arc<Self> {
        Arc::new(Spy {
            seen: StdMutex::new(vec![]),
        })
    }

    fn saw(&self, from: ReplicaId, msg: &PeerMsg) -> bool {
        self.seen
            .lock()
            .map_or(false, |seen| seen.iter().any(|(f, m)| *f == from && m == msg))
    }

    fn saw_do_view_change(&self) -> Option<DoViewChangeArgs> {
        self.seen.lock().ok().and_then(|seen| {
            seen.iter().find_map(|(_, msg)| match msg {
                PeerMsg::DoViewChange(args) => Some(args.clone()),
                _ => None,
            })
        })
    }
}

#[async_trait]
impl RpcHandler<PeerMsg, PeerReply> for Spy {
    async fn handle(
        &self,
        from: ReplicaId,
        msg: PeerMsg,
    ) -> Result<PeerReply, ViewstampError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((from, msg));
        }
        Ok(PeerReply::Ack)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_reaches_backups() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let cluster = launch_cluster(&net, 3, &fast_config())?;
    let primary = cluster[0].replica.clone();

    let reply = primary.execute(7, 1, put("x", "1")).await;
    assert_eq!(error_of(&reply), None);
    assert_eq!(
        result_of(&reply),
        Some(&CommandResult::Put { old_value: None })
    );
    let status = primary.status().await;
    assert_eq!((status.op_num, status.commit, status.exec_upto), (1, 1, 1));

    // the reply only waits for population / 2 backup acks, so each backup is
    // checked after the fact rather than before the reply
    for backup in &cluster[1..] {
        // prepared right away, committed by the next heartbeat
        assert!(reached(&backup.replica, 1000, |s| s.op_num == 1).await);
        assert!(reached(&backup.replica, 1000, |s| s.exec_upto == 1).await);
        assert_eq!(backup.replica.log_snapshot().await, primary.log_snapshot().await);
        assert_eq!(backup.replica.status().await.mode, Mode::Backup);
    }

    let reply = primary.execute(7, 2, get("x")).await;
    assert_eq!(
        result_of(&reply),
        Some(&CommandResult::Get {
            value: Some("1".into())
        })
    );
    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_answered_from_table() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let cluster = launch_cluster(&net, 3, &fast_config())?;
    let primary = cluster[0].replica.clone();

    let first = primary.execute(3, 1, put("k", "a")).await;
    let again = primary.execute(3, 1, put("k", "a")).await;
    assert_eq!(first, again);
    let status = primary.status().await;
    assert_eq!((status.op_num, status.exec_upto), (1, 1));

    // older request of the same client gets no result
    primary.execute(3, 2, put("k", "b")).await;
    let older = primary.execute(3, 1, put("k", "a")).await;
    assert_eq!(error_of(&older), None);
    assert_eq!(result_of(&older), None);
    assert_eq!(primary.status().await.op_num, 2);
    assert_eq!(primary.table_entry(3).await.map(|r| r.req_num), Some(2));

    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_redirects_client() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let cluster = launch_cluster(&net, 3, &fast_config())?;

    let reply = cluster[1].replica.execute(9, 1, get("x")).await;
    assert_eq!(error_of(&reply), Some(ApiError::NotPrimary));
    assert!(matches!(reply, ApiReply::Reply { view: 0, .. }));
    assert_eq!(cluster[1].replica.status().await.op_num, 0);

    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_replica_commits_alone() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let running = launch(&net, 0, 1, false, fast_config())?;

    let reply = running.replica.execute(1, 1, put("solo", "yes")).await;
    assert_eq!(
        result_of(&reply),
        Some(&CommandResult::Put { old_value: None })
    );
    assert_eq!(running.replica.status().await.commit, 1);
    running.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_primary_starts_view_change() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let spy = Spy::new();
    let weak_spy: Weak<Spy> = Arc::downgrade(&spy);
    register(&net, 2, weak_spy);
    net.set_down(0, true);

    let mut config = fast_config();
    config.viewchange_timeout_ms = 10000;
    let started = Instant::now();
    let running = launch(&net, 1, 3, false, config)?;

    assert!(reached(&running.replica, 2000, |s| s.mode == Mode::ViewChange).await);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(running.replica.status().await.view, 0);
    assert!(
        wait_until(1000, || {
            let spy = spy.clone();
            async move {
                spy.seen.lock().map_or(false, |seen| {
                    seen.contains(&(
                        1,
                        PeerMsg::StartViewChange {
                            view: 1,
                            replica: 1,
                        },
                    ))
                })
            }
        })
        .await
    );

    running.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_view_messages_ignored() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let cluster = launch_cluster(&net, 3, &fast_config())?;
    let backup = cluster[1].replica.clone();

    let before = backup.status().await;
    backup
        .handle(0, PeerMsg::StartViewChange { view: 0, replica: 0 })
        .await?;
    backup
        .handle(
            0,
            PeerMsg::StartView(StartViewArgs {
                view: 0,
                log: vec![],
                op_num: 0,
                commit: 0,
            }),
        )
        .await?;
    assert_eq!(backup.status().await, before);

    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_request_undone() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let primary = VrReplica::new_and_setup(
        0,
        3,
        Role::Primary,
        false,
        fast_config(),
        Arc::new(net.endpoint(0)),
    )?;
    net.set_down(1, true);
    net.set_down(2, true);

    let (handle, tx_cancel) = primary.start_pipeline().await;
    let request = Request {
        cmd: put("y", "5"),
        client: 5,
        req_num: 1,
    };
    let rx_first = primary.submit(request.clone()).await?;
    assert!(reached(&primary, 1000, |s| s.op_num == 1).await);
    assert!(primary.table_entry(5).await.is_some());
    let rx_second = primary
        .submit(Request {
            cmd: get("y"),
            client: 6,
            req_num: 1,
        })
        .await?;

    primary.stop_pipeline(handle, tx_cancel).await?;
    assert!(rx_first.await.is_err());
    assert_eq!(error_of(&rx_second.await?), Some(ApiError::ViewChange));
    assert_eq!(primary.status().await.op_num, 0);
    assert!(primary.log_snapshot().await.is_empty());
    assert_eq!(primary.table_entry(5).await, None);

    // backups come up; the same request is new again
    let backups = vec![
        launch(&net, 1, 3, false, fast_config())?,
        launch(&net, 2, 3, false, fast_config())?,
    ];
    net.set_down(1, false);
    net.set_down(2, false);
    let (handle, tx_cancel) = primary.start_pipeline().await;
    let reply = primary.submit(request).await?.await?;
    assert_eq!(
        result_of(&reply),
        Some(&CommandResult::Put { old_value: None })
    );
    assert_eq!(primary.status().await.op_num, 1);

    primary.stop_pipeline(handle, tx_cancel).await?;
    for running in backups {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn view_change_elects_next() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let mut cluster = launch_cluster(&net, 3, &fast_config())?;
    let old_primary = cluster.remove(0);

    let reply = old_primary.replica.execute(4, 1, put("z", "old")).await;
    assert_eq!(error_of(&reply), None);
    for backup in &cluster {
        assert!(reached(&backup.replica, 1000, |s| s.exec_upto == 1).await);
    }

    net.set_down(0, true);
    old_primary.stop().await?;

    let new_primary = cluster[0].replica.clone();
    assert!(
        reached(&new_primary, 3000, |s| s.mode == Mode::Primary && s.view == 1).await
    );
    assert!(
        reached(&cluster[1].replica, 3000, |s| s.mode == Mode::Backup && s.view == 1)
            .await
    );
    assert_eq!(new_primary.status().await.op_num, 1);

    // committed result survives the view change
    let again = new_primary.execute(4, 1, put("z", "old")).await;
    assert_eq!(result_of(&again), Some(&CommandResult::Put { old_value: None }));

    let reply = execute_settled(&new_primary, 4, 2, put("z", "new")).await;
    assert_eq!(
        result_of(&reply),
        Some(&CommandResult::Put {
            old_value: Some("old".into())
        })
    );
    assert!(reached(&cluster[1].replica, 1000, |s| s.op_num == 2).await);

    // the other backup now redirects
    let redirect = cluster[1].replica.execute(4, 3, get("z")).await;
    assert_eq!(error_of(&redirect), Some(ApiError::NotPrimary));

    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_replica_recovers() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let mut cluster = launch_cluster(&net, 3, &fast_config())?;
    let primary = cluster[0].replica.clone();
    primary.execute(8, 1, put("a", "1")).await;
    primary.execute(8, 2, put("b", "2")).await;

    net.set_down(2, true);
    let crashed = cluster.remove(2);
    crashed.stop().await?;

    let restarted = launch(&net, 2, 3, true, fast_config())?;
    assert_eq!(restarted.replica.status().await.mode, Mode::Recovery);
    net.set_down(2, false);

    assert!(reached(&restarted.replica, 3000, |s| s.mode == Mode::Backup).await);
    let status = restarted.replica.status().await;
    assert_eq!((status.view, status.op_num, status.commit), (0, 2, 2));
    assert_eq!(status.exec_upto, 2);
    assert_eq!(restarted.replica.log_snapshot().await, primary.log_snapshot().await);

    // keeps following the primary afterwards
    primary.execute(8, 3, put("c", "3")).await;
    assert!(reached(&restarted.replica, 1000, |s| s.op_num == 3).await);

    restarted.stop().await?;
    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resend_after_view_change_gets_result() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let mut config = fast_config();
    config.backup_timeout_ms = 600;
    config.commit_interval_ms = 250;
    let mut cluster = launch_cluster(&net, 3, &config)?;
    let old_primary = cluster.remove(0);

    // primary goes away before any heartbeat tells backups about the commit
    let reply = old_primary.replica.execute(4, 1, put("t", "1")).await;
    assert_eq!(result_of(&reply), Some(&CommandResult::Put { old_value: None }));
    net.set_down(0, true);
    old_primary.stop().await?;
    for backup in &cluster {
        assert!(reached(&backup.replica, 1000, |s| s.op_num == 1).await);
    }

    let new_primary = cluster[0].replica.clone();
    assert!(
        reached(&new_primary, 3000, |s| s.mode == Mode::Primary && s.view == 1).await
    );
    assert!(reached(&new_primary, 1000, |s| s.commit == 1 && s.exec_upto == 1).await);

    let again = new_primary.execute(4, 1, put("t", "1")).await;
    assert_eq!(error_of(&again), None);
    assert_eq!(result_of(&again), Some(&CommandResult::Put { old_value: None }));
    assert_eq!(new_primary.status().await.op_num, 1);
    assert!(reached(&cluster[1].replica, 1000, |s| s.exec_upto == 1).await);

    for running in cluster {
        running.stop().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gapped_prepares_bounded() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    net.set_down(0, true);
    net.set_down(2, true);
    let mut config = fast_config();
    config.backup_timeout_ms = 600;
    config.viewchange_timeout_ms = 10000;
    let running = launch(&net, 1, 3, false, config)?;
    let backup = running.replica.clone();

    // op 1 never arrives
    let calls: Vec<_> = (2..=21)
        .map(|op_num| {
            let backup = backup.clone();
            tokio::spawn(async move {
                backup.handle(0, PeerMsg::Prepare(prepare(op_num))).await
            })
        })
        .collect();
    assert!(
        wait_until(300, || {
            let refused = calls.iter().filter(|call| call.is_finished()).count();
            async move { refused >= 10 }
        })
        .await
    );

    // a steady stream of gapped prepares does not keep the backup waiting
    let feeder = {
        let backup = backup.clone();
        tokio::spawn(async move {
            for op_num in 22..=100 {
                let backup = backup.clone();
                tokio::spawn(async move {
                    backup.handle(0, PeerMsg::Prepare(prepare(op_num))).await
                });
                time::sleep(Duration::from_millis(50)).await;
            }
        })
    };
    assert!(reached(&backup, 2000, |s| s.mode == Mode::ViewChange).await);
    feeder.abort();
    assert_eq!(backup.status().await.op_num, 0);

    for call in calls {
        let answered = time::timeout(Duration::from_millis(2000), call).await;
        assert!(matches!(answered, Ok(Ok(Err(_)))));
    }
    running.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_next_primary_skipped() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    net.set_down(1, true);
    let mut config = fast_config();
    config.viewchange_timeout_ms = 500;

    // nobody acts as primary of view 0, and the primary of view 1 is down
    let zero = launch_as(&net, 0, Role::Backup, 3, false, config.clone())?;
    let two = launch_as(&net, 2, Role::Backup, 3, false, config)?;

    assert!(
        reached(&two.replica, 5000, |s| s.mode == Mode::Primary && s.view == 2).await
    );
    assert!(
        reached(&zero.replica, 2000, |s| s.mode == Mode::Backup && s.view == 2).await
    );

    let reply = execute_settled(&two.replica, 5, 1, put("w", "2")).await;
    assert_eq!(result_of(&reply), Some(&CommandResult::Put { old_value: None }));
    assert!(reached(&zero.replica, 1000, |s| s.exec_upto == 1).await);

    zero.stop().await?;
    two.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn larger_proposal_adopted() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let spy = Spy::new();
    for peer in [0, 2, 3, 4] {
        let weak_spy: Weak<Spy> = Arc::downgrade(&spy);
        register(&net, peer, weak_spy);
    }
    let replica = VrReplica::new_and_setup(
        1,
        5,
        Role::Backup,
        false,
        fast_config(),
        Arc::new(net.endpoint(1)),
    )?;

    replica
        .handle(2, PeerMsg::StartViewChange { view: 2, replica: 2 })
        .await?;
    replica
        .handle(3, PeerMsg::StartViewChange { view: 3, replica: 3 })
        .await?;
    {
        let ballot = replica.ballot.lock().await;
        assert_eq!(ballot.proposed, 3);
        assert!(!ballot.svc_from.get(2)?);
        assert!(ballot.svc_from.get(3)?);
    }
    assert_eq!(replica.status().await.mode, Mode::ViewChange);
    assert!(
        wait_until(1000, || {
            let spy = spy.clone();
            async move {
                spy.saw(1, &PeerMsg::StartViewChange { view: 3, replica: 1 })
            }
        })
        .await
    );

    // lower proposal neither resets nor counts
    replica
        .handle(4, PeerMsg::StartViewChange { view: 2, replica: 4 })
        .await?;
    {
        let ballot = replica.ballot.lock().await;
        assert_eq!(ballot.proposed, 3);
        assert_eq!(ballot.svc_from.count(), 1);
        assert!(!ballot.dvc_sent);
    }

    // second vote for view 3 completes the subquorum
    replica
        .handle(4, PeerMsg::StartViewChange { view: 3, replica: 4 })
        .await?;
    assert!(
        wait_until(1000, || {
            let spy = spy.clone();
            async move { spy.saw_do_view_change().is_some() }
        })
        .await
    );
    let dvc = spy.saw_do_view_change();
    assert_eq!(dvc.map(|dvc| (dvc.view, dvc.replica)), Some((3, 1)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_do_view_change_ignored() -> Result<(), ViewstampError> {
    let net = LocalNet::new();
    let replica = VrReplica::new_and_setup(
        0,
        3,
        Role::Primary,
        false,
        fast_config(),
        Arc::new(net.endpoint(0)),
    )?;
    let before = replica.status().await;

    // at or below the current view
    replica
        .handle(1, PeerMsg::DoViewChange(do_view_change(0, 1, 3)))
        .await?;
    assert_eq!(replica.status().await, before);
    assert!(replica.ballot.lock().await.dvc_args.is_empty());

    // below the view already being proposed
    replica
        .handle(1, PeerMsg::StartViewChange { view: 7, replica: 1 })
        .await?;
    replica
        .handle(2, PeerMsg::DoViewChange(do_view_change(3, 2, 3)))
        .await?;
    replica
        .handle(1, PeerMsg::DoViewChange(do_view_change(3, 1, 3)))
        .await?;
    let status = replica.status().await;
    assert_eq!((status.view, status.op_num, status.mode), (0, 0, Mode::ViewChange));
    assert!(replica.ballot.lock().await.dvc_args.is_empty());
    assert!(replica.log_snapshot().await.is_empty());
    Ok(())
}
