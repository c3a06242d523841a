//! Viewstamp server replica executable.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;
use viewstamp::{
    ClusterMap, CrashMarker, ExternalApi, PeerMsg, PeerReply, ReplicaConfigVr,
    ReplicaId, TransportHub, ViewstampError, VrReplica, logger_init, pf_error,
    pf_info, pf_warn,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My replica ID in the cluster file.
    #[arg(short, long)]
    id: ReplicaId,

    /// Cluster membership TOML file.
    #[arg(short, long)]
    cluster: PathBuf,

    /// Replica config TOML string (e.g., 'backup_timeout_ms = 2000').
    #[arg(long)]
    config: Option<String>,

    /// Directory holding the crash marker file.
    #[arg(short, long, default_value = "/tmp/viewstamp")]
    marker_dir: PathBuf,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ViewstampError)` on any error.
    fn sanitize(&self) -> Result<(), ViewstampError> {
        if self.threads < 2 {
            Err(ViewstampError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.marker_dir.as_os_str().is_empty() {
            Err(ViewstampError::msg("empty marker_dir"))
        } else {
            Ok(())
        }
    }
}

/// Sets up all modules of a replica and runs it until termination.
async fn run_replica(
    args: &CliArgs,
    rx_term: watch::Receiver<bool>,
) -> Result<(), ViewstampError> {
    let me = args.id;
    let cluster = ClusterMap::load(&args.cluster).await?;
    let spec = cluster.get(me)?.clone();
    let config = ReplicaConfigVr::from_toml(args.config.as_deref())?;

    // a leftover marker means the last run did not exit cleanly
    let marker = CrashMarker::new(me, &args.marker_dir);
    let recovering = marker.plant().await?;
    if recovering {
        pf_warn!(me; "crash marker '{}' found, recovering", marker.path().display());
    }

    let transport = Arc::new(
        TransportHub::<PeerMsg, PeerReply>::new_and_setup(
            me,
            spec.p2p_addr,
            cluster.peer_p2p_addrs(me),
        )
        .await?,
    );
    let replica = VrReplica::new_and_setup(
        me,
        cluster.population(),
        spec.role,
        recovering,
        config,
        transport.clone(),
    )?;
    let _peer_acceptor = transport.serve(replica.clone(), rx_term.clone()).await?;
    let api = ExternalApi::new_and_setup(
        me,
        spec.api_addr,
        replica.clone(),
        rx_term.clone(),
    )
    .await?;
    pf_info!(me; "serving clients on '{}'", api.api_addr());

    replica.run(rx_term).await?;

    // clean exit, next start is a fresh one
    marker.remove().await?;
    Ok(())
}

/// Actual main function of Viewstamp server replica.
fn server_main() -> Result<(), ViewstampError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    let me = args.id;
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(me; "error sending to term channel: {}", e);
        }
    })
    .map_err(|e| ViewstampError::msg(format!("ctrlc handler: {}", e)))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        runtime.block_on(async {
            run_replica(&args, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ViewstampError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Viewstamp server replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
