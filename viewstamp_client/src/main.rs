//! Viewstamp line-oriented client executable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use viewstamp::{
    ClientEndpoint, ClientId, ClusterMap, Command, CommandResult,
    ViewstampError, logger_init, pf_error,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client ID; random if not given.
    #[arg(short, long)]
    id: Option<ClientId>,

    /// Cluster membership TOML file.
    #[arg(short, long)]
    cluster: PathBuf,

    /// Client config TOML string (e.g., 'init_server_id = 1').
    #[arg(long)]
    config: Option<String>,
}

/// Parses one input line into a command. Returns `Ok(None)` on blank lines.
fn parse_line(line: &str) -> Result<Option<Command>, ViewstampError> {
    let mut words = line.split_whitespace();
    let cmd = match (words.next(), words.next(), words.next()) {
        (None, _, _) => return Ok(None),
        (Some("get"), Some(key), None) => Command::Get { key: key.into() },
        (Some("put"), Some(key), Some(value)) => Command::Put {
            key: key.into(),
            value: value.into(),
        },
        _ => {
            return Err(ViewstampError::msg(format!(
                "cannot parse '{}', expect 'get <k>' or 'put <k> <v>'",
                line.trim()
            )))
        }
    };
    if words.next().is_some() {
        return Err(ViewstampError::msg(format!(
            "trailing words in '{}'",
            line.trim()
        )));
    }
    Ok(Some(cmd))
}

fn print_result(result: &CommandResult) {
    match result {
        CommandResult::Get { value } => {
            println!("{}", value.as_deref().unwrap_or("<none>"))
        }
        CommandResult::Put { old_value } => {
            println!("ok (was {})", old_value.as_deref().unwrap_or("<none>"))
        }
    }
}

async fn client_loop(args: &CliArgs) -> Result<(), ViewstampError> {
    let cluster = ClusterMap::load(&args.cluster).await?;
    let id = args.id.unwrap_or_else(rand::random);
    let mut endpoint =
        ClientEndpoint::new_and_setup(id, &cluster, args.config.as_deref())?;

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Ok(Some(cmd)) => print_result(&endpoint.execute(cmd).await?),
            Ok(None) => {}
            Err(e) => eprintln!("{}", e),
        }
    }

    endpoint.leave().await
}

/// Actual main function of Viewstamp client.
fn client_main() -> Result<(), ViewstampError> {
    let args = CliArgs::parse();
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;
    runtime.block_on(client_loop(&args))
}

/// Main function of Viewstamp client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
