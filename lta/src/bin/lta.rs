//
// Main entry point for the LTA pipeline workers. One subcommand per
// component; every replica runs exactly one.
//
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lta::config::{
    BundlerArgs, CatalogerArgs, CommonArgs, DeleterArgs, LocatorArgs, PickerArgs, ReplicatorArgs,
    VerifierArgs,
};
use lta::lta_db::LtaDbClient;
use lta::worker::{self, HeartbeatState, SharedHeartbeat, Worker};
use lta::{bundler, cataloger, deleter, http, locator, logging, picker, replicator, verifier};

const ABOUT: &str = r#"
Long Term Archive pipeline worker. Each component claims records from the
LTA DB, advances them one status, and goes back for more; replicas scale
horizontally because the pop is atomic on the server.
"#;

#[derive(Parser)]
#[command(name = "lta", about = ABOUT, long_about = None, version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Expand transfer requests into size-balanced bundles.
    Picker(PickerArgs),
    /// Build ZIP64 archives and record their checksums.
    Bundler(BundlerArgs),
    /// Submit finished archives to the transfer service.
    Replicator(ReplicatorArgs),
    /// Re-checksum destination copies against creation checksums.
    Verifier(VerifierArgs),
    /// Record taped archives and their files in the File Catalog.
    Cataloger(CatalogerArgs),
    /// Remove warehouse files whose archival is confirmed.
    Deleter(DeleterArgs),
    /// Map restore requests onto the archives that cover them.
    Locator(LocatorArgs),
}

fn install_signal_handler() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
        trigger.cancel();
    });
    Ok(cancel)
}

/// Shared scaffolding around a component: metrics endpoint, heartbeat, and
/// the work loop itself.
async fn serve<W: Worker>(
    common: CommonArgs,
    worker: W,
    db: Arc<LtaDbClient>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Some(port) = common.prometheus_metrics_port {
        let metrics_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(port, metrics_cancel).await {
                error!("metrics endpoint failed: {e:#}");
            }
        });
    }

    let heartbeat: Option<SharedHeartbeat> = common.heartbeat_interval().map(|interval| {
        let state: SharedHeartbeat = Arc::new(Mutex::new(HeartbeatState::default()));
        worker::spawn_heartbeat(
            db,
            worker.component(),
            interval,
            state.clone(),
            cancel.clone(),
        );
        state
    });

    worker::run(&worker, common.loop_policy(), heartbeat, &cancel).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Picker(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = picker::Picker::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Bundler(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = bundler::Bundler::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Replicator(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = replicator::Replicator::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Verifier(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = verifier::Verifier::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Cataloger(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = cataloger::Cataloger::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Deleter(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = deleter::Deleter::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
        Command::Locator(args) => {
            logging::init(&args.common.log_level, args.common.log_format)?;
            let cancel = install_signal_handler()?;
            let worker = locator::Locator::new(&args, &cancel)?;
            let db = worker.db();
            serve(args.common, worker, db, cancel).await
        }
    }
}
