//! rust-torrent-engine - Main entry point
//!
//! Adds every torrent given on the command line, feeds it the `--peer`
//! addresses and renders progress until Ctrl-C or completion.

use anyhow::{Context, Result};
use rust_torrent_engine::cli::{CliArgs, ProgressDisplay};
use rust_torrent_engine::{Engine, EngineSnapshot, StaticPeers, TorrentParser, TorrentState};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }

        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Initialize logging based on CLI arguments
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

/// Every torrent has nothing left to download
fn finished(snapshot: &EngineSnapshot) -> bool {
    snapshot
        .torrents
        .iter()
        .all(|t| matches!(t.state, TorrentState::Seeding | TorrentState::Error))
}

async fn add_torrents(engine: &Engine, args: &CliArgs) -> Result<()> {
    for path in &args.torrents {
        let metadata = TorrentParser::parse_file(path)
            .with_context(|| format!("Failed to load torrent file '{}'", path.display()))?;
        info!(
            "Loaded {} ({} pieces, {} bytes)",
            metadata.name,
            metadata.piece_count(),
            metadata.total_size()
        );

        let info_hash = engine.add_torrent(metadata, args.output_dir.clone()).await?;
        if !args.peers.is_empty() {
            engine
                .attach_peer_source(&info_hash, StaticPeers::new(args.peers.clone()))
                .await?;
        }
        engine.start(&info_hash).await?;
    }
    Ok(())
}

async fn run(engine: &Engine, args: &CliArgs) -> Result<EngineSnapshot> {
    let mut display = ProgressDisplay::new(args.quiet);
    let mut ticker = tokio::time::interval(args.refresh_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                let snapshot = engine.snapshot().await;
                display.print_summary(&snapshot)?;
                return Ok(snapshot);
            }
            _ = ticker.tick() => {
                let snapshot = engine.snapshot().await;
                display.update(&snapshot)?;
                if !args.seed && finished(&snapshot) {
                    display.print_summary(&snapshot)?;
                    return Ok(snapshot);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("rust-torrent-engine starting");

    let config = args.engine_config()?;
    let engine = Engine::new(config)?;
    engine.listen().await.context("Failed to start listener")?;

    let outcome = match add_torrents(&engine, &args).await {
        Ok(()) => run(&engine, &args).await,
        Err(e) => Err(e),
    };

    if let Err(e) = engine.shutdown().await {
        warn!("Shutdown was not clean: {}", e);
    }

    let snapshot = outcome?;
    let failed: Vec<&str> = snapshot
        .torrents
        .iter()
        .filter(|t| t.state == TorrentState::Error)
        .map(|t| t.name.as_str())
        .collect();
    if !failed.is_empty() {
        anyhow::bail!("Torrents ended in error: {}", failed.join(", "));
    }
    Ok(())
}
