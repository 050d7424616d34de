use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tapnetd::cli::Args;
use tapnetd::config;
use tapnetd::eventloop::EventLoop;
use tapnetd::store::{BindingStore, KeyDiscipline};
use tapnetd::watcher::ConfigWatcher;

fn main() {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    if let Err(e) = run(args) {
        error!(error = ?e, "tapnetd exiting with error");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    info!(config = %args.config.display(), "loading configuration");
    let cfg = config::load_file(&args.config).context("failed to load configuration")?;

    // Our Packet Queue Adapter always reports the physical input device's
    // ifindex from the kernel's NFQA_IFINDEX_INDEV attribute, so this binary
    // always runs ifindex-keyed (§9 "key-discipline branch").
    let store = Arc::new(BindingStore::new(KeyDiscipline::Ifindex, cfg.general.datapath.clone()));
    store.rebuild();

    let watcher = ConfigWatcher::new(std::path::Path::new(&cfg.general.datapath))
        .context("failed to start config watcher")?;

    let mut event_loop = EventLoop::new(cfg, store, watcher).context("failed to set up packet queues")?;
    event_loop.run();

    Ok(())
}
