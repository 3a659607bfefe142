use std::path::PathBuf;
use std::sync::Arc;

use ixdpm::config::Config;
use ixdpm::dpm::Manager;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod hotplug;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "ix-device-plugin",
    about = "Iluvatar GPU device plugin for Kubernetes"
)]
struct Opt {
    /// Expose each chip as its own device instead of assembling two-chip
    /// boards (env: SPLIT_BOARD)
    #[structopt(long)]
    splitboard: bool,

    /// Enable the volcano scheduler integration (env: USE_VOLCANO)
    #[structopt(long)]
    usevolcano: bool,

    /// Coordinate a GPU reset with sibling plugins on allocation
    /// (env: RESET_GPU)
    #[structopt(long = "reset_gpu")]
    reset_gpu: bool,

    /// Path to the plugin configuration file
    #[structopt(long, default_value = "/etc/ix-device-plugin/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opt = Opt::from_args();
    if let Err(e) = run(opt).await {
        error!(error = %e, "device plugin failed");
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let mut cfg = Config::load(&opt.config)?;
    cfg.flags.split_board |= opt.splitboard;
    cfg.flags.use_volcano |= opt.usevolcano;
    cfg.flags.reset_gpu |= opt.reset_gpu;
    cfg.flags.update_from_env();
    info!(?cfg, "loaded configuration");

    let lib = Arc::new(ixml::Ixml::load()?);

    let (hotplug_tx, hotplug_rx) = mpsc::channel(64);
    hotplug::spawn(hotplug_tx)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(watch_signals(shutdown_tx));

    Manager::new(cfg, lib).run(hotplug_rx, shutdown_rx).await
}

/// Turns SIGTERM/SIGINT/SIGQUIT into the shutdown broadcast. SIGHUP is
/// logged and ignored.
async fn watch_signals(shutdown: broadcast::Sender<()>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to register signal handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to register signal handler");
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to register signal handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to register signal handler");
            return;
        }
    };

    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sigquit.recv() => "SIGQUIT",
            _ = sighup.recv() => {
                info!("received SIGHUP, ignoring");
                continue;
            }
        };
        info!(signal = name, "received signal, shutting down");
        let _ = shutdown.send(());
        return;
    }
}
