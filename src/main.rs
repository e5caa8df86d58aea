//! Node-plugin binary entry point: wires the helper-pod watcher, lock
//! table, and `NodeMounter` facade together and runs until a termination
//! signal arrives.

use std::sync::Arc;

use clap::Parser;
use csi_node_core::config::Config;
use csi_node_core::locks::LockTable;
use csi_node_core::watcher::HelperPodWatcher;
use csi_node_core::NodeMounter;
use tracing::{error, info};

/// Mountpoint-for-S3 CSI driver node plugin.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Log filter directive, e.g. `info` or `csi_node_core=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = Config::from_env()?;
    info!(node_name = %config.node_name, legacy = config.support_legacy_systemd_mounts, "starting node plugin");

    let client = kube::Client::try_default().await?;
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let watcher = Arc::new(HelperPodWatcher::new(&config.mountpoint_namespace));
    let watcher_task = {
        let watcher = watcher.clone();
        let client = client.clone();
        let node_name = config.node_name.clone();
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.start(client, &node_name, stop_rx).await {
                error!(error = %e, "helper-pod watcher exited");
            }
        })
    };

    let locks = Arc::new(LockTable::new());
    let unmounter = Arc::new(csi_node_core::pod_unmounter::PodUnmounter::new(config.clone(), watcher.clone(), locks.clone()));
    let unmounter_task = {
        let unmounter = unmounter.clone();
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { unmounter.run(stop_rx).await })
    };

    // The node-local `NodeMounter` is what a CSI gRPC node service (out of
    // scope here) would hold and call `mount`/`unmount`/`is_mount_point` on
    // per incoming request; constructing it here exercises the same wiring
    // that service would need.
    let _mounter = NodeMounter::new(config, client, watcher, locks);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background tasks");
    let _ = stop_tx.send(true);

    let _ = tokio::join!(watcher_task, unmounter_task);
    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler, falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
