//! wgroutemgr daemon entry point.
//!
//! Sidecar to a WireGuard (or other VPN) container: client containers name
//! the networks they want to reach through the VPN in a label, and the
//! sidecar installs the matching routes inside their network namespaces.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod error;
mod gateway;
mod identity;
mod labels;
mod netns;
mod reconciler;
mod runtime;
mod types;
mod watcher;

use config::Config;
use identity::{EnvironmentInspector, ProcInspector};
use netns::NetnsExecutor;
use reconciler::Reconciler;
use runtime::DockerRuntime;
use watcher::ContainerWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting wgroutemgr with config: {:?}", cfg);

    // Identity and gateway are fixed for the lifetime of the process
    let runtime = DockerRuntime::connect()?;
    let identity = ProcInspector::new(&runtime, &cfg.proc_root)
        .resolve_self()
        .await?;
    let ctx = Arc::new(gateway::build_context(&runtime, &identity, cfg.network.as_deref()).await?);

    // Event queue between watcher and reconciler
    let (event_tx, event_rx) = mpsc::channel(cfg.event_buffer);

    let executor = Arc::new(NetnsExecutor::new(
        cfg.ip_command.clone(),
        cfg.namespace_timeout(),
    ));
    let reconciler = Reconciler::new(Arc::clone(&ctx), executor, cfg.event_buffer);
    let reconciler_handle = tokio::spawn(reconciler.run(event_rx));

    let (backoff_min, backoff_max) = cfg.resync_backoff();
    let watcher = ContainerWatcher::new(&runtime, &ctx, backoff_min, backoff_max);

    // Dropping the watcher closes the queue; the reconciler then drains.
    tokio::select! {
        result = watcher.run(event_tx) => {
            if let Err(e) = result {
                error!("Container watcher failed: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
        }
    }

    let tracked = reconciler_handle.await?;
    info!(
        "Shutdown complete, leaving routes of {} containers in place.",
        tracked.len()
    );
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Unable to listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}
