//! darkhold — HTTP gateway for a local Codex app-server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use darkhold_core::event_log::ThreadEventLog;
use darkhold_gateway::allowlist::ClientAllowList;
use darkhold_gateway::broker::InteractionBroker;
use darkhold_gateway::cli::Cli;
use darkhold_gateway::config::ServerConfig;
use darkhold_gateway::http::{router, AppState};
use darkhold_gateway::hub::EventHub;
use darkhold_gateway::supervisor::Supervisor;
use darkhold_gateway::transport::ProcessTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    darkhold_core::logging::init();
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli).context("invalid configuration")?;
    run(config).await
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Per-process log directory; the TempDir guard removes it even on
    // panic, and we also clean it explicitly on orderly shutdown.
    let log_dir = tempfile::Builder::new()
        .prefix("darkhold-")
        .tempdir()
        .context("failed to create event log directory")?;
    let log = Arc::new(ThreadEventLog::new(log_dir.path()));
    let hub = Arc::new(EventHub::new(Arc::clone(&log)));
    let broker = Arc::new(InteractionBroker::new());
    let supervisor = Supervisor::new(
        Box::new(ProcessTransport::new(&config.app_server_bin)),
        Arc::clone(&hub),
        Arc::clone(&broker),
        config.rpc_timeout,
        config.shutdown_grace,
    );

    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        hub,
        allowlist: Arc::new(ClientAllowList::new(config.allow_cidrs.clone())),
        base_path: config.base_path.clone(),
        keepalive: config.keepalive,
    };
    let app = router(state);

    let ui_addr = SocketAddr::new(config.bind, config.port);
    let rpc_addr = SocketAddr::new(config.bind, config.rpc_port);
    let ui_listener = TcpListener::bind(ui_addr)
        .await
        .with_context(|| format!("failed to bind {ui_addr}"))?;
    let rpc_listener = TcpListener::bind(rpc_addr)
        .await
        .with_context(|| format!("failed to bind {rpc_addr}"))?;
    tracing::info!(%ui_addr, %rpc_addr, base_path = %config.base_path.display(), "darkhold listening");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let ui_server = {
        let app = app.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                ui_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        })
    };
    let rpc_server = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                rpc_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        })
    };

    shutdown.cancelled().await;
    tracing::info!("shutting down");

    // Give in-flight requests the same grace a child gets; long-lived SSE
    // connections hold the servers open past that, so cut them loose.
    let drain = async {
        let _ = ui_server.await;
        let _ = rpc_server.await;
    };
    if tokio::time::timeout(config.shutdown_grace + Duration::from_millis(500), drain)
        .await
        .is_err()
    {
        tracing::debug!("listeners still busy after grace period, aborting streams");
    }

    supervisor.shutdown().await;
    if let Err(e) = supervisor.hub().log().cleanup().await {
        tracing::warn!("failed to remove event log directory: {e}");
    }
    drop(log_dir);
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to install SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => tracing::info!("received Ctrl+C"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received Ctrl+C");
        }
        token.cancel();
    });
}
