use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use raftd::config::{RaftGroupConfig, RuntimeConfig};
use raftd::kv::KvStateMachine;
use raftd::metrics;
use raftd::net::TcpTransport;
use raftd::raft::StateMachine;
use raftd::server::{RaftServer, StateMachineFactory};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about = "raft server")]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let runtime_config = RuntimeConfig::from_toml(&args.config);
    runtime_config.validate().context("invalid runtime config")?;
    let server_config = runtime_config.server.clone();
    metrics::init_registry();

    let transport = TcpTransport::new(
        server_config.node_id,
        server_config.max_frame_size,
        server_config.connect_timeout(),
        tokio::runtime::Handle::current(),
    );
    let factory: StateMachineFactory =
        Arc::new(|_: &RaftGroupConfig| Box::new(KvStateMachine::new()) as Box<dyn StateMachine>);
    let server = RaftServer::new(server_config.clone(), Arc::new(transport.clone()), factory)
        .context("create raft server")?;

    let listener = TcpListener::bind(&server_config.bind_addr)
        .await
        .with_context(|| format!("bind {}", server_config.bind_addr))?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let handlers = server.handlers();
    let mut rpc_stop = stop_rx.clone();
    let rpc = tokio::spawn(async move {
        transport
            .serve(listener, handlers, async move {
                let _ = rpc_stop.changed().await;
            })
            .await
    });

    let metrics_addr: SocketAddr = server_config
        .metrics_addr
        .parse()
        .with_context(|| format!("bad metrics addr {}", server_config.metrics_addr))?;
    let mut metrics_stop = stop_rx.clone();
    tokio::spawn(async move {
        let r = metrics::serve_metrics(metrics_addr, async move {
            let _ = metrics_stop.changed().await;
        })
        .await;
        if let Err(e) = r {
            error!("metrics server failed: {}", e);
        }
    });

    server
        .start(&runtime_config.groups)
        .context("start raft groups")?;
    info!("raftd {} serving on {}", server_config.node_id, server_config.bind_addr);

    shutdown_signal().await;
    info!("shutting down");
    server.stop(STOP_TIMEOUT).await;
    let _ = stop_tx.send(true);
    if let Ok(Err(e)) = rpc.await {
        error!("rpc server failed: {}", e);
    }
    Ok(())
}
