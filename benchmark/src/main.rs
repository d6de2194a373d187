use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use raftd::config::{NodeConfig, RaftGroupConfig, RaftServerConfig};
use raftd::kv::{KvCommand, KvStateMachine};
use raftd::net::LocalNetwork;
use raftd::raft::{GroupContext, RaftRole, StateMachine};
use raftd::server::{RaftServer, StateMachineFactory};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Pause between two writes of a client, ms
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Value size in bytes
    #[arg(short, long, default_value = "128")]
    payload: usize,

    /// Number of nodes of the in-process cluster
    #[arg(short, long, default_value = "3")]
    nodes: u32,

    /// fsync every log write
    #[arg(long, default_value = "false")]
    sync: bool,
}

const GROUP_ID: u32 = 1;

fn group_config(nodes: &[u32], sync: bool) -> RaftGroupConfig {
    RaftGroupConfig {
        group_id: GROUP_ID,
        members: nodes.to_vec(),
        elect_timeout_ms: 1000,
        heartbeat_interval_ms: 100,
        sync_force: sync,
        save_snapshot_interval_ms: 0,
        ..Default::default()
    }
}

async fn start_cluster(args: &Args, dir: &std::path::Path) -> anyhow::Result<Vec<Arc<RaftServer>>> {
    let net = LocalNetwork::new();
    let ids: Vec<u32> = (1..=args.nodes).collect();
    let nodes: Vec<NodeConfig> = ids
        .iter()
        .map(|id| NodeConfig::new(*id, &format!("local-{}", id)))
        .collect();
    let mut servers = Vec::new();
    for id in &ids {
        let config = RaftServerConfig {
            node_id: *id,
            data_dir: dir.join(format!("node-{}", id)).to_string_lossy().into_owned(),
            nodes: nodes.clone(),
            node_ping_interval_ms: 200,
            ..Default::default()
        };
        let factory: StateMachineFactory =
            Arc::new(|_: &RaftGroupConfig| Box::new(KvStateMachine::new()) as Box<dyn StateMachine>);
        let server = RaftServer::new(config, Arc::new(net.transport(*id)), factory)?;
        net.register(*id, server.handlers());
        servers.push(server);
    }
    for s in &servers {
        s.start(&[group_config(&ids, args.sync)])?;
    }
    Ok(servers)
}

async fn wait_leader(servers: &[Arc<RaftServer>], timeout: Duration) -> anyhow::Result<GroupContext> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for s in servers {
            let ctx = s.group(GROUP_ID)?;
            if ctx.status().role() == RaftRole::Leader {
                return Ok(ctx);
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("no leader elected in {:?}", timeout)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let dir = tempfile::tempdir()?;
    let servers = start_cluster(&args, dir.path()).await?;
    let leader = wait_leader(&servers, Duration::from_secs(10)).await?;

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));
    let failed_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, {} nodes, {} byte values",
        args.concurrency, args.nodes, args.payload
    );

    // Spawn client tasks
    let mut handles = vec![];
    for client_id in 0..args.concurrency {
        let leader = leader.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let failed_requests = failed_requests.clone();
        let payload = args.payload;
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                let cmd = KvCommand::Put {
                    key: format!("{}-{}", client_id, seq % 1024).into_bytes(),
                    value: (0..payload).map(|_| rand::random::<u8>()).collect(),
                };
                seq += 1;
                let data = match cmd.encode() {
                    Ok(d) => d,
                    Err(e) => {
                        eprintln!("Encode failed: {}", e);
                        return;
                    }
                };

                let start = Instant::now();
                match leader.write(data.into(), Duration::from_secs(5)).await {
                    Ok(_) => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        let _ = hist.record(duration.as_micros() as u64);
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Err(e) => {
                        *failed_requests.lock().await += 1;
                        eprintln!("Request failed: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }

                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                }
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let failed = *failed_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Failed Requests: {}", failed);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    for s in &servers {
        s.stop(Duration::from_secs(5)).await;
    }
    Ok(())
}
