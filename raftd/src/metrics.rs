//! Metrics collection module for raftd
//!
//! This module provides functionality for collecting and exposing raft and
//! rpc metrics using Prometheus, and a small hyper server for `/metrics`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::error::RaftError;
use crate::net::command;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for raft events: writes, commits, applies, elections
    pub static ref RAFT_EVENT_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("raft_event_counter", "raft event counter"), &["event"]).unwrap();

    /// Counter for tracking rpc counts by command
    pub static ref RPC_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("rpc_counter", "rpc counter"), &["command"]).unwrap();

    /// Histogram for tracking rpc round trip times
    pub static ref RPC_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("rpc_cost", "rpc cost"),
        &["command"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_EVENT_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RPC_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RPC_HISTOGRAM_VEC.clone()));
}

pub fn inc_raft_event(event: &str) {
    RAFT_EVENT_COUNTER_VEC.with_label_values(&[event]).inc();
}

pub fn add_raft_events(event: &str, n: u64) {
    RAFT_EVENT_COUNTER_VEC
        .with_label_values(&[event])
        .inc_by(n as f64);
}

pub fn command_name(code: u32) -> &'static str {
    match code {
        command::NODE_PING => "node_ping",
        command::RAFT_PING => "raft_ping",
        command::RAFT_APPEND_ENTRIES => "append_entries",
        command::RAFT_REQUEST_VOTE => "request_vote",
        command::RAFT_QUERY_STATUS => "query_status",
        command::RAFT_LEADER_TRANSFER => "leader_transfer",
        _ => "unknown",
    }
}

/// Records metrics for an async operation
///
/// This function:
/// 1. Records the start time
/// 2. Increments the rpc counter
/// 3. Executes the provided handler
/// 4. Records the execution time
///
/// # Arguments
///
/// * `command_name` - Name of the command being measured
/// * `handler` - Async function to execute and measure
pub async fn record_metrics<F, Fut, T>(command_name: &'static str, handler: F) -> Result<T, RaftError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RaftError>>,
{
    let start = Instant::now();
    RPC_COUNTER_VEC.with_label_values(&[command_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    RPC_HISTOGRAM_VEC
        .with_label_values(&[command_name])
        .observe(elapsed.as_secs_f64());

    result
}

/// Text exposition of the registry.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer) {
        error!("encode metrics failed: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn serve_req(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = if req.uri().path() == "/metrics" {
        Response::new(Body::from(gather_text()))
    } else {
        let mut not_found = Response::new(Body::from("not found"));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        not_found
    };
    Ok(resp)
}

/// Serves `/metrics` until `shutdown` resolves.
pub async fn serve_metrics<F>(addr: SocketAddr, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(serve_req)) });
    info!("metrics server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
}
