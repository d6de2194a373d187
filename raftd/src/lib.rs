pub mod codec;
pub mod config;
pub mod error;
pub mod fiber;
pub mod kv;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod raft;
pub mod server;
pub mod store;

pub use error::{RaftError, Result};
