//! # Fabric Store Core
//!
//! The core of a distributed storage client: a batch/operation engine
//! over three data planes (object, key-value, db), a byte-range
//! distribution engine, and a connection pool that manages endpoint
//! lifecycle across all three. A real durable backend is out of scope
//! (`backend::InMemory*` stand-ins exist for the test and diagnostics
//! harness); the wire protocol, pooling, and distribution logic are not.

pub mod backend;
pub mod batch;
pub mod cli;
pub mod codec;
pub mod config;
pub mod context;
pub mod db;
pub mod distribution;
pub mod error;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod object;
pub mod pool;
pub mod server;
pub mod transport;

pub use batch::{Batch, BatchResult, Semantics};
pub use context::ClientContext;
pub use error::{CoreError, CoreResult};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
