//! # Command-line interface
//!
//! Argument parsing for the `fabric-storectl` diagnostics binary: one
//! `Args` struct, `#[arg(...)]` per field, and a `From<&Args>` conversion
//! into this crate's own [`crate::config::ConfigurationBuilder`] overrides.

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Styles};
use clap::{Parser, Subcommand};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Diagnostics CLI for the storage client core — not an end-user data
/// path, just enough surface to drive the batch engine against a real or
/// in-memory server for manual testing.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to a TOML configuration file (layered under defaults, above by env vars).
    #[arg(short = 'f', long, help_heading = "Configuration")]
    pub config_file: Option<PathBuf>,

    /// Object server address, `host:port`. May be repeated.
    #[arg(long = "object-server", help_heading = "Configuration")]
    pub object_servers: Vec<String>,

    /// KV server address, `host:port`. May be repeated.
    #[arg(long = "kv-server", help_heading = "Configuration")]
    pub kv_servers: Vec<String>,

    /// DB server address, `host:port`. May be repeated.
    #[arg(long = "db-server", help_heading = "Configuration")]
    pub db_servers: Vec<String>,

    /// Per-server connection pool cap.
    #[arg(long, help_heading = "Configuration")]
    pub max_connections: Option<usize>,

    /// Round-robin distribution block size, in bytes.
    #[arg(long, help_heading = "Configuration")]
    pub stripe_size: Option<u64>,

    /// Increase diagnostic log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start an in-memory server harness and exit on Ctrl-C.
    Serve {
        /// Address to bind, e.g. `127.0.0.1:9000`.
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: String,
    },
    /// Pool liveness check: opens a connection to every configured server
    /// and sends a `Ping`, reporting pass/fail per server.
    Ping,
    /// Spin up an in-memory server (for any plane left unconfigured) and
    /// exercise an object create/write/read round trip, reporting pass/fail.
    ObjectRoundtrip,
    /// Spin up an in-memory server (for any plane left unconfigured) and
    /// exercise a kv put/get round trip, reporting pass/fail.
    KvRoundtrip,
    /// Spin up an in-memory server (for any plane left unconfigured) and
    /// exercise a db insert/iterate round trip, reporting pass/fail.
    DbRoundtrip,
}
