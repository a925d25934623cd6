//! `fabric-storectl` — a developer-facing diagnostics binary for the
//! storage client core. Not an end-user data path: it
//! exists to let a developer start an in-memory server harness, or run a
//! scripted self-test against one, from the command line.

use std::sync::Arc;

use clap::Parser;
use fabric_store_core::batch::Batch;
use fabric_store_core::cli::{Args, Command};
use fabric_store_core::config::ConfigurationBuilder;
use fabric_store_core::context::ClientContext;
use fabric_store_core::db::{Comparator, DbFacade, DbValue, Selector};
use fabric_store_core::kv::KvFacade;
use fabric_store_core::logging;
use fabric_store_core::object::ObjectFacade;
use fabric_store_core::pool::BackendKind;
use fabric_store_core::server::InMemoryServer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    match args.command.clone() {
        Command::Serve { bind } => run_serve(&bind).await,
        Command::Ping => run_ping(&args).await,
        Command::ObjectRoundtrip => run_object_roundtrip(&args).await,
        Command::KvRoundtrip => run_kv_roundtrip(&args).await,
        Command::DbRoundtrip => run_db_roundtrip(&args).await,
    }
}

/// Which backend planes a subcommand actually talks to — controls which
/// in-memory servers [`build_context`] bothers spinning up for a plane left
/// unconfigured on the command line.
struct Planes {
    object: bool,
    kv: bool,
    db: bool,
}

impl Planes {
    const ALL: Self = Self { object: true, kv: true, db: true };
    const OBJECT: Self = Self { object: true, kv: false, db: false };
    const KV: Self = Self { object: false, kv: true, db: false };
    const DB: Self = Self { object: false, kv: false, db: true };
}

async fn run_serve(bind: &str) -> anyhow::Result<()> {
    let server = Arc::new(InMemoryServer::new());
    let addr = server.serve(bind).await?;
    info!(%addr, "serving, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Wires a [`ClientContext`] at either the server addresses passed on the
/// command line or, for any plane the invoked subcommand actually uses and
/// left unspecified, a freshly spun-up in-memory server. A plane `planes`
/// doesn't mark as needed is left empty rather than given a server it will
/// never talk to.
async fn build_context(args: &Args, planes: &Planes) -> anyhow::Result<Arc<ClientContext>> {
    let object_servers = if args.object_servers.is_empty() && planes.object {
        vec![Arc::new(InMemoryServer::new()).serve("127.0.0.1:0").await?.to_string()]
    } else {
        args.object_servers.clone()
    };
    let kv_servers = if args.kv_servers.is_empty() && planes.kv {
        vec![Arc::new(InMemoryServer::new()).serve("127.0.0.1:0").await?.to_string()]
    } else {
        args.kv_servers.clone()
    };
    let db_servers = if args.db_servers.is_empty() && planes.db {
        vec![Arc::new(InMemoryServer::new()).serve("127.0.0.1:0").await?.to_string()]
    } else {
        args.db_servers.clone()
    };

    let mut builder = ConfigurationBuilder::new()
        .object_servers(object_servers)
        .kv_servers(kv_servers)
        .db_servers(db_servers);
    if let Some(path) = &args.config_file {
        builder = builder.with_file(path)?;
    }
    builder = builder.with_env();
    if let Some(max_connections) = args.max_connections {
        builder = builder.max_connections(max_connections);
    }
    if let Some(stripe_size) = args.stripe_size {
        builder = builder.stripe_size(stripe_size);
    }
    let config = builder.build()?;
    Ok(ClientContext::new(config))
}

/// Pool liveness check: pings every configured server on every plane,
/// reporting pass/fail per server rather than aggregating into one
/// overall verdict.
async fn run_ping(args: &Args) -> anyhow::Result<()> {
    let ctx = build_context(args, &Planes::ALL).await?;
    let mut all_ok = true;
    for kind in [BackendKind::Object, BackendKind::Kv, BackendKind::Db] {
        for index in 0..ctx.pool().server_count(kind) {
            let ping = fabric_store_core::codec::Message::request(fabric_store_core::codec::MessageType::Ping, 0);
            let result = ctx.rpc(kind, index, ping).await;
            println!("ping {kind:?}[{index}]: {}", if result.is_ok() { "ok" } else { "FAILED" });
            all_ok &= result.is_ok();
        }
    }
    if !all_ok {
        anyhow::bail!("one or more servers failed to respond to ping");
    }
    Ok(())
}

async fn run_object_roundtrip(args: &Args) -> anyhow::Result<()> {
    let ctx = build_context(args, &Planes::OBJECT).await?;
    let mut batch = Batch::new(ctx);
    ObjectFacade::create(&mut batch, "diagnostics", "probe")?;
    let written = ObjectFacade::write(&mut batch, "diagnostics", "probe", 0, b"hello, fabric".to_vec())?;
    let read = ObjectFacade::read(&mut batch, "diagnostics", "probe", 0, 13)?;
    let result = batch.execute().await;
    println!(
        "object round trip: {} (wrote {} bytes, read back {:?})",
        if result.ok { "ok" } else { "FAILED" },
        *written.lock(),
        String::from_utf8_lossy(&read.lock())
    );
    if !result.ok {
        anyhow::bail!("object round trip failed: {:?}", result.errors);
    }
    Ok(())
}

async fn run_kv_roundtrip(args: &Args) -> anyhow::Result<()> {
    let ctx = build_context(args, &Planes::KV).await?;
    let mut batch = Batch::new(ctx);
    KvFacade::put(&mut batch, "diagnostics", "greeting", b"hi".to_vec())?;
    let got = KvFacade::get(&mut batch, "diagnostics", "greeting")?;
    let result = batch.execute().await;
    println!(
        "kv round trip: {} (got {:?})",
        if result.ok { "ok" } else { "FAILED" },
        got.lock().as_ref().map(|v| String::from_utf8_lossy(v).to_string())
    );
    if !result.ok {
        anyhow::bail!("kv round trip failed: {:?}", result.errors);
    }
    Ok(())
}

async fn run_db_roundtrip(args: &Args) -> anyhow::Result<()> {
    let ctx = build_context(args, &Planes::DB).await?;
    let mut batch = Batch::new(ctx);
    DbFacade::insert(
        &mut batch,
        "diagnostics",
        "probes",
        vec![("name".to_string(), DbValue::Text("probe-1".into()))],
    )?;
    let rows = DbFacade::iterate(
        &mut batch,
        "diagnostics",
        "probes",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("probe-1".into())),
    )?;
    let result = batch.execute().await;
    println!(
        "db round trip: {} (found {} row(s))",
        if result.ok { "ok" } else { "FAILED" },
        rows.lock().len()
    );
    if !result.ok {
        anyhow::bail!("db round trip failed: {:?}", result.errors);
    }
    Ok(())
}
