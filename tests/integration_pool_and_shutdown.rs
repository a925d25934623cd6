//! Exercises the connection pool's cap enforcement and graceful-shutdown
//! handling against a real in-memory server over TCP, rather than the
//! synthetic ping server `pool::tests` uses.

use fabric_store_core::batch::Batch;
use fabric_store_core::config::{Configuration, SemanticsTemplate, ServerAddr};
use fabric_store_core::context::ClientContext;
use fabric_store_core::distribution::DistributionStrategy;
use fabric_store_core::kv::KvFacade;
use fabric_store_core::server::InMemoryServer;
use std::sync::Arc;

async fn spawn_server() -> ServerAddr {
    let server = Arc::new(InMemoryServer::new());
    let addr = server.serve("127.0.0.1:0").await.unwrap();
    ServerAddr {
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

fn kv_context(servers: Vec<ServerAddr>, max_connections: usize) -> Arc<ClientContext> {
    let config = Configuration {
        object_servers: vec![],
        kv_servers: servers,
        db_servers: vec![],
        max_connections,
        stripe_size: 4096,
        distribution: DistributionStrategy::round_robin(4096),
        semantics: SemanticsTemplate::default(),
    };
    ClientContext::new(config)
}

#[tokio::test]
async fn concurrent_batches_never_build_more_endpoints_than_the_cap() {
    let ctx = kv_context(vec![spawn_server().await], 2);

    let mut handles = Vec::new();
    for i in 0..8 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut batch = Batch::new(ctx);
            KvFacade::put(&mut batch, "ns", format!("key-{i}"), vec![i as u8]).unwrap();
            batch.execute().await
        }));
    }
    for h in handles {
        assert!(h.await.unwrap().ok);
    }
}

#[tokio::test]
async fn batch_after_pool_shutdown_surfaces_a_transport_error_not_a_hang() {
    let ctx = kv_context(vec![spawn_server().await], 2);

    let mut warm_batch = Batch::new(ctx.clone());
    KvFacade::put(&mut warm_batch, "ns", "k", b"v".to_vec()).unwrap();
    assert!(warm_batch.execute().await.ok);

    ctx.pool().shutdown().await;

    let mut batch = Batch::new(ctx.clone());
    let got = KvFacade::get(&mut batch, "ns", "k").unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), batch.execute())
        .await
        .expect("batch execute must not hang after pool shutdown");
    // The pool rebuilds a fresh endpoint on demand; a shutdown only drains
    // what was pooled, it does not disable the pool.
    assert!(result.ok, "{:?}", result.errors);
    assert_eq!(got.lock().as_deref(), Some(b"v".as_slice()));
}
