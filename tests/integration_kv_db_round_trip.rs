//! End-to-end key-value and db plane round trips over real TCP
//! connections against the in-memory server harness.

use fabric_store_core::batch::Batch;
use fabric_store_core::config::{Configuration, SemanticsTemplate, ServerAddr};
use fabric_store_core::context::ClientContext;
use fabric_store_core::db::{Comparator, DbFacade, DbValue, Selector};
use fabric_store_core::distribution::DistributionStrategy;
use fabric_store_core::kv::KvFacade;
use fabric_store_core::server::InMemoryServer;
use std::sync::Arc;

async fn spawn_servers(n: usize) -> Vec<ServerAddr> {
    let mut addrs = Vec::with_capacity(n);
    for _ in 0..n {
        let server = Arc::new(InMemoryServer::new());
        let addr = server.serve("127.0.0.1:0").await.unwrap();
        addrs.push(ServerAddr {
            host: addr.ip().to_string(),
            port: addr.port(),
        });
    }
    addrs
}

fn kv_context(servers: Vec<ServerAddr>) -> Arc<ClientContext> {
    let config = Configuration {
        object_servers: vec![],
        kv_servers: servers,
        db_servers: vec![],
        max_connections: 4,
        stripe_size: 4096,
        distribution: DistributionStrategy::round_robin(4096),
        semantics: SemanticsTemplate::default(),
    };
    ClientContext::new(config)
}

fn db_context(servers: Vec<ServerAddr>) -> Arc<ClientContext> {
    let config = Configuration {
        object_servers: vec![],
        kv_servers: vec![],
        db_servers: servers,
        max_connections: 4,
        stripe_size: 4096,
        distribution: DistributionStrategy::round_robin(4096),
        semantics: SemanticsTemplate::default(),
    };
    ClientContext::new(config)
}

#[tokio::test]
async fn kv_put_get_delete_round_trips_across_a_fleet() {
    let ctx = kv_context(spawn_servers(3).await);

    let mut batch = Batch::new(ctx.clone());
    KvFacade::put(&mut batch, "ns", "alpha", b"first".to_vec()).unwrap();
    KvFacade::put(&mut batch, "ns", "beta", b"second".to_vec()).unwrap();
    let alpha = KvFacade::get(&mut batch, "ns", "alpha").unwrap();
    let beta = KvFacade::get(&mut batch, "ns", "beta").unwrap();
    let result = batch.execute().await;
    assert!(result.ok, "{:?}", result.errors);
    assert_eq!(alpha.lock().as_deref(), Some(b"first".as_slice()));
    assert_eq!(beta.lock().as_deref(), Some(b"second".as_slice()));

    let mut delete_batch = Batch::new(ctx.clone());
    KvFacade::delete(&mut delete_batch, "ns", "alpha").unwrap();
    assert!(delete_batch.execute().await.ok);

    let mut verify_batch = Batch::new(ctx.clone());
    let missing = KvFacade::get(&mut verify_batch, "ns", "alpha").unwrap();
    assert!(verify_batch.execute().await.ok);
    assert!(missing.lock().is_none());
}

#[tokio::test]
async fn kv_get_of_unknown_key_is_none_not_an_error() {
    let ctx = kv_context(spawn_servers(2).await);
    let mut batch = Batch::new(ctx);
    let missing = KvFacade::get(&mut batch, "ns", "never-put").unwrap();
    let result = batch.execute().await;
    assert!(result.ok, "{:?}", result.errors);
    assert!(missing.lock().is_none());
}

#[tokio::test]
async fn db_insert_and_iterate_selects_matching_rows() {
    let ctx = db_context(spawn_servers(2).await);

    let mut batch = Batch::new(ctx.clone());
    DbFacade::insert(
        &mut batch,
        "ns",
        "people",
        vec![
            ("name".to_string(), DbValue::Text("ada".into())),
            ("age".to_string(), DbValue::Integer(30)),
        ],
    )
    .unwrap();
    DbFacade::insert(
        &mut batch,
        "ns",
        "people",
        vec![
            ("name".to_string(), DbValue::Text("grace".into())),
            ("age".to_string(), DbValue::Integer(40)),
        ],
    )
    .unwrap();
    assert!(batch.execute().await.ok);

    let mut query_batch = Batch::new(ctx.clone());
    let rows = DbFacade::iterate(
        &mut query_batch,
        "ns",
        "people",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("ada".into())),
    )
    .unwrap();
    let result = query_batch.execute().await;
    assert!(result.ok, "{:?}", result.errors);
    let rows = rows.lock();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("age"), Some(&DbValue::Integer(30)));
}

#[tokio::test]
async fn db_update_then_delete_mutates_matching_rows_only() {
    let ctx = db_context(spawn_servers(2).await);

    let mut insert_batch = Batch::new(ctx.clone());
    DbFacade::insert(
        &mut insert_batch,
        "ns",
        "widgets",
        vec![("name".to_string(), DbValue::Text("w1".into())), ("count".to_string(), DbValue::Integer(1))],
    )
    .unwrap();
    DbFacade::insert(
        &mut insert_batch,
        "ns",
        "widgets",
        vec![("name".to_string(), DbValue::Text("w2".into())), ("count".to_string(), DbValue::Integer(1))],
    )
    .unwrap();
    assert!(insert_batch.execute().await.ok);

    let mut update_batch = Batch::new(ctx.clone());
    DbFacade::update(
        &mut update_batch,
        "ns",
        "widgets",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("w1".into())),
        vec![("count".to_string(), DbValue::Integer(99))],
    )
    .unwrap();
    assert!(update_batch.execute().await.ok);

    let mut verify_batch = Batch::new(ctx.clone());
    let w1 = DbFacade::iterate(
        &mut verify_batch,
        "ns",
        "widgets",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("w1".into())),
    )
    .unwrap();
    let w2 = DbFacade::iterate(
        &mut verify_batch,
        "ns",
        "widgets",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("w2".into())),
    )
    .unwrap();
    assert!(verify_batch.execute().await.ok);
    assert_eq!(w1.lock()[0].get("count"), Some(&DbValue::Integer(99)));
    assert_eq!(w2.lock()[0].get("count"), Some(&DbValue::Integer(1)));

    let mut delete_batch = Batch::new(ctx.clone());
    DbFacade::delete(
        &mut delete_batch,
        "ns",
        "widgets",
        Selector::new().and("name", Comparator::Eq, DbValue::Text("w2".into())),
    )
    .unwrap();
    assert!(delete_batch.execute().await.ok);

    let mut final_batch = Batch::new(ctx.clone());
    let remaining = DbFacade::iterate(&mut final_batch, "ns", "widgets", Selector::new()).unwrap();
    assert!(final_batch.execute().await.ok);
    assert_eq!(remaining.lock().len(), 1);
}
