//! # Client context
//!
//! The single owned handle a caller threads through every [`crate::batch::Batch`]:
//! validated configuration, the connection pool, the lock client, and the
//! small amount of per-object client-side cache state (the "created"
//! bitmap and the status freshness cache). One injectable, `Arc`-shared
//! struct in place of implicit process-wide pool/fabric/domain globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::ObjectStatusValue;
use crate::codec::{Message, MessageType};
use crate::config::Configuration;
use crate::error::CoreResult;
use crate::lock::LockClient;
use crate::pool::{BackendKind, ConnectionPool};

/// How long a cached [`ObjectStatusValue`] is trusted before a refetch is
/// forced regardless of the batch's consistency setting.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(1);

struct ObjectState {
    /// One flag per object server: has `create` been observed to succeed
    /// on that server yet. Sized lazily to the object server count on
    /// first touch.
    created: Vec<bool>,
    status: Option<(Instant, ObjectStatusValue)>,
}

/// Everything a batch needs to reach the network and to remember what it
/// has already told the network.
pub struct ClientContext {
    config: Configuration,
    pool: ConnectionPool,
    locks: LockClient,
    objects: RwLock<HashMap<(String, String), ObjectState>>,
}

impl ClientContext {
    pub fn new(config: Configuration) -> Arc<Self> {
        let pool = ConnectionPool::new(&config);
        Arc::new(Self {
            config,
            pool,
            locks: LockClient::new(),
            objects: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn locks(&self) -> &LockClient {
        &self.locks
    }

    /// Sends one request and awaits its reply on a pooled endpoint for
    /// `(kind, server_index)`, returning the endpoint to the pool on
    /// success and closing it on any transport failure.
    pub async fn rpc(&self, kind: BackendKind, server_index: usize, message: Message) -> CoreResult<Message> {
        let mut endpoint = self.pool.pop(kind, server_index).await?;
        if let Err(e) = endpoint.send(&message).await {
            endpoint.close(false).await;
            return Err(e);
        }
        match endpoint.receive().await {
            Ok(reply) => {
                self.pool.push(kind, server_index, endpoint).await;
                Ok(reply)
            }
            Err(e) => {
                endpoint.close(false).await;
                Err(e)
            }
        }
    }

    /// Sends one request and, only when `message.has_safety_network()` is
    /// set, awaits and returns its reply; otherwise the request is
    /// fire-and-forget and the endpoint is returned to the pool as soon as
    /// the write completes. Used by the handful of operations the wire
    /// protocol allows to skip the round trip under relaxed safety —
    /// object create and KV delete — everything else that needs reply
    /// data keeps using [`Self::rpc`] unconditionally.
    pub async fn rpc_fire_and_forget_unless_safety_network(
        &self,
        kind: BackendKind,
        server_index: usize,
        message: Message,
    ) -> CoreResult<Option<Message>> {
        if message.has_safety_network() {
            return self.rpc(kind, server_index, message).await.map(Some);
        }

        let mut endpoint = self.pool.pop(kind, server_index).await?;
        if let Err(e) = endpoint.send(&message).await {
            endpoint.close(false).await;
            return Err(e);
        }
        self.pool.push(kind, server_index, endpoint).await;
        Ok(None)
    }

    /// Best-effort flush: pings every configured object server, swallowing
    /// any failure. Persistency's `immediate`/`eventual` distinction is
    /// about *when* this runs relative to a batch's runs, not about a
    /// dedicated wire message — there is no durable-storage backend behind
    /// the in-memory harness for this to meaningfully block on (Open
    /// Question, see DESIGN.md).
    pub async fn best_effort_sync(&self) {
        for index in 0..self.pool.server_count(BackendKind::Object) {
            let ping = Message::request(MessageType::Ping, 0);
            if let Err(e) = self.rpc(BackendKind::Object, index, ping).await {
                debug!(index, error = %e, "best-effort sync ping failed, ignoring");
            }
        }
    }

    fn object_key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    pub fn is_created(&self, namespace: &str, name: &str, server_index: usize) -> bool {
        self.objects
            .read()
            .get(&Self::object_key(namespace, name))
            .and_then(|s| s.created.get(server_index))
            .copied()
            .unwrap_or(false)
    }

    pub fn mark_created(&self, namespace: &str, name: &str, server_index: usize, server_count: usize) {
        let mut objects = self.objects.write();
        let state = objects.entry(Self::object_key(namespace, name)).or_insert_with(|| ObjectState {
            created: vec![false; server_count],
            status: None,
        });
        if state.created.len() < server_count {
            state.created.resize(server_count, false);
        }
        if let Some(slot) = state.created.get_mut(server_index) {
            *slot = true;
        }
    }

    pub fn forget_object(&self, namespace: &str, name: &str) {
        self.objects.write().remove(&Self::object_key(namespace, name));
    }

    /// Returns a cached status if it is younger than [`STATUS_CACHE_TTL`]
    /// and `force_refresh` (set for `consistency = immediate`) is false.
    pub fn cached_status(&self, namespace: &str, name: &str, force_refresh: bool) -> Option<ObjectStatusValue> {
        if force_refresh {
            return None;
        }
        let objects = self.objects.read();
        let state = objects.get(&Self::object_key(namespace, name))?;
        let (fetched_at, value) = state.status?;
        if fetched_at.elapsed() < STATUS_CACHE_TTL {
            Some(value)
        } else {
            None
        }
    }

    pub fn cache_status(&self, namespace: &str, name: &str, value: ObjectStatusValue) {
        let mut objects = self.objects.write();
        let state = objects.entry(Self::object_key(namespace, name)).or_insert_with(|| ObjectState {
            created: Vec::new(),
            status: None,
        });
        state.status = Some((Instant::now(), value));
    }
}
