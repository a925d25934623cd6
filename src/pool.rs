//! # Connection pool
//!
//! Bounded per-server endpoint queues with lazy creation, a liveness check
//! on every freshly built endpoint, and graceful-shutdown detection on pop.
//! An async-aware FIFO guarded by a `tokio::sync::Mutex` plus a `Notify` to
//! wake blocked poppers, per server per backend kind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::codec::{Message, MessageType};
use crate::config::Configuration;
use crate::error::{CoreError, CoreResult};
use crate::transport::Endpoint;

/// Which server fleet a pooled endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Object,
    Kv,
    Db,
}

impl BackendKind {
    fn label(self) -> &'static str {
        match self {
            BackendKind::Object => "object",
            BackendKind::Kv => "kv",
            BackendKind::Db => "db",
        }
    }
}

struct ServerQueue {
    entries: Mutex<VecDeque<Endpoint>>,
    notify: Notify,
    /// Endpoints ever created for this server, not the current queue depth.
    count: AtomicU32,
    host: String,
    port: u16,
}

impl ServerQueue {
    fn new(host: String, port: u16) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            count: AtomicU32::new(0),
            host,
            port,
        }
    }
}

/// One pool per client context, parameterized by `max_per_server` and by
/// three arrays of per-server queues.
pub struct ConnectionPool {
    max_per_server: u32,
    object: Vec<ServerQueue>,
    kv: Vec<ServerQueue>,
    db: Vec<ServerQueue>,
}

impl ConnectionPool {
    pub fn new(config: &Configuration) -> Self {
        let build = |servers: &[crate::config::ServerAddr]| {
            servers
                .iter()
                .map(|s| ServerQueue::new(s.host.clone(), s.port))
                .collect()
        };
        Self {
            max_per_server: config.max_connections as u32,
            object: build(&config.object_servers),
            kv: build(&config.kv_servers),
            db: build(&config.db_servers),
        }
    }

    fn queues(&self, kind: BackendKind) -> &[ServerQueue] {
        match kind {
            BackendKind::Object => &self.object,
            BackendKind::Kv => &self.kv,
            BackendKind::Db => &self.db,
        }
    }

    pub fn server_count(&self, kind: BackendKind) -> usize {
        self.queues(kind).len()
    }

    /// Pop(kind, index) contract:
    /// 1. Take a free entry if one exists, discarding any that show a
    ///    shutdown condition and retrying.
    /// 2. Otherwise, if under cap, build and liveness-check a fresh
    ///    endpoint.
    /// 3. Otherwise, wait for an entry to be pushed back.
    pub async fn pop(&self, kind: BackendKind, index: usize) -> CoreResult<Endpoint> {
        let queue = self
            .queues(kind)
            .get(index)
            .ok_or_else(|| CoreError::Config(format!("no {} server at index {index}", kind.label())))?;

        loop {
            {
                let mut entries = queue.entries.lock().await;
                while let Some(endpoint) = entries.pop_front() {
                    if endpoint.is_shutdown() {
                        warn!(backend = kind.label(), index, "discarding shut-down endpoint from pool");
                        endpoint.close(false).await;
                        continue;
                    }
                    return Ok(endpoint);
                }
            }

            // No free entry. Try to claim a fresh build slot.
            let prev = queue.count.fetch_add(1, Ordering::AcqRel);
            if prev < self.max_per_server {
                debug!(backend = kind.label(), index, "building new pooled endpoint");
                match self.build_and_check(queue).await {
                    Ok(endpoint) => return Ok(endpoint),
                    Err(e) => {
                        queue.count.fetch_sub(1, Ordering::AcqRel);
                        return Err(e);
                    }
                }
            } else {
                queue.count.fetch_sub(1, Ordering::AcqRel);
            }

            // Cap reached: wait for a push, then loop back to step 1.
            queue.notify.notified().await;
        }
    }

    async fn build_and_check(&self, queue: &ServerQueue) -> CoreResult<Endpoint> {
        let mut endpoint = Endpoint::connect(&queue.host, queue.port).await?;
        let ping = Message::request(MessageType::Ping, 0);
        endpoint.send(&ping).await?;
        endpoint.receive().await?;
        Ok(endpoint)
    }

    /// Always-non-blocking FIFO push, waking exactly one blocked popper.
    pub async fn push(&self, kind: BackendKind, index: usize, endpoint: Endpoint) {
        if let Some(queue) = self.queues(kind).get(index) {
            queue.entries.lock().await.push_back(endpoint);
            queue.notify.notify_one();
        }
    }

    /// Drains every queue. If any drained endpoint already shows a
    /// shutdown condition, the server initiated the tear-down and no
    /// client-initiated shutdown message is sent on the rest; otherwise
    /// every endpoint is asked to send its own shutdown frame before
    /// closing.
    pub async fn shutdown(&self) {
        let mut server_initiated = false;
        let mut first = true;

        for queue in self.object.iter().chain(self.kv.iter()).chain(self.db.iter()) {
            let mut entries = queue.entries.lock().await;
            while let Some(endpoint) = entries.pop_front() {
                if first {
                    server_initiated = endpoint.is_shutdown();
                    first = false;
                }
                endpoint.close(!server_initiated).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddr;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn spawn_ping_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut header = [0u8; crate::codec::HEADER_LEN];
                    loop {
                        use tokio::io::AsyncWriteExt;
                        if stream.read_exact(&mut header).await.is_err() {
                            break;
                        }
                        let Ok((req, body_len)) = Message::decode_header(&header) else {
                            break;
                        };
                        let mut body = vec![0u8; body_len as usize];
                        if stream.read_exact(&mut body).await.is_err() {
                            break;
                        }
                        let reply = Message::reply_to(&req);
                        if stream.write_all(&reply.encode()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    fn config_for(addr: std::net::SocketAddr, max_connections: usize) -> Configuration {
        Configuration {
            object_servers: vec![ServerAddr {
                host: addr.ip().to_string(),
                port: addr.port(),
            }],
            kv_servers: vec![],
            db_servers: vec![],
            max_connections,
            stripe_size: 4096,
            distribution: crate::distribution::DistributionStrategy::round_robin(4096),
            semantics: crate::config::SemanticsTemplate::default(),
        }
    }

    #[tokio::test]
    async fn pop_builds_and_liveness_checks_fresh_endpoints() {
        let (addr, _server) = spawn_ping_server().await;
        let pool = ConnectionPool::new(&config_for(addr, 2));
        let endpoint = pool.pop(BackendKind::Object, 0).await.unwrap();
        assert!(!endpoint.is_shutdown());
        pool.push(BackendKind::Object, 0, endpoint).await;
    }

    #[tokio::test]
    async fn pop_never_exceeds_cap_under_concurrent_load() {
        let (addr, _server) = spawn_ping_server().await;
        let pool = Arc::new(ConnectionPool::new(&config_for(addr, 2)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(300);
                while tokio::time::Instant::now() < deadline {
                    let endpoint = pool.pop(BackendKind::Object, 0).await.unwrap();
                    assert!(!endpoint.is_shutdown());
                    pool.push(BackendKind::Object, 0, endpoint).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(pool.object[0].count.load(Ordering::Acquire) <= 2);
    }
}
