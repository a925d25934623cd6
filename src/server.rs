//! # In-memory server harness
//!
//! A minimal async TCP listener that speaks the same wire protocol the
//! client side does, backed by the `InMemory*Backend` stand-ins — a real durable backend is
//! out of scope, but the wire protocol and request dispatch are not. Used
//! by the diagnostics binary's self-test
//! mode and by the integration test suite to exercise the full
//! client/server round trip without any external process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::backend::{DataBackend, DbBackend, InMemoryDataBackend, InMemoryDbBackend, InMemoryKvBackend, KvBackend};
use crate::codec::{Message, MessageBuilderExt, MessageReader, MessageType};
use crate::db::{DbRow, DbValue, Schema};
use crate::error::{CoreError, CoreResult};
use crate::transport::{Endpoint, ProtectionDomain};

/// Cursor mode tag carried in a `DbIterate` request body: there is no
/// dedicated "next"/"close" message type on the wire (§6 fixes the set of
/// message types), so the cursor protocol is multiplexed over the one
/// `DbIterate` type by a leading mode tag instead.
const CURSOR_MODE_START: u32 = 0;
const CURSOR_MODE_NEXT: u32 = 1;
const CURSOR_MODE_CLOSE: u32 = 2;

/// One listening server backed by all three in-memory stores. Real
/// deployments run one process per backend kind; the harness folds them
/// into a single listener per bound address since the wire protocol
/// already disambiguates by message type.
pub struct InMemoryServer {
    data: Arc<InMemoryDataBackend>,
    kv: Arc<InMemoryKvBackend>,
    db: Arc<InMemoryDbBackend>,
    /// Open `DbIterate` cursors, keyed by the opaque token handed back in
    /// the `start` reply. Each cursor holds the rows still owed to the
    /// client; `next` pops one, `close` drops the entry outright.
    cursors: Mutex<HashMap<u64, VecDeque<DbRow>>>,
    next_cursor: AtomicU64,
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self {
            data: Arc::new(InMemoryDataBackend::new()),
            kv: Arc::new(InMemoryKvBackend::new()),
            db: Arc::new(InMemoryDbBackend::new()),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        }
    }

    /// Binds `addr` and serves forever, spawning one task per connection.
    /// Returns the bound address so callers that asked for port 0 can
    /// discover the ephemeral port that was actually chosen.
    pub async fn serve(self: Arc<Self>, addr: &str) -> CoreResult<std::net::SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!(%bound, "in-memory server listening");

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    warn!("listener accept failed, stopping");
                    break;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_connection(stream, peer).await;
                });
            }
        });

        Ok(bound)
    }

    async fn handle_connection(&self, stream: TcpStream, peer: std::net::SocketAddr) {
        let mut endpoint = Endpoint::from_stream(stream, Arc::new(ProtectionDomain { server: peer }));
        loop {
            let request = match endpoint.receive().await {
                Ok(request) => request,
                Err(e) => {
                    debug!(%peer, error = %e, "connection closed");
                    break;
                }
            };
            let reply = self.dispatch(&request).await;
            if let Some(reply) = reply {
                if endpoint.send(&reply).await.is_err() {
                    break;
                }
            }
        }
        endpoint.close(false).await;
    }

    /// Runs the requested operation and builds its reply, unless the
    /// request is an object create or KV delete sent without
    /// `SAFETY_NETWORK` — those are fire-and-forget on the wire, so no
    /// reply is sent at all (the peer isn't waiting on one).
    async fn dispatch(&self, request: &Message) -> Option<Message> {
        let skip_reply = matches!(request.message_type, MessageType::DataCreate | MessageType::KvDelete)
            && !request.has_safety_network();

        let mut reader = MessageReader::new(&request.body);
        let body = match self.handle_operation(request.message_type, &mut reader).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "operation failed, replying with empty body");
                BytesMut::new()
            }
        };

        if skip_reply {
            return None;
        }

        let mut reply = Message::reply_to(request);
        reply.add_operation(&body);
        Some(reply)
    }

    async fn handle_operation(&self, message_type: MessageType, reader: &mut MessageReader<'_>) -> CoreResult<BytesMut> {
        let mut out = BytesMut::new();
        match message_type {
            MessageType::Ping => {}

            MessageType::DataCreate => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                self.data.create(&namespace, &name).await?;
            }
            MessageType::DataDelete => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                self.data.delete(&namespace, &name).await?;
            }
            MessageType::DataRead => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                let offset = reader.get_8()?;
                let length = reader.get_8()?;
                let bytes = self.data.read(&namespace, &name, offset, length).await?;
                out.append_bytes(&bytes);
            }
            MessageType::DataWrite => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                let offset = reader.get_8()?;
                let data = reader.get_bytes()?;
                let written = self.data.write(&namespace, &name, offset, &data).await?;
                out.append_8(written);
            }
            MessageType::DataStatus => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                match self.data.status(&namespace, &name).await {
                    Ok(status) => {
                        out.append_4(1);
                        out.append_8(status.size);
                        out.append_8(status.modification_time);
                    }
                    Err(_) => {
                        out.append_4(0);
                    }
                }
            }

            MessageType::KvPut => {
                let namespace = reader.get_string()?;
                let key = reader.get_string()?;
                let value = reader.get_bytes()?;
                self.kv.put(&namespace, &key, value).await?;
            }
            MessageType::KvGet => {
                let namespace = reader.get_string()?;
                let key = reader.get_string()?;
                match self.kv.get(&namespace, &key).await? {
                    Some(value) => {
                        out.append_4(1);
                        out.append_bytes(&value);
                    }
                    None => {
                        out.append_4(0);
                    }
                }
            }
            MessageType::KvDelete => {
                let namespace = reader.get_string()?;
                let key = reader.get_string()?;
                self.kv.delete(&namespace, &key).await?;
            }

            MessageType::DbInsert => {
                let namespace = reader.get_string()?;
                let schema = reader.get_string()?;
                let fields = read_fields(reader)?;
                self.db
                    .schema_create(&namespace, &schema, Schema::default())
                    .await
                    .ok();
                self.db.insert(&namespace, &schema, fields).await?;
            }
            MessageType::DbUpdate => {
                let namespace = reader.get_string()?;
                let schema = reader.get_string()?;
                let selector = crate::db::Selector::decode_wire(reader)?;
                let fields = read_fields(reader)?;
                let updated = self.db.update(&namespace, &schema, &selector, fields).await?;
                out.append_8(updated);
            }
            MessageType::DbDelete => {
                let namespace = reader.get_string()?;
                let schema = reader.get_string()?;
                let selector = crate::db::Selector::decode_wire(reader)?;
                let deleted = self.db.delete(&namespace, &schema, &selector).await?;
                out.append_8(deleted);
            }
            MessageType::DbIterate => {
                let mode = reader.get_4()?;
                match mode {
                    CURSOR_MODE_START => {
                        let namespace = reader.get_string()?;
                        let schema = reader.get_string()?;
                        let selector = crate::db::Selector::decode_wire(reader)?;
                        let rows = self.db.iterate(&namespace, &schema, &selector).await?;
                        let mut queue: VecDeque<DbRow> = rows.into();
                        let first = queue.pop_front();
                        let token = self.next_cursor.fetch_add(1, Ordering::Relaxed);
                        // Only tracked while rows remain: an already-exhausted
                        // cursor needs no entry and therefore no later close.
                        if !queue.is_empty() {
                            self.cursors.lock().insert(token, queue);
                        }
                        out.append_8(token);
                        write_row_slot(&mut out, first.as_ref());
                    }
                    CURSOR_MODE_NEXT => {
                        let token = reader.get_8()?;
                        let mut cursors = self.cursors.lock();
                        let (row, now_empty) = match cursors.get_mut(&token) {
                            Some(queue) => (queue.pop_front(), queue.is_empty()),
                            None => (None, true),
                        };
                        if now_empty {
                            cursors.remove(&token);
                        }
                        drop(cursors);
                        write_row_slot(&mut out, row.as_ref());
                    }
                    CURSOR_MODE_CLOSE => {
                        let token = reader.get_8()?;
                        self.cursors.lock().remove(&token);
                    }
                    other => return Err(CoreError::Protocol(format!("unknown db cursor mode {other}"))),
                }
            }

            MessageType::MetaGet => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                match self.db.meta_get(&namespace, &name).await? {
                    Some(value) => {
                        out.append_4(1);
                        out.append_bytes(&value);
                    }
                    None => {
                        out.append_4(0);
                    }
                }
            }
            MessageType::MetaPut => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                let value = reader.get_bytes()?;
                self.db.meta_put(&namespace, &name, value).await?;
            }
            MessageType::MetaDelete => {
                let namespace = reader.get_string()?;
                let name = reader.get_string()?;
                self.db.meta_delete(&namespace, &name).await?;
            }
        }
        Ok(out)
    }
}

fn read_fields(reader: &mut MessageReader<'_>) -> CoreResult<Vec<(String, DbValue)>> {
    let count = reader.get_4()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = reader.get_string()?;
        fields.push((name, DbValue::decode_wire(reader)?));
    }
    Ok(fields)
}

fn write_row(out: &mut BytesMut, row: &DbRow) {
    out.append_4(row.fields.len() as u32);
    for (name, value) in &row.fields {
        out.append_string(name);
        value.encode_wire(out);
    }
}

/// Writes a `row_present` flag followed by the row itself when present,
/// the shape shared by every cursor reply (`start`'s first row, each
/// `next`'s row).
fn write_row_slot(out: &mut BytesMut, row: Option<&DbRow>) {
    match row {
        Some(row) => {
            out.append_4(1);
            write_row(out, row);
        }
        None => {
            out.append_4(0);
        }
    }
}
