//! # DB data plane
//!
//! Typed rows over a server-side schema: a schema fixes a row's field
//! names and types, a selector is a small conjunction of field
//! comparisons evaluated server-side, and iteration is backed by an
//! opaque server-side cursor token — [`DbCursor`] holds it for the
//! lifetime of one `iterate` call and releases it early via `Drop` if the
//! caller stops short of exhausting it.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::batch::{Batch, Operation, OperationPayload, Semantics};
use crate::codec::{Message, MessageBuilderExt, MessageReader, MessageType, SAFETY_NETWORK};
use crate::context::ClientContext;
use crate::error::{CoreError, CoreResult};
use crate::pool::BackendKind;

/// Cursor mode tag carried in a `DbIterate` request body — see
/// [`crate::server`]'s constants of the same name for the server-side
/// counterpart.
const CURSOR_MODE_START: u32 = 0;
const CURSOR_MODE_NEXT: u32 = 1;
const CURSOR_MODE_CLOSE: u32 = 2;

/// A typed field value — the db data plane is typed, unlike the kv
/// plane's opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl DbValue {
    fn tag(&self) -> u32 {
        match self {
            DbValue::Integer(_) => 0,
            DbValue::Float(_) => 1,
            DbValue::Text(_) => 2,
            DbValue::Blob(_) => 3,
        }
    }

    pub(crate) fn encode_wire(&self, body: &mut BytesMut) {
        body.append_4(self.tag());
        match self {
            DbValue::Integer(v) => body.append_8(*v as u64),
            DbValue::Float(v) => body.append_8(v.to_bits()),
            DbValue::Text(v) => body.append_string(v),
            DbValue::Blob(v) => body.append_bytes(v),
        };
    }

    pub(crate) fn decode_wire(reader: &mut MessageReader<'_>) -> CoreResult<Self> {
        Ok(match reader.get_4()? {
            0 => DbValue::Integer(reader.get_8()? as i64),
            1 => DbValue::Float(f64::from_bits(reader.get_8()?)),
            2 => DbValue::Text(reader.get_string()?),
            3 => DbValue::Blob(reader.get_bytes()?),
            other => return Err(CoreError::Protocol(format!("unknown db value tag {other}"))),
        })
    }
}

/// A schema field's declared type, used to validate inserts server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    Text,
    Blob,
}

/// The field names and types a `schema_create` call fixes for a named
/// table.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: Vec<(String, FieldType)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.fields.push((name.into(), kind));
        self
    }
}

/// One stored row: an ordered set of named field values.
#[derive(Debug, Clone, Default)]
pub struct DbRow {
    pub fields: Vec<(String, DbValue)>,
}

impl DbRow {
    pub fn get(&self, field: &str) -> Option<&DbValue> {
        self.fields.iter().find(|(name, _)| name == field).map(|(_, v)| v)
    }

    pub fn set(&mut self, field: &str, value: DbValue) {
        if let Some(entry) = self.fields.iter_mut().find(|(name, _)| name == field) {
            entry.1 = value;
        } else {
            self.fields.push((field.to_string(), value));
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A conjunction of field comparisons, evaluated against one row at a
/// time. The db executors run this server-side; the in-memory backend
/// evaluates it directly since it has no separate server process.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    clauses: Vec<(String, Comparator, DbValue)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, field: impl Into<String>, comparator: Comparator, value: DbValue) -> Self {
        self.clauses.push((field.into(), comparator, value));
        self
    }

    pub fn matches(&self, row: &DbRow) -> bool {
        self.clauses.iter().all(|(field, cmp, value)| {
            let Some(actual) = row.get(field) else {
                return false;
            };
            compare(actual, *cmp, value)
        })
    }

    pub(crate) fn encode_wire(&self, body: &mut BytesMut) {
        body.append_4(self.clauses.len() as u32);
        for (field, cmp, value) in &self.clauses {
            body.append_string(field);
            body.append_4(*cmp as u32);
            value.encode_wire(body);
        }
    }

    pub(crate) fn decode_wire(reader: &mut MessageReader<'_>) -> CoreResult<Self> {
        let count = reader.get_4()?;
        let mut clauses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let field = reader.get_string()?;
            let cmp = decode_comparator(reader.get_4()?)?;
            let value = DbValue::decode_wire(reader)?;
            clauses.push((field, cmp, value));
        }
        Ok(Self { clauses })
    }
}

fn decode_comparator(tag: u32) -> CoreResult<Comparator> {
    Ok(match tag {
        0 => Comparator::Eq,
        1 => Comparator::Ne,
        2 => Comparator::Lt,
        3 => Comparator::Le,
        4 => Comparator::Gt,
        5 => Comparator::Ge,
        other => return Err(CoreError::Protocol(format!("unknown comparator tag {other}"))),
    })
}

fn compare(actual: &DbValue, cmp: Comparator, expected: &DbValue) -> bool {
    let ordering = match (actual, expected) {
        (DbValue::Integer(a), DbValue::Integer(b)) => a.partial_cmp(b),
        (DbValue::Float(a), DbValue::Float(b)) => a.partial_cmp(b),
        (DbValue::Text(a), DbValue::Text(b)) => a.partial_cmp(b),
        (DbValue::Blob(a), DbValue::Blob(b)) => a.partial_cmp(b),
        _ => return matches!(cmp, Comparator::Ne),
    };
    let Some(ordering) = ordering else { return false };
    match cmp {
        Comparator::Eq => ordering.is_eq(),
        Comparator::Ne => !ordering.is_eq(),
        Comparator::Lt => ordering.is_lt(),
        Comparator::Le => ordering.is_le(),
        Comparator::Gt => ordering.is_gt(),
        Comparator::Ge => ordering.is_ge(),
    }
}

/// Result cell a facade hands the caller for `iterate`, populated once
/// the owning batch executes.
pub type RowsSlot = Arc<Mutex<Vec<DbRow>>>;

/// Builds db operations onto a batch.
pub struct DbFacade;

impl DbFacade {
    pub fn insert(
        batch: &mut Batch,
        namespace: impl Into<String>,
        schema: impl Into<String>,
        fields: Vec<(String, DbValue)>,
    ) -> CoreResult<()> {
        batch.add(Operation::new(
            OperationPayload::DbInsert {
                namespace: namespace.into(),
                schema: schema.into(),
                fields,
            },
            None,
        ))
    }

    pub fn update(
        batch: &mut Batch,
        namespace: impl Into<String>,
        schema: impl Into<String>,
        selector: Selector,
        fields: Vec<(String, DbValue)>,
    ) -> CoreResult<()> {
        batch.add(Operation::new(
            OperationPayload::DbUpdate {
                namespace: namespace.into(),
                schema: schema.into(),
                selector,
                fields,
            },
            None,
        ))
    }

    pub fn delete(
        batch: &mut Batch,
        namespace: impl Into<String>,
        schema: impl Into<String>,
        selector: Selector,
    ) -> CoreResult<()> {
        batch.add(Operation::new(
            OperationPayload::DbDelete {
                namespace: namespace.into(),
                schema: schema.into(),
                selector,
            },
            None,
        ))
    }

    pub fn iterate(
        batch: &mut Batch,
        namespace: impl Into<String>,
        schema: impl Into<String>,
        selector: Selector,
    ) -> CoreResult<RowsSlot> {
        let results: RowsSlot = Arc::new(Mutex::new(Vec::new()));
        batch.add(Operation::new(
            OperationPayload::DbIterate {
                namespace: namespace.into(),
                schema: schema.into(),
                selector,
                results: results.clone(),
            },
            None,
        ))?;
        Ok(results)
    }
}

/// Every db operation targets the single server that owns its schema's
/// metadata, chosen by hashing `(namespace, schema)` — db rows are not
/// striped the way object data is, matching the original's single
/// metadata-server-per-entry design.
fn schema_server(ctx: &ClientContext, namespace: &str, schema: &str) -> CoreResult<usize> {
    let server_count = ctx.pool().server_count(BackendKind::Db);
    if server_count == 0 {
        return Err(CoreError::Config("no db servers configured".into()));
    }
    Ok(crate::kv::stable_hash(&format!("{namespace}\0{schema}")) as usize % server_count)
}

pub async fn execute_insert_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::DbInsert { namespace, schema, fields } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(insert_one(ctx, &namespace, &schema, fields, semantics).await);
    }
    outcomes
}

async fn insert_one(
    ctx: &Arc<ClientContext>,
    namespace: &str,
    schema: &str,
    fields: Vec<(String, DbValue)>,
    semantics: Semantics,
) -> CoreResult<()> {
    let server_index = schema_server(ctx, namespace, schema)?;
    let modifiers = if semantics.wants_safety_network() { SAFETY_NETWORK } else { 0 };
    let mut message = Message::request(MessageType::DbInsert, modifiers);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(schema);
    body.append_4(fields.len() as u32);
    for (name, value) in &fields {
        body.append_string(name);
        value.encode_wire(&mut body);
    }
    message.add_operation(&body);
    ctx.rpc(BackendKind::Db, server_index, message).await?;
    Ok(())
}

pub async fn execute_update_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::DbUpdate { namespace, schema, selector, fields } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(update_one(ctx, &namespace, &schema, &selector, fields, semantics).await);
    }
    outcomes
}

async fn update_one(
    ctx: &Arc<ClientContext>,
    namespace: &str,
    schema: &str,
    selector: &Selector,
    fields: Vec<(String, DbValue)>,
    semantics: Semantics,
) -> CoreResult<()> {
    let server_index = schema_server(ctx, namespace, schema)?;
    let modifiers = if semantics.wants_safety_network() { SAFETY_NETWORK } else { 0 };
    let mut message = Message::request(MessageType::DbUpdate, modifiers);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(schema);
    selector.encode_wire(&mut body);
    body.append_4(fields.len() as u32);
    for (name, value) in &fields {
        body.append_string(name);
        value.encode_wire(&mut body);
    }
    message.add_operation(&body);
    ctx.rpc(BackendKind::Db, server_index, message).await?;
    Ok(())
}

pub async fn execute_delete_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::DbDelete { namespace, schema, selector } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(delete_one(ctx, &namespace, &schema, &selector, semantics).await);
    }
    outcomes
}

async fn delete_one(
    ctx: &Arc<ClientContext>,
    namespace: &str,
    schema: &str,
    selector: &Selector,
    semantics: Semantics,
) -> CoreResult<()> {
    let server_index = schema_server(ctx, namespace, schema)?;
    let modifiers = if semantics.wants_safety_network() { SAFETY_NETWORK } else { 0 };
    let mut message = Message::request(MessageType::DbDelete, modifiers);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(schema);
    selector.encode_wire(&mut body);
    message.add_operation(&body);
    ctx.rpc(BackendKind::Db, server_index, message).await?;
    Ok(())
}

pub async fn execute_iterate_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, _semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::DbIterate { namespace, schema, selector, results } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(iterate_one(ctx, &namespace, &schema, &selector, &results).await);
    }
    outcomes
}

async fn iterate_one(
    ctx: &Arc<ClientContext>,
    namespace: &str,
    schema: &str,
    selector: &Selector,
    results: &RowsSlot,
) -> CoreResult<()> {
    let server_index = schema_server(ctx, namespace, schema)?;
    let (mut cursor, first) = DbCursor::open(ctx, server_index, namespace, schema, selector).await?;

    let mut rows = Vec::new();
    rows.extend(first);
    while let Some(row) = cursor.next().await? {
        rows.push(row);
    }

    *results.lock() = rows;
    Ok(())
}

fn decode_row(reader: &mut MessageReader<'_>) -> CoreResult<DbRow> {
    let field_count = reader.get_4()?;
    let mut row = DbRow::default();
    for _ in 0..field_count {
        let name = reader.get_string()?;
        let value = DbValue::decode_wire(reader)?;
        row.fields.push((name, value));
    }
    Ok(row)
}

/// Reads the `row_present` flag shared by every cursor reply, decoding
/// the row behind it when present.
fn decode_row_slot(reader: &mut MessageReader<'_>) -> CoreResult<Option<DbRow>> {
    if reader.get_4()? == 0 {
        return Ok(None);
    }
    Ok(Some(decode_row(reader)?))
}

/// One open server-side iteration. `open` returns the cursor alongside
/// whatever row came back in the same reply as its token; `next` pulls
/// one row at a time after that. Dropping the cursor before it reports
/// exhaustion (the caller stopped early) best-effort releases the
/// server-side state with a spawned `close` message — `Drop` itself can't
/// be async, so the release is fire-and-forgotten onto the current Tokio
/// runtime rather than awaited inline.
struct DbCursor {
    ctx: Arc<ClientContext>,
    server_index: usize,
    token: u64,
    exhausted: bool,
}

impl DbCursor {
    async fn open(
        ctx: &Arc<ClientContext>,
        server_index: usize,
        namespace: &str,
        schema: &str,
        selector: &Selector,
    ) -> CoreResult<(Self, Option<DbRow>)> {
        let mut message = Message::request(MessageType::DbIterate, 0);
        let mut body = BytesMut::new();
        body.append_4(CURSOR_MODE_START);
        body.append_string(namespace).append_string(schema);
        selector.encode_wire(&mut body);
        message.add_operation(&body);

        let reply = ctx.rpc(BackendKind::Db, server_index, message).await?;
        let mut reader = MessageReader::new(&reply.body);
        let token = reader.get_8()?;
        let first = decode_row_slot(&mut reader)?;
        let cursor = Self {
            ctx: ctx.clone(),
            server_index,
            token,
            exhausted: first.is_none(),
        };
        Ok((cursor, first))
    }

    async fn next(&mut self) -> CoreResult<Option<DbRow>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut message = Message::request(MessageType::DbIterate, 0);
        let mut body = BytesMut::new();
        body.append_4(CURSOR_MODE_NEXT);
        body.append_8(self.token);
        message.add_operation(&body);

        let reply = self.ctx.rpc(BackendKind::Db, self.server_index, message).await?;
        let mut reader = MessageReader::new(&reply.body);
        let row = decode_row_slot(&mut reader)?;
        if row.is_none() {
            self.exhausted = true;
        }
        Ok(row)
    }
}

impl Drop for DbCursor {
    fn drop(&mut self) {
        if self.exhausted {
            return;
        }
        let ctx = self.ctx.clone();
        let server_index = self.server_index;
        let token = self.token;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut message = Message::request(MessageType::DbIterate, 0);
                let mut body = BytesMut::new();
                body.append_4(CURSOR_MODE_CLOSE);
                body.append_8(token);
                message.add_operation(&body);
                let _ = ctx.rpc(BackendKind::Db, server_index, message).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_conjunction_of_clauses() {
        let mut row = DbRow::default();
        row.set("age", DbValue::Integer(30));
        row.set("name", DbValue::Text("ada".into()));

        let selector = Selector::new()
            .and("age", Comparator::Ge, DbValue::Integer(18))
            .and("name", Comparator::Eq, DbValue::Text("ada".into()));
        assert!(selector.matches(&row));

        let selector = Selector::new().and("age", Comparator::Lt, DbValue::Integer(18));
        assert!(!selector.matches(&row));
    }

    #[test]
    fn selector_rejects_row_missing_field() {
        let row = DbRow::default();
        let selector = Selector::new().and("missing", Comparator::Eq, DbValue::Integer(1));
        assert!(!selector.matches(&row));
    }

    #[test]
    fn db_value_round_trips_through_wire_encoding() {
        for value in [
            DbValue::Integer(-7),
            DbValue::Float(2.5),
            DbValue::Text("hi".into()),
            DbValue::Blob(vec![1, 2, 3]),
        ] {
            let mut body = BytesMut::new();
            value.encode_wire(&mut body);
            let mut reader = MessageReader::new(&body);
            assert_eq!(DbValue::decode_wire(&mut reader).unwrap(), value);
        }
    }

    fn test_context(servers: Vec<crate::config::ServerAddr>) -> Arc<ClientContext> {
        let config = crate::config::Configuration {
            object_servers: vec![],
            kv_servers: vec![],
            db_servers: servers,
            max_connections: 4,
            stripe_size: 4096,
            distribution: crate::distribution::DistributionStrategy::round_robin(4096),
            semantics: crate::config::SemanticsTemplate::default(),
        };
        ClientContext::new(config)
    }

    #[tokio::test]
    async fn iterate_walks_every_row_across_repeated_cursor_next_calls() {
        let server = Arc::new(crate::server::InMemoryServer::new());
        let addr = server.serve("127.0.0.1:0").await.unwrap();
        let ctx = test_context(vec![crate::config::ServerAddr {
            host: addr.ip().to_string(),
            port: addr.port(),
        }]);

        let mut batch = Batch::new(ctx.clone());
        for i in 0..25 {
            DbFacade::insert(&mut batch, "ns", "widgets", vec![("n".to_string(), DbValue::Integer(i))]).unwrap();
        }
        assert!(batch.execute().await.ok);

        let mut query = Batch::new(ctx.clone());
        let rows = DbFacade::iterate(&mut query, "ns", "widgets", Selector::new()).unwrap();
        assert!(query.execute().await.ok);
        assert_eq!(rows.lock().len(), 25);
    }

    #[tokio::test]
    async fn abandoning_a_cursor_early_does_not_disrupt_a_later_iteration() {
        let server = Arc::new(crate::server::InMemoryServer::new());
        let addr = server.serve("127.0.0.1:0").await.unwrap();
        let ctx = test_context(vec![crate::config::ServerAddr {
            host: addr.ip().to_string(),
            port: addr.port(),
        }]);

        let mut batch = Batch::new(ctx.clone());
        for i in 0..5 {
            DbFacade::insert(&mut batch, "ns", "widgets", vec![("n".to_string(), DbValue::Integer(i))]).unwrap();
        }
        assert!(batch.execute().await.ok);

        let server_index = schema_server(&ctx, "ns", "widgets").unwrap();
        {
            let (_cursor, first) = DbCursor::open(&ctx, server_index, "ns", "widgets", &Selector::new())
                .await
                .unwrap();
            assert!(first.is_some());
            // `_cursor` drops here without exhausting, firing a best-effort close.
        }

        let mut query = Batch::new(ctx.clone());
        let rows = DbFacade::iterate(&mut query, "ns", "widgets", Selector::new()).unwrap();
        assert!(query.execute().await.ok);
        assert_eq!(rows.lock().len(), 5);
    }
}
