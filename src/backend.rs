//! # Storage backend collaborator interfaces
//!
//! The concrete durable object store, embedded key-value store, and
//! SQL-backed metadata store are out of scope for this crate; only the
//! interfaces the core consumes from them are specified. Each is
//! expressed as an `async_trait` object-safe trait, with an in-memory
//! stand-in used by the server harness ([`crate::server`]) and the test
//! suite so the full client/server path can be exercised without a real
//! storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::db::{DbRow, DbValue, Schema, Selector};
use crate::error::{CoreError, CoreResult};

/// Cached/fetched status of one object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectStatusValue {
    pub size: u64,
    pub modification_time: u64,
}

/// `create/open/close/delete/read/write/status/sync` on the durable
/// object store.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn create(&self, namespace: &str, name: &str) -> CoreResult<()>;
    async fn delete(&self, namespace: &str, name: &str) -> CoreResult<()>;
    async fn read(&self, namespace: &str, name: &str, offset: u64, length: u64) -> CoreResult<Vec<u8>>;
    async fn write(&self, namespace: &str, name: &str, offset: u64, data: &[u8]) -> CoreResult<u64>;
    async fn status(&self, namespace: &str, name: &str) -> CoreResult<ObjectStatusValue>;
    /// A no-op for the in-memory backend: every write is already durable
    /// the moment it returns, matching the Open Question in §9 about a
    /// real backend's `sync` sometimes being a no-op in practice.
    async fn sync(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// `put/get/delete/iterate` with namespace scoping.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> CoreResult<()>;
    async fn get(&self, namespace: &str, key: &str) -> CoreResult<Option<Vec<u8>>>;
    async fn delete(&self, namespace: &str, key: &str) -> CoreResult<()>;
    async fn iterate(&self, namespace: &str) -> CoreResult<Vec<(String, Vec<u8>)>>;
}

/// `batch_start/batch_execute`, `schema_create/drop`,
/// `insert/update/delete`, `iterator_new/iterate`, plus `meta_get/meta_put`
/// for object metadata records.
#[async_trait]
pub trait DbBackend: Send + Sync {
    async fn schema_create(&self, namespace: &str, name: &str, schema: Schema) -> CoreResult<()>;
    async fn insert(&self, namespace: &str, schema: &str, fields: Vec<(String, DbValue)>) -> CoreResult<()>;
    async fn update(
        &self,
        namespace: &str,
        schema: &str,
        selector: &Selector,
        fields: Vec<(String, DbValue)>,
    ) -> CoreResult<u64>;
    async fn delete(&self, namespace: &str, schema: &str, selector: &Selector) -> CoreResult<u64>;
    async fn iterate(&self, namespace: &str, schema: &str, selector: &Selector) -> CoreResult<Vec<DbRow>>;

    async fn meta_get(&self, namespace: &str, name: &str) -> CoreResult<Option<Vec<u8>>>;
    async fn meta_put(&self, namespace: &str, name: &str, value: Vec<u8>) -> CoreResult<()>;
    async fn meta_delete(&self, namespace: &str, name: &str) -> CoreResult<()>;
}

#[derive(Default)]
struct ObjectRecord {
    bytes: Vec<u8>,
    modification_time: u64,
}

/// In-memory stand-in for the durable object store.
#[derive(Default)]
pub struct InMemoryDataBackend {
    objects: RwLock<HashMap<(String, String), ObjectRecord>>,
    clock: AtomicU64,
}

impl InMemoryDataBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl DataBackend for InMemoryDataBackend {
    async fn create(&self, namespace: &str, name: &str) -> CoreResult<()> {
        let key = (namespace.to_string(), name.to_string());
        self.objects.write().entry(key).or_default();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> CoreResult<()> {
        let key = (namespace.to_string(), name.to_string());
        self.objects.write().remove(&key);
        Ok(())
    }

    async fn read(&self, namespace: &str, name: &str, offset: u64, length: u64) -> CoreResult<Vec<u8>> {
        let key = (namespace.to_string(), name.to_string());
        let objects = self.objects.read();
        let Some(record) = objects.get(&key) else {
            return Ok(Vec::new());
        };
        let start = (offset as usize).min(record.bytes.len());
        let end = ((offset + length) as usize).min(record.bytes.len());
        Ok(record.bytes[start..end].to_vec())
    }

    async fn write(&self, namespace: &str, name: &str, offset: u64, data: &[u8]) -> CoreResult<u64> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write();
        let record = objects.entry(key).or_default();
        let end = offset as usize + data.len();
        if record.bytes.len() < end {
            record.bytes.resize(end, 0);
        }
        record.bytes[offset as usize..end].copy_from_slice(data);
        record.modification_time = self.tick();
        Ok(data.len() as u64)
    }

    async fn status(&self, namespace: &str, name: &str) -> CoreResult<ObjectStatusValue> {
        let key = (namespace.to_string(), name.to_string());
        let objects = self.objects.read();
        let Some(record) = objects.get(&key) else {
            return Err(CoreError::NotFound(format!("{namespace}/{name}")));
        };
        Ok(ObjectStatusValue {
            size: record.bytes.len() as u64,
            modification_time: record.modification_time,
        })
    }
}

/// In-memory stand-in for the embedded key-value store.
#[derive(Default)]
pub struct InMemoryKvBackend {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> CoreResult<()> {
        self.entries
            .write()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn iterate(&self, namespace: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// In-memory stand-in for the SQL-backed metadata/DB store.
#[derive(Default)]
pub struct InMemoryDbBackend {
    schemas: RwLock<HashMap<(String, String), Schema>>,
    rows: RwLock<HashMap<(String, String), Vec<DbRow>>>,
    meta: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryDbBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DbBackend for InMemoryDbBackend {
    async fn schema_create(&self, namespace: &str, name: &str, schema: Schema) -> CoreResult<()> {
        self.schemas
            .write()
            .insert((namespace.to_string(), name.to_string()), schema);
        Ok(())
    }

    async fn insert(&self, namespace: &str, schema: &str, fields: Vec<(String, DbValue)>) -> CoreResult<()> {
        self.rows
            .write()
            .entry((namespace.to_string(), schema.to_string()))
            .or_default()
            .push(DbRow { fields });
        Ok(())
    }

    async fn update(
        &self,
        namespace: &str,
        schema: &str,
        selector: &Selector,
        fields: Vec<(String, DbValue)>,
    ) -> CoreResult<u64> {
        let mut rows = self.rows.write();
        let Some(table) = rows.get_mut(&(namespace.to_string(), schema.to_string())) else {
            return Ok(0);
        };
        let mut updated = 0u64;
        for row in table.iter_mut() {
            if selector.matches(row) {
                for (field, value) in &fields {
                    row.set(field, value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, schema: &str, selector: &Selector) -> CoreResult<u64> {
        let mut rows = self.rows.write();
        let Some(table) = rows.get_mut(&(namespace.to_string(), schema.to_string())) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|row| !selector.matches(row));
        Ok((before - table.len()) as u64)
    }

    async fn iterate(&self, namespace: &str, schema: &str, selector: &Selector) -> CoreResult<Vec<DbRow>> {
        let rows = self.rows.read();
        let Some(table) = rows.get(&(namespace.to_string(), schema.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(table.iter().filter(|row| selector.matches(row)).cloned().collect())
    }

    async fn meta_get(&self, namespace: &str, name: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self
            .meta
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn meta_put(&self, namespace: &str, name: &str, value: Vec<u8>) -> CoreResult<()> {
        self.meta
            .write()
            .insert((namespace.to_string(), name.to_string()), value);
        Ok(())
    }

    async fn meta_delete(&self, namespace: &str, name: &str) -> CoreResult<()> {
        self.meta
            .write()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
