//! # KV data plane
//!
//! Opaque-bytes put/get/delete, each operation pinned to exactly one
//! server by hashing its key — unlike the object data plane, a kv entry
//! is never striped. Resolves a key to a single backend before issuing any
//! wire request.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::batch::{Batch, Operation, OperationPayload, Semantics};
use crate::codec::{Message, MessageBuilderExt, MessageReader, MessageType, SAFETY_NETWORK};
use crate::context::ClientContext;
use crate::error::{CoreError, CoreResult};
use crate::pool::BackendKind;

/// Result cell a facade hands the caller for `get`, populated once the
/// owning batch executes. `None` means the key was not found.
pub type GetSlot = Arc<Mutex<Option<Vec<u8>>>>;

/// A small, non-cryptographic hash shared by the kv and db planes to pick
/// a single owning server for a key or schema name.
pub fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn key_server(ctx: &ClientContext, namespace: &str, key: &str) -> CoreResult<usize> {
    let server_count = ctx.pool().server_count(BackendKind::Kv);
    if server_count == 0 {
        return Err(CoreError::Config("no kv servers configured".into()));
    }
    Ok(stable_hash(&format!("{namespace}\0{key}")) as usize % server_count)
}

/// Builds kv operations onto a batch.
pub struct KvFacade;

impl KvFacade {
    pub fn put(
        batch: &mut Batch,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> CoreResult<()> {
        batch.add(Operation::new(
            OperationPayload::KvPut {
                namespace: namespace.into(),
                key: key.into(),
                value,
            },
            None,
        ))
    }

    pub fn get(batch: &mut Batch, namespace: impl Into<String>, key: impl Into<String>) -> CoreResult<GetSlot> {
        let result: GetSlot = Arc::new(Mutex::new(None));
        batch.add(Operation::new(
            OperationPayload::KvGet {
                namespace: namespace.into(),
                key: key.into(),
                result: result.clone(),
            },
            None,
        ))?;
        Ok(result)
    }

    pub fn delete(batch: &mut Batch, namespace: impl Into<String>, key: impl Into<String>) -> CoreResult<()> {
        batch.add(Operation::new(
            OperationPayload::KvDelete {
                namespace: namespace.into(),
                key: key.into(),
            },
            None,
        ))
    }
}

pub async fn execute_put_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::KvPut { namespace, key, value } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(put_one(ctx, &namespace, &key, value, semantics).await);
    }
    outcomes
}

async fn put_one(ctx: &Arc<ClientContext>, namespace: &str, key: &str, value: Vec<u8>, semantics: Semantics) -> CoreResult<()> {
    let server_index = key_server(ctx, namespace, key)?;
    let modifiers = if semantics.wants_safety_network() { SAFETY_NETWORK } else { 0 };
    let mut message = Message::request(MessageType::KvPut, modifiers);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(key).append_bytes(&value);
    message.add_operation(&body);
    ctx.rpc(BackendKind::Kv, server_index, message).await?;
    Ok(())
}

pub async fn execute_get_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, _semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::KvGet { namespace, key, result } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(get_one(ctx, &namespace, &key, &result).await);
    }
    outcomes
}

async fn get_one(ctx: &Arc<ClientContext>, namespace: &str, key: &str, result: &GetSlot) -> CoreResult<()> {
    let server_index = key_server(ctx, namespace, key)?;
    let mut message = Message::request(MessageType::KvGet, 0);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(key);
    message.add_operation(&body);

    let reply = ctx.rpc(BackendKind::Kv, server_index, message).await?;
    let mut reader = MessageReader::new(&reply.body);
    let found = reader.get_4()? != 0;
    *result.lock() = if found { Some(reader.get_bytes()?) } else { None };
    Ok(())
}

pub async fn execute_delete_run(ctx: &Arc<ClientContext>, run: Vec<Operation>, semantics: Semantics) -> Vec<CoreResult<()>> {
    let mut outcomes = Vec::with_capacity(run.len());
    for op in run {
        let OperationPayload::KvDelete { namespace, key } = op.payload else {
            unreachable!("run must be homogeneous")
        };
        outcomes.push(delete_one(ctx, &namespace, &key, semantics).await);
    }
    outcomes
}

/// Fire-and-forget unless the batch's safety semantics demand a reply: a
/// delete under relaxed safety doesn't wait on the server at all, matching
/// the `SAFETY_NETWORK` modifier it still carries on the wire.
async fn delete_one(ctx: &Arc<ClientContext>, namespace: &str, key: &str, semantics: Semantics) -> CoreResult<()> {
    let server_index = key_server(ctx, namespace, key)?;
    let modifiers = if semantics.wants_safety_network() { SAFETY_NETWORK } else { 0 };
    let mut message = Message::request(MessageType::KvDelete, modifiers);
    let mut body = BytesMut::new();
    body.append_string(namespace).append_string(key);
    message.add_operation(&body);
    ctx.rpc_fire_and_forget_unless_safety_network(BackendKind::Kv, server_index, message)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic_across_calls() {
        assert_eq!(stable_hash("ns\0key"), stable_hash("ns\0key"));
    }

    #[test]
    fn stable_hash_distinguishes_keys() {
        assert_ne!(stable_hash("ns\0a"), stable_hash("ns\0b"));
    }
}
