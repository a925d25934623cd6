//! # Batch / operation engine
//!
//! The spine of the client: an ordered operation list plus a semantics
//! snapshot, coalesced into runs and executed one run at a time.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info_span, Instrument};

use crate::config::SemanticsTemplate;
use crate::context::ClientContext;
use crate::db::{DbRow, DbValue, Selector};
use crate::error::{CoreError, CoreResult, OperationError};

/// `atomicity ∈ {none, operation, batch}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    None,
    Operation,
    Batch,
}

/// `concurrency ∈ {none, session, strict}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    None,
    Session,
    Strict,
}

/// `consistency ∈ {immediate, session, eventual}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Immediate,
    Session,
    Eventual,
}

/// `safety ∈ {none, network, storage}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Safety {
    None,
    Network,
    Storage,
}

/// `ordering ∈ {strict, semi, none}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    Strict,
    Semi,
    None,
}

/// `persistency ∈ {immediate, eventual}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistency {
    Immediate,
    Eventual,
}

/// A fixed bundle of safety/consistency/atomicity options, snapshotted
/// into every [`Batch`] at construction time.
#[derive(Debug, Clone, Copy)]
pub struct Semantics {
    pub atomicity: Atomicity,
    pub concurrency: Concurrency,
    pub consistency: Consistency,
    pub safety: Safety,
    pub ordering: Ordering,
    pub persistency: Persistency,
}

impl From<&SemanticsTemplate> for Semantics {
    fn from(t: &SemanticsTemplate) -> Self {
        Self {
            atomicity: t.atomicity,
            concurrency: t.concurrency,
            consistency: t.consistency,
            safety: t.safety,
            ordering: t.ordering,
            persistency: t.persistency,
        }
    }
}

impl Semantics {
    pub fn wants_safety_network(&self) -> bool {
        matches!(self.safety, Safety::Network | Safety::Storage)
    }
}

/// An opaque handle used only for coalescing equality; zero means do not
/// coalesce. A total-ordered, `Copy` integer handle, impossible to dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoalesceKey(pub u64);

/// Discriminant used to group a run: operations coalesce when both their
/// kind tag and coalesce key match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ObjectCreate,
    ObjectDelete,
    ObjectRead,
    ObjectWrite,
    ObjectStatus,
    KvPut,
    KvGet,
    KvDelete,
    DbInsert,
    DbUpdate,
    DbDelete,
    DbIterate,
}

impl OperationKind {
    pub fn label(self) -> &'static str {
        match self {
            OperationKind::ObjectCreate => "object_create",
            OperationKind::ObjectDelete => "object_delete",
            OperationKind::ObjectRead => "object_read",
            OperationKind::ObjectWrite => "object_write",
            OperationKind::ObjectStatus => "object_status",
            OperationKind::KvPut => "kv_put",
            OperationKind::KvGet => "kv_get",
            OperationKind::KvDelete => "kv_delete",
            OperationKind::DbInsert => "db_insert",
            OperationKind::DbUpdate => "db_update",
            OperationKind::DbDelete => "db_delete",
            OperationKind::DbIterate => "db_iterate",
        }
    }
}

/// The kind-specific inline arguments and output-slot handles for one
/// operation. Each variant owns the `Arc`-shared cells its façade handed
/// the caller, so the executor can write results into them without any
/// unsafe pointer arithmetic.
pub enum OperationPayload {
    ObjectCreate {
        namespace: String,
        name: String,
    },
    ObjectDelete {
        namespace: String,
        name: String,
    },
    ObjectRead {
        namespace: String,
        name: String,
        offset: u64,
        length: u64,
        dst: crate::object::ReadSlot,
    },
    ObjectWrite {
        namespace: String,
        name: String,
        offset: u64,
        data: Arc<Vec<u8>>,
        bytes_written: crate::object::WrittenSlot,
    },
    ObjectStatus {
        namespace: String,
        name: String,
        result: crate::object::StatusSlot,
    },
    KvPut {
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    KvGet {
        namespace: String,
        key: String,
        result: crate::kv::GetSlot,
    },
    KvDelete {
        namespace: String,
        key: String,
    },
    DbInsert {
        namespace: String,
        schema: String,
        fields: Vec<(String, DbValue)>,
    },
    DbUpdate {
        namespace: String,
        schema: String,
        selector: Selector,
        fields: Vec<(String, DbValue)>,
    },
    DbDelete {
        namespace: String,
        schema: String,
        selector: Selector,
    },
    DbIterate {
        namespace: String,
        schema: String,
        selector: Selector,
        results: Arc<parking_lot::Mutex<Vec<DbRow>>>,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::ObjectCreate { .. } => OperationKind::ObjectCreate,
            OperationPayload::ObjectDelete { .. } => OperationKind::ObjectDelete,
            OperationPayload::ObjectRead { .. } => OperationKind::ObjectRead,
            OperationPayload::ObjectWrite { .. } => OperationKind::ObjectWrite,
            OperationPayload::ObjectStatus { .. } => OperationKind::ObjectStatus,
            OperationPayload::KvPut { .. } => OperationKind::KvPut,
            OperationPayload::KvGet { .. } => OperationKind::KvGet,
            OperationPayload::KvDelete { .. } => OperationKind::KvDelete,
            OperationPayload::DbInsert { .. } => OperationKind::DbInsert,
            OperationPayload::DbUpdate { .. } => OperationKind::DbUpdate,
            OperationPayload::DbDelete { .. } => OperationKind::DbDelete,
            OperationPayload::DbIterate { .. } => OperationKind::DbIterate,
        }
    }
}

/// A tagged record: kind (implicit in the payload), a coalescing key, and
/// inline arguments/output slots.
pub struct Operation {
    pub coalesce_key: Option<CoalesceKey>,
    pub payload: OperationPayload,
}

impl Operation {
    pub fn new(payload: OperationPayload, coalesce_key: Option<CoalesceKey>) -> Self {
        Self {
            coalesce_key,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Open,
    Executing,
    Done,
}

/// Ordered list of operations plus a semantics snapshot. A batch is
/// monotonic: once `execute` is called, no further operation may be added.
pub struct Batch {
    context: Arc<ClientContext>,
    semantics: Semantics,
    ops: Vec<Operation>,
    state: BatchState,
}

/// The outcome of executing a batch: `ok` iff every operation succeeded.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub ok: bool,
    pub errors: Vec<OperationError>,
}

impl Batch {
    pub fn new(context: Arc<ClientContext>) -> Self {
        let semantics = Semantics::from(&context.config().semantics);
        Self {
            context,
            semantics,
            ops: Vec::new(),
            state: BatchState::Open,
        }
    }

    pub fn with_semantics(context: Arc<ClientContext>, semantics: Semantics) -> Self {
        Self {
            context,
            semantics,
            ops: Vec::new(),
            state: BatchState::Open,
        }
    }

    pub fn semantics(&self) -> Semantics {
        self.semantics
    }

    /// Enqueues one operation. Fails if the batch has already begun
    /// executing (`Open → Executing` is one-way).
    pub fn add(&mut self, op: Operation) -> CoreResult<()> {
        if self.state != BatchState::Open {
            return Err(CoreError::Cancelled(
                "batch is executing or already done; cannot add operations".into(),
            ));
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Runs the coalesce → execute → free pipeline and consumes the batch.
    pub async fn execute(mut self) -> BatchResult {
        self.state = BatchState::Executing;
        let runs = coalesce(std::mem::take(&mut self.ops));
        let span = info_span!("batch_execute", runs = runs.len(), ops = runs.iter().map(Vec::len).sum::<usize>());

        let result = async {
            let mut errors = Vec::new();
            let mut op_index = 0usize;
            let total_runs = runs.len();

            for (run_index, run) in runs.into_iter().enumerate() {
                let kind = run.first().map(|o| o.payload.kind());
                let run_span = info_span!("run", kind = kind.map(|k| k.label()).unwrap_or("empty"), size = run.len());
                let outcomes = dispatch_run(&self.context, run, self.semantics)
                    .instrument(run_span)
                    .await;

                for outcome in outcomes {
                    if let Err(e) = outcome {
                        errors.push(OperationError::new(op_index, "run", &e));
                    }
                    op_index += 1;
                }

                let is_last = run_index + 1 == total_runs;
                match self.semantics.persistency {
                    Persistency::Immediate => self.context.best_effort_sync().await,
                    Persistency::Eventual if is_last => self.context.best_effort_sync().await,
                    _ => {}
                }
            }

            BatchResult {
                ok: errors.is_empty(),
                errors,
            }
        }
        .instrument(span)
        .await;

        self.state = BatchState::Done;
        result
    }
}

/// Walks the operation list, closing a run whenever the kind or coalesce
/// key changes. Runs of length 1 are legal.
fn coalesce(ops: Vec<Operation>) -> Vec<Vec<Operation>> {
    let mut runs: Vec<Vec<Operation>> = Vec::new();
    let mut current_kind: Option<OperationKind> = None;
    let mut current_key: Option<Option<CoalesceKey>> = None;

    for op in ops {
        let kind = op.payload.kind();
        let same_run = current_kind == Some(kind)
            && current_key == Some(op.coalesce_key)
            && op.coalesce_key.is_some();

        if same_run {
            runs.last_mut().unwrap().push(op);
        } else {
            current_kind = Some(kind);
            current_key = Some(op.coalesce_key);
            runs.push(vec![op]);
        }
    }
    runs
}

/// Invokes the kind's executor for one run, returning a per-operation
/// outcome aligned by index with the run's input order.
async fn dispatch_run(
    ctx: &Arc<ClientContext>,
    run: Vec<Operation>,
    semantics: Semantics,
) -> Vec<CoreResult<()>> {
    let Some(first) = run.first() else {
        return Vec::new();
    };
    match first.payload.kind() {
        OperationKind::ObjectCreate => crate::object::execute_create_run(ctx, run, semantics).await,
        OperationKind::ObjectDelete => crate::object::execute_delete_run(ctx, run, semantics).await,
        OperationKind::ObjectRead => crate::object::execute_read_run(ctx, run, semantics).await,
        OperationKind::ObjectWrite => crate::object::execute_write_run(ctx, run, semantics).await,
        OperationKind::ObjectStatus => crate::object::execute_status_run(ctx, run, semantics).await,
        OperationKind::KvPut => crate::kv::execute_put_run(ctx, run, semantics).await,
        OperationKind::KvGet => crate::kv::execute_get_run(ctx, run, semantics).await,
        OperationKind::KvDelete => crate::kv::execute_delete_run(ctx, run, semantics).await,
        OperationKind::DbInsert => crate::db::execute_insert_run(ctx, run, semantics).await,
        OperationKind::DbUpdate => crate::db::execute_update_run(ctx, run, semantics).await,
        OperationKind::DbDelete => crate::db::execute_delete_run(ctx, run, semantics).await,
        OperationKind::DbIterate => crate::db::execute_iterate_run(ctx, run, semantics).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_op(kind_like: OperationKind, key: Option<u64>) -> Operation {
        let payload = match kind_like {
            OperationKind::KvDelete => OperationPayload::KvDelete {
                namespace: "ns".into(),
                key: "k".into(),
            },
            OperationKind::KvPut => OperationPayload::KvPut {
                namespace: "ns".into(),
                key: "k".into(),
                value: vec![],
            },
            _ => unreachable!("test only exercises KvPut/KvDelete shapes"),
        };
        Operation::new(payload, key.map(CoalesceKey))
    }

    #[test]
    fn coalesces_matching_kind_and_key_preserving_order() {
        let ops = vec![
            make_op(OperationKind::KvPut, Some(1)),
            make_op(OperationKind::KvPut, Some(1)),
            make_op(OperationKind::KvDelete, Some(1)),
            make_op(OperationKind::KvPut, None),
            make_op(OperationKind::KvPut, None),
        ];
        let runs = coalesce(ops);
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 1);
        assert_eq!(runs[2].len(), 1);
        assert_eq!(runs[3].len(), 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn execute_logs_a_batch_execute_span_with_the_run_count() {
        use crate::config::{Configuration, SemanticsTemplate, ServerAddr};
        use crate::context::ClientContext;
        use crate::distribution::DistributionStrategy;
        use crate::kv::KvFacade;
        use crate::server::InMemoryServer;

        let server = Arc::new(InMemoryServer::new());
        let addr = server.serve("127.0.0.1:0").await.unwrap();
        let config = Configuration {
            object_servers: vec![],
            kv_servers: vec![ServerAddr {
                host: addr.ip().to_string(),
                port: addr.port(),
            }],
            db_servers: vec![],
            max_connections: 4,
            stripe_size: 4096,
            distribution: DistributionStrategy::round_robin(4096),
            semantics: SemanticsTemplate::default(),
        };
        let ctx = ClientContext::new(config);

        let mut batch = Batch::new(ctx);
        KvFacade::put(&mut batch, "ns", "k", b"v".to_vec()).unwrap();
        assert!(batch.execute().await.ok);

        assert!(logs_contain("batch_execute"));
    }
}
