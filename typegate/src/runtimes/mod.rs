//! Runtime executors.
//!
//! Every runtime of a typegraph gets one [`RuntimeExecutor`], looked up by
//! runtime index at dispatch time. Executors for the runtimes that are part of
//! the gateway itself ship with this crate; the others (databases, script
//! sandboxes, storage, ...) come from an embedder supplied [`RuntimeFactory`].

pub(crate) mod graphql;
pub(crate) mod http;
pub(crate) mod predefined;
pub(crate) mod random;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

pub use self::http::replace_dynamic_path_params;
pub use self::http::PathSubstitution;
use crate::error::ExecutorError;
use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::query_planner::StageId;
use crate::typegraph::EffectKind;
use crate::typegraph::Materializer;
use crate::typegraph::Runtime;
use crate::typegraph::RuntimeIdx;
use crate::typegraph::SchemaIndex;
use crate::typegraph::TypeIdx;
use crate::Context;

/// The closed set of runtime kinds a typegraph may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Script,
    Relational,
    GraphQL,
    Http,
    ObjectStorage,
    Workflow,
    KeyValue,
    Wasm,
    Predefined,
    Random,
}

impl RuntimeKind {
    /// Whether sibling stages on this runtime are merged into one composite
    /// request.
    pub fn is_batchable(&self) -> bool {
        matches!(self, RuntimeKind::Relational)
    }
}

impl FromStr for RuntimeKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deno" | "python" | "script" => RuntimeKind::Script,
            "prisma" | "relational" => RuntimeKind::Relational,
            "graphql" => RuntimeKind::GraphQL,
            "http" => RuntimeKind::Http,
            "s3" => RuntimeKind::ObjectStorage,
            "temporal" => RuntimeKind::Workflow,
            "kv" => RuntimeKind::KeyValue,
            "wasm" | "wasmedge" => RuntimeKind::Wasm,
            "predefined" => RuntimeKind::Predefined,
            "random" => RuntimeKind::Random,
            other => return Err(SchemaError::UnknownRuntime(other.to_string())),
        })
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeKind::Script => "script",
            RuntimeKind::Relational => "relational",
            RuntimeKind::GraphQL => "graphql",
            RuntimeKind::Http => "http",
            RuntimeKind::ObjectStorage => "object_storage",
            RuntimeKind::Workflow => "workflow",
            RuntimeKind::KeyValue => "key_value",
            RuntimeKind::Wasm => "wasm",
            RuntimeKind::Predefined => "predefined",
            RuntimeKind::Random => "random",
        };
        f.write_str(name)
    }
}

/// Everything an executor needs to run one stage.
#[derive(Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub stage_id: &'a StageId,
    pub materializer: &'a Materializer,
    pub runtime: &'a Runtime,
    /// Resolved arguments, injections included.
    pub args: &'a Object,
    /// The object the stage is a field of.
    pub parent: &'a Value,
    pub context: &'a Context,
    pub effect: EffectKind,
    pub output_type: TypeIdx,
    /// Sub-selection rendered as GraphQL, for runtimes that forward queries.
    pub selection: Option<&'a str>,
    pub schema: &'a SchemaIndex,
}

impl fmt::Debug for ExecutionRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("stage_id", self.stage_id)
            .field("materializer", &self.materializer.name)
            .field("runtime", &self.runtime.name)
            .field("effect", &self.effect)
            .finish()
    }
}

/// Executes stages one at a time.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError>;
}

/// A request merging several stages, addressed back by stage id.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    pub stages: Vec<StageId>,
    pub payload: Value,
}

/// Executes stages of one runtime as a single composite request.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    fn build_batch(
        &self,
        requests: &[ExecutionRequest<'_>],
    ) -> Result<CompositeRequest, ExecutorError>;

    async fn execute_batch(&self, batch: &CompositeRequest) -> Result<Value, ExecutorError>;

    /// Maps the composite response back to every stage of the batch.
    fn split_batch(
        &self,
        batch: &CompositeRequest,
        response: Value,
    ) -> Result<HashMap<StageId, Value>, ExecutorError>;
}

/// The executor of one runtime.
#[derive(Clone)]
pub enum RuntimeExecutor {
    Single(Arc<dyn Executor>),
    Batched(Arc<dyn BatchExecutor>),
}

impl fmt::Debug for RuntimeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeExecutor::Single(_) => f.write_str("RuntimeExecutor::Single"),
            RuntimeExecutor::Batched(_) => f.write_str("RuntimeExecutor::Batched"),
        }
    }
}

/// Creates executors for the runtimes this crate does not implement.
pub trait RuntimeFactory: Send + Sync {
    /// Returns `Ok(None)` to fall back to the built-in executor, if any.
    fn create(
        &self,
        kind: RuntimeKind,
        runtime: &Runtime,
    ) -> Result<Option<RuntimeExecutor>, SchemaError>;
}

impl RuntimeFactory for () {
    fn create(&self, _: RuntimeKind, _: &Runtime) -> Result<Option<RuntimeExecutor>, SchemaError> {
        Ok(None)
    }
}

/// Options of the built-in executors.
#[derive(Debug, Clone, Default)]
pub(crate) struct BuiltinOptions {
    pub(crate) random_seed: Option<u64>,
}

/// The executors of a typegraph, indexed like its runtimes.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    executors: Vec<RuntimeExecutor>,
}

impl RuntimeRegistry {
    pub(crate) fn new(
        schema: &SchemaIndex,
        factory: &dyn RuntimeFactory,
        options: &BuiltinOptions,
    ) -> Result<Self, SchemaError> {
        let runtimes = &schema.typegraph().runtimes;
        let mut executors = Vec::with_capacity(runtimes.len());
        for (idx, runtime) in runtimes.iter().enumerate() {
            let kind = schema.runtime_kind(idx as RuntimeIdx);
            let executor = match factory.create(kind, runtime)? {
                Some(executor) => executor,
                None => builtin(kind, runtime, options)?
                    .ok_or_else(|| SchemaError::MissingExecutor(runtime.name.clone()))?,
            };
            if matches!(executor, RuntimeExecutor::Batched(_)) && !kind.is_batchable() {
                return Err(SchemaError::UnbatchableRuntime(runtime.name.clone()));
            }
            tracing::debug!(runtime = %runtime.name, %kind, ?executor, "runtime executor ready");
            executors.push(executor);
        }
        Ok(Self { executors })
    }

    pub fn get(&self, idx: RuntimeIdx) -> &RuntimeExecutor {
        &self.executors[idx as usize]
    }
}

fn builtin(
    kind: RuntimeKind,
    runtime: &Runtime,
    options: &BuiltinOptions,
) -> Result<Option<RuntimeExecutor>, SchemaError> {
    let executor: Arc<dyn Executor> = match kind {
        RuntimeKind::Http => Arc::new(http::HttpExecutor::new(runtime)?),
        RuntimeKind::GraphQL => Arc::new(graphql::GraphQLExecutor::new(runtime)?),
        RuntimeKind::Predefined => Arc::new(predefined::PredefinedExecutor),
        RuntimeKind::Random => Arc::new(random::RandomExecutor::new(options.random_seed)),
        RuntimeKind::Script
        | RuntimeKind::Relational
        | RuntimeKind::ObjectStorage
        | RuntimeKind::Workflow
        | RuntimeKind::KeyValue
        | RuntimeKind::Wasm => return Ok(None),
    };
    Ok(Some(RuntimeExecutor::Single(executor)))
}

/// Reads a string from runtime or materializer data.
pub(crate) fn data_str<'a>(data: &'a Object, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|value| value.as_str())
}
