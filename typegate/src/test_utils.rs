//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json_bytes::json;

use crate::configuration::Execution;
use crate::error::ExecutorError;
use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::query_planner::StageId;
use crate::runtimes::data_str;
use crate::runtimes::BatchExecutor;
use crate::runtimes::BuiltinOptions;
use crate::runtimes::CompositeRequest;
use crate::runtimes::ExecutionRequest;
use crate::runtimes::Executor;
use crate::runtimes::RuntimeExecutor;
use crate::runtimes::RuntimeFactory;
use crate::runtimes::RuntimeKind;
use crate::runtimes::RuntimeRegistry;
use crate::typegraph::Runtime;
use crate::typegraph::SchemaIndex;
use crate::typegraph::Typegraph;
use crate::Engine;
use crate::SecretStore;

pub(crate) const BLOG: &str = include_str!("../tests/fixtures/blog.json");

pub(crate) fn blog_typegraph() -> Typegraph {
    Typegraph::from_json(BLOG).expect("blog fixture is a valid typegraph")
}

pub(crate) fn blog_schema() -> SchemaIndex {
    SchemaIndex::new(blog_typegraph()).expect("blog fixture indexes")
}

pub(crate) fn blog_registry(schema: &SchemaIndex, factory: &MockFactory) -> RuntimeRegistry {
    RuntimeRegistry::new(schema, factory, &BuiltinOptions::default())
        .expect("every blog runtime has an executor")
}

fn users() -> Vec<Value> {
    vec![
        json!({ "id": 1, "full_name": "Ada", "email": "ada@example.com" }),
        json!({ "id": 2, "full_name": "Grace", "email": "grace@example.com" }),
    ]
}

fn posts() -> Vec<Value> {
    vec![
        json!({ "id": 10, "title": "First", "body": "Hello", "authorId": 1, "published": true }),
        json!({ "id": 11, "title": "Draft", "body": "Soon", "authorId": 1, "published": false }),
        json!({ "id": 12, "title": "Second", "body": "Again", "authorId": 2, "published": true }),
    ]
}

fn matches(row: &Value, args: &Object, key: &str) -> bool {
    match args.get(key) {
        Some(expected) => row.as_object().and_then(|row| row.get(key)) == Some(expected),
        None => true,
    }
}

fn find_many(rows: Vec<Value>, args: &Object, filters: &[&str]) -> Value {
    let take = args
        .get("take")
        .and_then(Value::as_u64)
        .map(|take| take as usize)
        .unwrap_or(usize::MAX);
    Value::Array(
        rows.into_iter()
            .filter(|row| filters.iter().all(|key| matches(row, args, key)))
            .take(take)
            .collect(),
    )
}

/// In-memory stand-in for a relational runtime.
fn relational(model: &str, operation: &str, args: &Object) -> Result<Value, ExecutorError> {
    match (model, operation) {
        ("User", "findMany") => Ok(find_many(users(), args, &[])),
        ("User", "findUnique") => Ok(users()
            .into_iter()
            .find(|user| matches(user, args, "id"))
            .unwrap_or(Value::Null)),
        ("Post", "findMany") => Ok(find_many(posts(), args, &["authorId", "published"])),
        ("Post", "findUnique") => Ok(posts()
            .into_iter()
            .find(|post| matches(post, args, "id"))
            .unwrap_or(Value::Null)),
        ("Post", "createOne") => Ok(json!({
            "id": 13,
            "title": args.get("title").cloned().unwrap_or(Value::Null),
            "body": "",
            "authorId": args.get("authorId").cloned().unwrap_or(Value::Null),
        })),
        _ => Err(ExecutorError::Unsupported(format!("{model}.{operation}"))),
    }
}

/// Batched relational runtime recording every composite request.
#[derive(Default)]
pub(crate) struct MockRelational {
    pub(crate) batches: Mutex<Vec<CompositeRequest>>,
}

#[async_trait]
impl BatchExecutor for MockRelational {
    fn build_batch(
        &self,
        requests: &[ExecutionRequest<'_>],
    ) -> Result<CompositeRequest, ExecutorError> {
        let queries = requests
            .iter()
            .map(|request| {
                json!({
                    "model": data_str(&request.materializer.data, "model").unwrap_or_default(),
                    "operation": request.materializer.name.as_str(),
                    "args": Value::Object(request.args.clone()),
                })
            })
            .collect();
        Ok(CompositeRequest {
            stages: requests
                .iter()
                .map(|request| request.stage_id.clone())
                .collect(),
            payload: Value::Array(queries),
        })
    }

    async fn execute_batch(&self, batch: &CompositeRequest) -> Result<Value, ExecutorError> {
        self.batches.lock().unwrap().push(batch.clone());
        let queries = batch.payload.as_array().cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let model = query.get("model").and_then(Value::as_str).unwrap_or_default();
            let operation = query
                .get("operation")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let args = query
                .get("args")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            results.push(relational(model, operation, &args)?);
        }
        Ok(Value::Array(results))
    }

    fn split_batch(
        &self,
        batch: &CompositeRequest,
        response: Value,
    ) -> Result<HashMap<StageId, Value>, ExecutorError> {
        let Value::Array(results) = response else {
            return Err(ExecutorError::MalformedResponse("expected an array".into()));
        };
        Ok(batch.stages.iter().cloned().zip(results).collect())
    }
}

/// Script runtime dispatching on the `script` materializer data.
#[derive(Default)]
pub(crate) struct MockScript {
    pub(crate) calls: AtomicUsize,
}

#[async_trait]
impl Executor for MockScript {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match data_str(&request.materializer.data, "script") {
            Some("search") => Ok(json!([
                { "__typename": "User", "id": 1, "full_name": "Ada", "email": "ada@example.com" },
                { "id": 10, "title": "First", "body": "Hello" },
            ])),
            Some("stats") => Ok(json!({ "posts": 2, "ratio": 0.5 })),
            Some("latestPost") => {
                let posts = request
                    .args
                    .get("stats")
                    .and_then(|stats| stats.get("posts"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(json!({ "id": posts, "title": "Latest", "body": "" }))
            }
            Some("echo") => Ok(Value::Object(request.args.clone())),
            Some("parentless") => Ok(Value::Bool(request.parent.is_null())),
            Some("fail") => Err(ExecutorError::Failed("boom".to_string())),
            other => Err(ExecutorError::Unsupported(other.unwrap_or_default().to_string())),
        }
    }
}

#[derive(Default, Clone)]
pub(crate) struct MockFactory {
    pub(crate) relational: Arc<MockRelational>,
    pub(crate) script: Arc<MockScript>,
}

impl RuntimeFactory for MockFactory {
    fn create(
        &self,
        kind: RuntimeKind,
        _runtime: &Runtime,
    ) -> Result<Option<RuntimeExecutor>, SchemaError> {
        Ok(match kind {
            RuntimeKind::Relational => Some(RuntimeExecutor::Batched(self.relational.clone())),
            RuntimeKind::Script => Some(RuntimeExecutor::Single(self.script.clone())),
            _ => None,
        })
    }
}

pub(crate) fn blog_secrets() -> HashMap<String, String> {
    HashMap::from([
        ("API_TOKEN".to_string(), "s3cr3t".to_string()),
        ("MAIN_JWT".to_string(), "jwt-secret".to_string()),
        ("BASIC_ADMIN".to_string(), "hunter2".to_string()),
    ])
}

/// The blog engine over `factory`, with a fixed random seed.
pub(crate) fn blog_engine(factory: &MockFactory) -> Engine {
    Engine::builder()
        .typegraph(blog_typegraph())
        .runtime_factory(Arc::new(factory.clone()) as Arc<dyn RuntimeFactory>)
        .secrets(Arc::new(blog_secrets()) as Arc<dyn SecretStore>)
        .execution(Execution {
            random_seed: Some(1),
            ..Default::default()
        })
        .build()
        .expect("blog engine builds")
}
