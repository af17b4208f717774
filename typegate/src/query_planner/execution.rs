//! Executes a [`QueryPlan`].
//!
//! Stages are resolved object by object. For every object value, the function
//! stages selected on it are scheduled as soon as the sibling stages they
//! depend on have produced a value. Ready stages of a batchable runtime are
//! sent together as one composite request, the others are dispatched one by
//! one, and everything that is ready runs concurrently. A failing stage only
//! affects its own subtree and the stages depending on it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use indexmap::IndexMap;
use tracing::Instrument;

use super::injection::InjectionResolver;
use super::QueryPlan;
use super::Stage;
use super::StageId;
use super::StageKind;
use super::BATCH_SPAN_NAME;
use super::STAGE_SPAN_NAME;
use crate::authorization::PolicyEvaluator;
use crate::error::ExecutorError;
use crate::error::StageError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::runtimes::BatchExecutor;
use crate::runtimes::ExecutionRequest;
use crate::runtimes::Executor;
use crate::runtimes::RuntimeExecutor;
use crate::runtimes::RuntimeRegistry;
use crate::typegraph::RuntimeIdx;
use crate::typegraph::SchemaIndex;
use crate::typegraph::TypeIdx;
use crate::typegraph::TypeKind;
use crate::Context;

/// The resolved value of a stage for one parent object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolved {
    Leaf(Value),
    Object(ResolvedObject),
    List(Vec<Resolved>),
    /// A polymorphic value and the branch stage that matched it.
    Branch {
        stage: StageId,
        object: ResolvedObject,
    },
    Failed(StageError),
}

/// The stages resolved on one object value, by stage id.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResolvedObject {
    pub(crate) fields: HashMap<StageId, Resolved>,
}

enum Event<'b> {
    /// Raw runtime results, before their selection is resolved.
    Dispatched(Vec<(&'b Stage, Result<Value, StageError>)>),
    Completed(&'b Stage, Resolved),
}

pub(crate) struct PlanExecutor<'a> {
    plan: &'a QueryPlan,
    schema: &'a SchemaIndex,
    registry: &'a RuntimeRegistry,
    injector: InjectionResolver<'a>,
    policies: PolicyEvaluator<'a>,
    context: &'a Context,
    /// Weight of `rate_calls` stages beyond the one unit charged upfront.
    extra_weight: AtomicU64,
}

impl<'a> PlanExecutor<'a> {
    pub(crate) fn new(
        plan: &'a QueryPlan,
        schema: &'a SchemaIndex,
        registry: &'a RuntimeRegistry,
        injector: InjectionResolver<'a>,
        policies: PolicyEvaluator<'a>,
        context: &'a Context,
    ) -> Self {
        Self {
            plan,
            schema,
            registry,
            injector,
            policies,
            context,
            extra_weight: AtomicU64::new(0),
        }
    }

    pub(crate) async fn execute(&self) -> ResolvedObject {
        self.resolve_object(&self.plan.roots, &Value::Null).await
    }

    pub(crate) fn extra_weight(&self) -> u64 {
        self.extra_weight.load(Ordering::SeqCst)
    }

    fn resolve_object<'b>(
        &'b self,
        ids: &'b [StageId],
        parent: &'b Value,
    ) -> BoxFuture<'b, ResolvedObject> {
        async move {
            let (functions, plain): (Vec<&Stage>, Vec<&Stage>) = ids
                .iter()
                .filter_map(|id| self.plan.stage(id))
                .partition(|stage| stage.is_function());

            let plain = join_all(plain.into_iter().map(|stage| async move {
                (stage.id.clone(), self.resolve_plain(stage, parent).await)
            }));
            let (mut fields, plain) = join(self.resolve_functions(functions, parent), plain).await;
            fields.extend(plain);
            ResolvedObject { fields }
        }
        .boxed()
    }

    async fn resolve_plain(&self, stage: &Stage, parent: &Value) -> Resolved {
        match &stage.kind {
            StageKind::Typename { title } => Resolved::Leaf(Value::from(title.as_str())),
            StageKind::Field { source_key } => {
                if let Err(error) = self
                    .policies
                    .authorize(stage, &Object::new(), self.context)
                    .await
                {
                    return self.failed(error);
                }
                let value = parent
                    .get(source_key.as_str())
                    .cloned()
                    .unwrap_or(Value::Null);
                self.complete(stage, stage.type_idx, value).await
            }
            StageKind::Function { .. } | StageKind::Branch { .. } => Resolved::Leaf(Value::Null),
        }
    }

    async fn resolve_functions<'b>(
        &'b self,
        mut pending: Vec<&'b Stage>,
        parent: &'b Value,
    ) -> HashMap<StageId, Resolved> {
        let mut fields = HashMap::with_capacity(pending.len());
        let mut results: HashMap<StageId, Value> = HashMap::new();
        let mut failed: HashSet<StageId> = HashSet::new();
        let mut running: FuturesUnordered<BoxFuture<'b, Event<'b>>> = FuturesUnordered::new();

        loop {
            let mut ready = Vec::new();
            let mut progressed = true;
            while progressed {
                progressed = false;
                let mut waiting = Vec::with_capacity(pending.len());
                for stage in pending.drain(..) {
                    if let Some(dependency) =
                        stage.depends_on.iter().find(|dependency| failed.contains(*dependency))
                    {
                        let error = StageError::DependencyFailed {
                            stage: stage.id.to_string(),
                            dependency: dependency.to_string(),
                        };
                        failed.insert(stage.id.clone());
                        fields.insert(stage.id.clone(), self.failed(error));
                        progressed = true;
                    } else if stage
                        .depends_on
                        .iter()
                        .all(|dependency| results.contains_key(dependency))
                    {
                        match self.injector.resolve(stage, parent, &results, self.context) {
                            Ok(args) => ready.push((stage, args)),
                            Err(error) => {
                                failed.insert(stage.id.clone());
                                fields.insert(stage.id.clone(), self.failed(error));
                                progressed = true;
                            }
                        }
                    } else {
                        waiting.push(stage);
                    }
                }
                pending = waiting;
            }
            self.dispatch(ready, parent, &running);

            match running.next().await {
                Some(Event::Dispatched(outcomes)) => {
                    for (stage, outcome) in outcomes {
                        match outcome {
                            Ok(value) => {
                                self.track_weight(stage, &value);
                                results.insert(stage.id.clone(), value.clone());
                                running.push(
                                    self.complete(stage, stage.type_idx, value)
                                        .map(move |resolved| Event::Completed(stage, resolved))
                                        .boxed(),
                                );
                            }
                            Err(error) => {
                                failed.insert(stage.id.clone());
                                fields.insert(stage.id.clone(), self.failed(error));
                            }
                        }
                    }
                }
                Some(Event::Completed(stage, resolved)) => {
                    fields.insert(stage.id.clone(), resolved);
                }
                None => break,
            }
        }

        // dependencies always are siblings, this only happens on a malformed plan
        for stage in pending {
            let error = StageError::DependencyFailed {
                stage: stage.id.to_string(),
                dependency: stage
                    .depends_on
                    .first()
                    .map(StageId::to_string)
                    .unwrap_or_default(),
            };
            fields.insert(stage.id.clone(), self.failed(error));
        }
        fields
    }

    /// Starts the ready stages: one future per stage, or per runtime for
    /// batchable runtimes.
    fn dispatch<'b>(
        &'b self,
        ready: Vec<(&'b Stage, Object)>,
        parent: &'b Value,
        running: &FuturesUnordered<BoxFuture<'b, Event<'b>>>,
    ) {
        let mut batches: IndexMap<RuntimeIdx, Vec<(&'b Stage, Object)>> = IndexMap::new();
        for (stage, args) in ready {
            let Some(runtime) = stage.runtime() else {
                continue;
            };
            match self.registry.get(runtime) {
                RuntimeExecutor::Single(executor) => {
                    running.push(
                        self.run_single(executor.clone(), stage, args, parent)
                            .boxed(),
                    );
                }
                RuntimeExecutor::Batched(_) => batches.entry(runtime).or_default().push((stage, args)),
            }
        }
        for (runtime, stages) in batches {
            if let RuntimeExecutor::Batched(executor) = self.registry.get(runtime) {
                running.push(
                    self.run_batch(executor.clone(), runtime, stages, parent)
                        .boxed(),
                );
            }
        }
    }

    async fn run_single<'b>(
        &'b self,
        executor: Arc<dyn Executor>,
        stage: &'b Stage,
        args: Object,
        parent: &'b Value,
    ) -> Event<'b> {
        let span = tracing::info_span!(
            STAGE_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            stage = %stage.id,
            runtime = %self.runtime_name(stage),
        );
        let outcome = async {
            self.policies
                .authorize(stage, &args, self.context)
                .await?;
            let request = self.request(stage, &args, parent)?;
            executor
                .execute(request)
                .await
                .map_err(|err| self.runtime_error(stage, err))
        }
        .instrument(span)
        .await;
        Event::Dispatched(vec![(stage, outcome)])
    }

    async fn run_batch<'b>(
        &'b self,
        executor: Arc<dyn BatchExecutor>,
        runtime: RuntimeIdx,
        stages: Vec<(&'b Stage, Object)>,
        parent: &'b Value,
    ) -> Event<'b> {
        let runtime_name = &self.schema.runtime(runtime).name;
        let span = tracing::info_span!(
            BATCH_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            runtime = %runtime_name,
            size = stages.len(),
        );
        async {
            let authorizations = join_all(
                stages
                    .iter()
                    .map(|(stage, args)| self.policies.authorize(stage, args, self.context)),
            )
            .await;

            let mut outcomes = Vec::with_capacity(stages.len());
            let mut requests = Vec::with_capacity(stages.len());
            for ((stage, args), authorization) in stages.iter().zip(authorizations) {
                match authorization.and_then(|()| self.request(stage, args, parent)) {
                    Ok(request) => requests.push((*stage, request)),
                    Err(error) => outcomes.push((*stage, Err(error))),
                }
            }
            if requests.is_empty() {
                return Event::Dispatched(outcomes);
            }

            let batch_error = |stage: &Stage, reason: String| StageError::Batch {
                stage: stage.id.to_string(),
                runtime: runtime_name.clone(),
                reason,
            };
            let batch: Vec<ExecutionRequest<'_>> =
                requests.iter().map(|(_, request)| *request).collect();
            match round_trip(executor.as_ref(), &batch).await {
                Ok(mut values) => {
                    for (stage, _) in requests {
                        let value = values.remove(&stage.id).ok_or_else(|| {
                            batch_error(stage, "missing from the batch response".to_string())
                        });
                        outcomes.push((stage, value));
                    }
                }
                Err(err) => {
                    for (stage, _) in requests {
                        outcomes.push((stage, Err(batch_error(stage, err.to_string()))));
                    }
                }
            }
            Event::Dispatched(outcomes)
        }
        .instrument(span)
        .await
    }

    fn request<'b>(
        &'b self,
        stage: &'b Stage,
        args: &'b Object,
        parent: &'b Value,
    ) -> Result<ExecutionRequest<'b>, StageError> {
        let StageKind::Function {
            materializer,
            runtime,
            selection,
            ..
        } = &stage.kind
        else {
            return Err(self.runtime_error(
                stage,
                ExecutorError::Unsupported("not a function stage".to_string()),
            ));
        };
        Ok(ExecutionRequest {
            stage_id: &stage.id,
            materializer: self.schema.materializer(*materializer),
            runtime: self.schema.runtime(*runtime),
            args,
            parent,
            context: self.context,
            effect: stage.effect,
            output_type: stage.type_idx,
            selection: selection.as_deref(),
            schema: self.schema,
        })
    }

    /// Resolves the selection of `stage` on a value of type `type_idx`.
    fn complete<'b>(
        &'b self,
        stage: &'b Stage,
        type_idx: TypeIdx,
        value: Value,
    ) -> BoxFuture<'b, Resolved> {
        async move {
            if value.is_null() {
                return Resolved::Leaf(Value::Null);
            }
            match &self.schema.resolve(type_idx).kind {
                TypeKind::Optional { item, .. } => self.complete(stage, *item, value).await,
                TypeKind::Function(function) => self.complete(stage, function.output, value).await,
                TypeKind::List { items } => match value {
                    Value::Array(values) => Resolved::List(
                        join_all(
                            values
                                .into_iter()
                                .map(|value| self.complete(stage, *items, value)),
                        )
                        .await,
                    ),
                    _ => self.failed(self.shape_error(stage, "a list")),
                },
                TypeKind::Object { .. } => {
                    if stage.children.is_empty() {
                        Resolved::Leaf(value)
                    } else if value.is_object() {
                        Resolved::Object(self.resolve_object(&stage.children, &value).await)
                    } else {
                        self.failed(self.shape_error(stage, "an object"))
                    }
                }
                TypeKind::Union { .. } | TypeKind::Either { .. } => {
                    let branches: Vec<&Stage> = stage
                        .children
                        .iter()
                        .filter_map(|id| self.plan.stage(id))
                        .collect();
                    match self.choose_branch(&branches, &value) {
                        Some(branch) => Resolved::Branch {
                            stage: branch.id.clone(),
                            object: self.resolve_object(&branch.children, &value).await,
                        },
                        None if value.is_object() && !branches.is_empty() => {
                            self.failed(self.shape_error(stage, "a known variant"))
                        }
                        None => Resolved::Leaf(value),
                    }
                }
                _ => Resolved::Leaf(value),
            }
        }
        .boxed()
    }

    /// The branch matching a polymorphic value: by `__typename` when the
    /// runtime provides it, otherwise the first variant whose required fields
    /// are all present.
    fn choose_branch<'b>(&self, branches: &[&'b Stage], value: &Value) -> Option<&'b Stage> {
        let object = value.as_object()?;
        fn variant(branch: &Stage) -> Option<(u32, &str)> {
            match &branch.kind {
                StageKind::Branch { variant, title } => Some((*variant, title.as_str())),
                _ => None,
            }
        }
        if let Some(typename) = object.get("__typename").and_then(Value::as_str) {
            return branches
                .iter()
                .copied()
                .find(|branch| variant(branch).is_some_and(|(_, title)| title == typename));
        }
        branches.iter().copied().find(|branch| {
            let Some((variant, _)) = variant(branch) else {
                return false;
            };
            self.schema
                .properties(variant)
                .is_some_and(|properties| {
                    properties.iter().all(|(name, property)| {
                        self.schema.function(*property).is_some()
                            || self.schema.is_optional(*property)
                            || object.contains_key(self.schema.source_key(variant, name))
                    })
                })
        })
    }

    fn track_weight(&self, stage: &Stage, value: &Value) {
        if let StageKind::Function {
            rate_weight,
            rate_calls: true,
            ..
        } = &stage.kind
        {
            let count = value.count_items() as u64;
            if count > 1 {
                self.extra_weight
                    .fetch_add(rate_weight * (count - 1), Ordering::SeqCst);
            }
        }
    }

    fn failed(&self, error: StageError) -> Resolved {
        match &error {
            StageError::Runtime { .. } | StageError::Batch { .. } => {
                failfast_error!(stage = %error.stage(), %error, "stage failed");
            }
            _ => tracing::debug!(stage = %error.stage(), %error, "stage skipped"),
        }
        Resolved::Failed(error)
    }

    /// Name of the runtime that produced the value of `stage`: its own, or
    /// the one of its closest function ancestor.
    fn runtime_name(&self, stage: &Stage) -> String {
        let mut current = Some(stage);
        while let Some(stage) = current {
            if let Some(runtime) = stage.runtime() {
                return self.schema.runtime(runtime).name.clone();
            }
            current = self.plan.stage(&stage.parent);
        }
        String::new()
    }

    fn runtime_error(&self, stage: &Stage, err: ExecutorError) -> StageError {
        StageError::Runtime {
            stage: stage.id.to_string(),
            runtime: self.runtime_name(stage),
            reason: err.to_string(),
        }
    }

    fn shape_error(&self, stage: &Stage, expected: &str) -> StageError {
        self.runtime_error(
            stage,
            ExecutorError::MalformedResponse(format!("expected {expected}")),
        )
    }
}

async fn round_trip(
    executor: &dyn BatchExecutor,
    requests: &[ExecutionRequest<'_>],
) -> Result<HashMap<StageId, Value>, ExecutorError> {
    let batch = executor.build_batch(requests)?;
    let response = executor.execute_batch(&batch).await?;
    executor.split_batch(&batch, response)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json_bytes::json;

    use super::*;
    use crate::engine::QueryOrigin;
    use crate::query_planner::QueryPlanner;
    use crate::test_utils::blog_registry;
    use crate::test_utils::blog_schema;
    use crate::test_utils::MockFactory;

    async fn run(query: &str, factory: &MockFactory, context: &Context) -> (QueryPlan, ResolvedObject) {
        let schema = blog_schema();
        let registry = blog_registry(&schema, factory);
        let plan = QueryPlanner::new(&schema, 16)
            .plan(query, None, &Object::new(), None)
            .unwrap();
        let secrets: HashMap<String, String> = HashMap::new();
        let executor = PlanExecutor::new(
            &plan,
            &schema,
            &registry,
            InjectionResolver::new(&schema, &secrets, Some(1)),
            PolicyEvaluator::new(&schema, &registry, QueryOrigin::External),
            context,
        );
        let resolved = executor.execute().await;
        (plan, resolved)
    }

    fn field<'r>(object: &'r ResolvedObject, id: &str) -> &'r Resolved {
        object.fields.get(&StageId::from(id)).unwrap()
    }

    #[tokio::test]
    async fn batches_sibling_relational_stages() {
        let factory = MockFactory::default();
        let (_, resolved) = run(
            "{ users { id } post(id: 10) { title } }",
            &factory,
            &Context::new(),
        )
        .await;

        let batches = factory.relational.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].stages,
            vec![StageId::from("users"), StageId::from("post")]
        );
        let Resolved::Object(post) = field(&resolved, "post") else {
            panic!("post is an object");
        };
        assert_eq!(
            field(post, "post.title"),
            &Resolved::Leaf(json!("First"))
        );
        let Resolved::List(users) = field(&resolved, "users") else {
            panic!("users is a list");
        };
        assert_eq!(users.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn failures_are_scoped_to_their_stage() {
        let factory = MockFactory::default();
        let (_, resolved) = run(
            "{ failing { posts } users { id } }",
            &factory,
            &Context::new(),
        )
        .await;
        assert!(matches!(
            field(&resolved, "failing"),
            Resolved::Failed(StageError::Runtime { .. })
        ));
        assert!(matches!(field(&resolved, "users"), Resolved::List(_)));
    }

    #[tokio::test]
    async fn dependent_stages_wait_for_their_sibling() {
        let factory = MockFactory::default();
        let (_, resolved) = run(
            "{ users(take: 1) { stats { posts } latestPost { id } } }",
            &factory,
            &Context::new(),
        )
        .await;
        let Resolved::List(users) = field(&resolved, "users") else {
            panic!("users is a list");
        };
        let Resolved::Object(user) = &users[0] else {
            panic!("a user is an object");
        };
        let Resolved::Object(latest) = field(user, "users.latestPost") else {
            panic!("latest post is an object");
        };
        // the mock echoes the number of posts computed by `stats`
        assert_eq!(field(latest, "users.latestPost.id"), &Resolved::Leaf(json!(2)));
    }

    #[tokio::test]
    async fn polymorphic_values_pick_their_branch() {
        let factory = MockFactory::default();
        let (_, resolved) = run(
            r#"{ search(term: "a") { ... on User { name } ... on Post { title } } }"#,
            &factory,
            &Context::new(),
        )
        .await;
        let Resolved::List(results) = field(&resolved, "search") else {
            panic!("search is a list");
        };
        let Resolved::Branch { stage, object } = &results[0] else {
            panic!("results are branches");
        };
        assert_eq!(stage, &StageId::from("search.$User"));
        assert_eq!(field(object, "search.$User.name"), &Resolved::Leaf(json!("Ada")));
        let Resolved::Branch { stage, .. } = &results[1] else {
            panic!("results are branches");
        };
        assert_eq!(stage, &StageId::from("search.$Post"));
    }

    #[test_log::test(tokio::test)]
    async fn denied_stages_do_not_run() {
        let factory = MockFactory::default();
        let (_, resolved) = run("{ adminStats { posts } }", &factory, &Context::new()).await;
        assert!(matches!(
            field(&resolved, "adminStats"),
            Resolved::Failed(StageError::Denied { .. })
        ));
        assert_eq!(factory.script.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn field_policies_are_checked() {
        let factory = MockFactory::default();
        let (_, resolved) = run("{ users(take: 1) { id email } }", &factory, &Context::new()).await;
        let Resolved::List(users) = field(&resolved, "users") else {
            panic!("users is a list");
        };
        let Resolved::Object(user) = &users[0] else {
            panic!("a user is an object");
        };
        assert_eq!(field(user, "users.id"), &Resolved::Leaf(json!(1)));
        assert!(matches!(
            field(user, "users.email"),
            Resolved::Failed(StageError::Denied { .. })
        ));
    }
}
