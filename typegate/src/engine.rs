//! The query engine of one typegraph.

use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use http::Method;
use serde::Deserialize;
use serde::Serialize;
use tracing::Instrument;

use crate::authentication::Authenticator;
use crate::authorization::PolicyEvaluator;
use crate::configuration::Execution;
use crate::error::AuthenticationError;
use crate::error::PlanningError;
use crate::error::QueryError;
use crate::error::SchemaError;
use crate::graphql;
use crate::json_ext::Object;
use crate::query_planner::composer::Composer;
use crate::query_planner::execution::PlanExecutor;
use crate::query_planner::injection::InjectionResolver;
use crate::query_planner::operation_names;
use crate::query_planner::QueryPlan;
use crate::query_planner::QueryPlanner;
use crate::query_planner::EXECUTE_SPAN_NAME;
use crate::query_planner::PLAN_SPAN_NAME;
use crate::rate::RateLimiterState;
use crate::runtimes::BuiltinOptions;
use crate::runtimes::RuntimeFactory;
use crate::runtimes::RuntimeRegistry;
use crate::typegraph::Cors;
use crate::typegraph::EffectKind;
use crate::typegraph::SchemaIndex;
use crate::typegraph::Typegraph;
use crate::Context;
use crate::EnvSecrets;
use crate::SecretStore;

const DEFAULT_SECRETS_PREFIX: &str = "TG_";

/// Where a query comes from. The `internal` policy only allows internal
/// queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrigin {
    #[default]
    External,
    Internal,
}

/// One query to execute.
#[derive(Clone, Debug)]
pub struct Query {
    pub request: graphql::Request,
    pub context: Context,
    /// When set, every function of the operation must have this effect.
    pub effect: Option<EffectKind>,
    pub origin: QueryOrigin,
}

#[buildstructor::buildstructor]
impl Query {
    #[builder(visibility = "pub")]
    fn new(
        request: graphql::Request,
        context: Option<Context>,
        effect: Option<EffectKind>,
        origin: Option<QueryOrigin>,
    ) -> Self {
        Self {
            request,
            context: context.unwrap_or_default(),
            effect,
            origin: origin.unwrap_or_default(),
        }
    }
}

/// Plans and executes queries against one typegraph.
///
/// The engine owns everything derived from the typegraph: its index, the
/// executors of its runtimes, its auth providers and its rate limiter.
pub struct Engine {
    schema: SchemaIndex,
    registry: RuntimeRegistry,
    secrets: Arc<dyn SecretStore>,
    authenticator: Authenticator,
    rate_limiter: Option<RateLimiterState>,
    /// REST endpoint name to its document.
    endpoints: HashMap<String, String>,
    execution: Execution,
}

#[buildstructor::buildstructor]
impl Engine {
    /// Indexes `typegraph` and creates the executors of its runtimes.
    #[builder(visibility = "pub")]
    fn new(
        typegraph: Typegraph,
        runtime_factory: Option<Arc<dyn RuntimeFactory>>,
        secrets: Option<Arc<dyn SecretStore>>,
        execution: Option<Execution>,
    ) -> Result<Self, SchemaError> {
        let execution = execution.unwrap_or_default();
        let secrets = secrets.unwrap_or_else(|| {
            Arc::new(EnvSecrets::new(DEFAULT_SECRETS_PREFIX, typegraph.name()))
        });
        let rate_limiter = typegraph.meta.rate.clone().map(RateLimiterState::new);
        let authenticator = Authenticator::new(&typegraph.meta.auths, secrets.as_ref())?;
        let endpoints = endpoints(&typegraph.meta.queries.endpoints)?;

        let schema = SchemaIndex::new(typegraph)?;
        let options = BuiltinOptions {
            random_seed: execution.random_seed,
        };
        let registry = match runtime_factory {
            Some(factory) => RuntimeRegistry::new(&schema, factory.as_ref(), &options)?,
            None => RuntimeRegistry::new(&schema, &(), &options)?,
        };
        tracing::info!(
            typegraph = %schema.name(),
            endpoints = endpoints.len(),
            rate_limited = rate_limiter.is_some(),
            "typegraph loaded"
        );

        Ok(Self {
            schema,
            registry,
            secrets,
            authenticator,
            rate_limiter,
            endpoints,
            execution,
        })
    }
}

/// Maps every REST endpoint document to the name of its single operation.
fn endpoints(documents: &[String]) -> Result<HashMap<String, String>, SchemaError> {
    let mut endpoints = HashMap::with_capacity(documents.len());
    for document in documents {
        let names = operation_names(document)
            .map_err(|e| SchemaError::InvalidEndpoint(e.to_string()))?;
        let [name] = names.as_slice() else {
            return Err(SchemaError::InvalidEndpoint(format!(
                "expected a single named operation, found {}",
                names.len()
            )));
        };
        if endpoints.insert(name.clone(), document.clone()).is_some() {
            return Err(SchemaError::InvalidEndpoint(format!("duplicate endpoint {name}")));
        }
    }
    Ok(endpoints)
}

impl Engine {
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &SchemaIndex {
        &self.schema
    }

    pub fn cors(&self) -> &Cors {
        &self.schema.typegraph().meta.cors
    }

    /// Whether arbitrary GraphQL documents are accepted, besides the REST
    /// endpoints.
    pub fn accepts_dynamic_queries(&self) -> bool {
        self.schema.typegraph().meta.queries.dynamic
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiterState> {
        self.rate_limiter.as_ref()
    }

    /// The claims carried by the request headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Object, AuthenticationError> {
        self.authenticator.authenticate(headers)
    }

    /// Plans a GraphQL document without executing it.
    pub fn plan(
        &self,
        document: &str,
        operation_name: Option<&str>,
        variables: &Object,
        effect: Option<EffectKind>,
    ) -> Result<QueryPlan, PlanningError> {
        let span = tracing::info_span!(PLAN_SPAN_NAME, "otel.kind" = "INTERNAL");
        span.in_scope(|| {
            QueryPlanner::new(&self.schema, self.execution.max_depth).plan(
                document,
                operation_name,
                variables,
                effect,
            )
        })
    }

    /// Executes a query. Failures that prevent execution produce a response
    /// without data; stage failures produce partial data.
    pub async fn execute(&self, query: Query) -> graphql::Response {
        let span = tracing::info_span!(
            EXECUTE_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            typegraph = %self.name(),
            operation = query.request.operation_name.as_deref().unwrap_or_default(),
            context = %query.context.id(),
        );
        match self.try_execute(query).instrument(span).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(%err, "query failed");
                err.to_response()
            }
        }
    }

    async fn try_execute(&self, query: Query) -> Result<graphql::Response, QueryError> {
        let document = query
            .request
            .query
            .as_deref()
            .ok_or(PlanningError::MissingQuery)?;
        let plan = self.plan(
            document,
            query.request.operation_name.as_deref(),
            &query.request.variables,
            query.effect,
        )?;

        let partition = self
            .rate_limiter
            .as_ref()
            .map(|limiter| (limiter, limiter.partition_key(&query.context)));
        if let Some((limiter, key)) = &partition {
            limiter.acquire(key, plan.rate_weight)?;
        }

        let executor = PlanExecutor::new(
            &plan,
            &self.schema,
            &self.registry,
            InjectionResolver::new(
                &self.schema,
                self.secrets.as_ref(),
                self.execution.random_seed,
            ),
            PolicyEvaluator::new(&self.schema, &self.registry, query.origin),
            &query.context,
        );
        let timeout = self.execution.timeout;
        let resolved = tokio::time::timeout(timeout, executor.execute())
            .await
            .map_err(|_| QueryError::Timeout {
                millis: timeout.as_millis(),
            })?;

        if let Some((limiter, key)) = &partition {
            limiter.charge(key, executor.extra_weight());
        }
        let (data, errors) = Composer::compose(&plan.shape, &resolved);
        Ok(graphql::Response::builder()
            .data(data)
            .errors(errors)
            .build())
    }

    /// Executes the REST endpoint `name`. `GET` requests may only read.
    pub async fn execute_rest(
        &self,
        name: &str,
        variables: Object,
        context: Context,
        method: &Method,
    ) -> graphql::Response {
        let Some(document) = self.endpoints.get(name) else {
            return QueryError::from(PlanningError::UnknownEndpoint {
                name: name.to_string(),
            })
            .to_response();
        };
        let request = graphql::Request::builder()
            .query(document.clone())
            .operation_name(name.to_string())
            .variables(variables)
            .build();
        let effect = (method == Method::GET).then_some(EffectKind::Read);
        self.execute(
            Query::builder()
                .request(request)
                .context(context)
                .and_effect(effect)
                .build(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::test_utils::blog_engine;
    use crate::test_utils::MockFactory;

    fn engine(factory: &MockFactory) -> Engine {
        blog_engine(factory)
    }

    fn query(document: &str) -> Query {
        Query::builder()
            .request(graphql::Request::builder().query(document).build())
            .build()
    }

    #[tokio::test]
    async fn executes_a_query() {
        let engine = engine(&MockFactory::default());
        let response = engine
            .execute(query("{ users(take: 1) { id name posts { title } } }"))
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(json!({
                "users": [{ "id": 1, "name": "Ada", "posts": [{ "title": "First" }, { "title": "Draft" }] }]
            }))
        );
    }

    #[tokio::test]
    async fn planning_errors_have_no_data() {
        let engine = engine(&MockFactory::default());
        let response = engine.execute(query("{ users { nope } }")).await;
        assert_eq!(response.data, None);
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("PLANNING_ERROR")
        );
    }

    #[tokio::test]
    async fn rest_endpoints() {
        let engine = engine(&MockFactory::default());
        let mut variables = Object::new();
        variables.insert("take", json!(1));
        let response = engine
            .execute_rest("listUsers", variables, Context::new(), &Method::GET)
            .await;
        assert_eq!(
            response.data,
            Some(json!({ "users": [{ "id": 1, "name": "Ada" }] }))
        );

        let response = engine
            .execute_rest("missing", Object::new(), Context::new(), &Method::GET)
            .await;
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("ENDPOINT_NOT_FOUND")
        );
    }

    #[tokio::test]
    async fn get_requests_cannot_mutate() {
        let engine = engine(&MockFactory::default());
        let response = engine
            .execute(
                Query::builder()
                    .request(
                        graphql::Request::builder()
                            .query(r#"mutation { createPost(title: "x") { id } }"#)
                            .build(),
                    )
                    .effect(EffectKind::Read)
                    .build(),
            )
            .await;
        assert_eq!(response.data, None);
        assert!(response.errors[0].message.contains("read request"));
    }

    #[test]
    fn endpoint_documents_need_one_named_operation() {
        assert!(endpoints(&["query a { users { id } }".to_string()]).is_ok());
        assert!(matches!(
            endpoints(&["{ users { id } }".to_string()]),
            Err(SchemaError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            endpoints(&["query a { x } query b { y }".to_string()]),
            Err(SchemaError::InvalidEndpoint(_))
        ));
    }
}
