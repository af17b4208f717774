//! Policy evaluation.
//!
//! Every function stage carries the ordered chain of policies attached to its
//! type for the stage effect. The chain is evaluated lazily: the first policy
//! with an opinion decides, and a chain where no policy has one denies.

use dashmap::DashMap;
use tracing::Instrument;

use crate::engine::QueryOrigin;
use crate::error::ExecutorError;
use crate::error::StageError;
use crate::json_ext::content_hash;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::query_planner::Stage;
use crate::query_planner::POLICY_SPAN_NAME;
use crate::runtimes::ExecutionRequest;
use crate::runtimes::RuntimeExecutor;
use crate::runtimes::RuntimeRegistry;
use crate::typegraph::EffectKind;
use crate::typegraph::PolicyIdx;
use crate::typegraph::SchemaIndex;
use crate::Context;

const PUBLIC: &str = "public";
const INTERNAL: &str = "internal";

/// The outcome of one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// The policy has no opinion, the next one decides.
    Defer,
}

impl PolicyDecision {
    /// Folds a chain of decisions: the first one that is not
    /// [`PolicyDecision::Defer`] wins, an exhausted or empty chain denies.
    pub fn fold(decisions: impl IntoIterator<Item = PolicyDecision>) -> PolicyDecision {
        decisions
            .into_iter()
            .find(|decision| *decision != PolicyDecision::Defer)
            .unwrap_or(PolicyDecision::Deny)
    }

    /// Reads the value returned by a policy function.
    ///
    /// Besides `true`, `false` and `null`, the `ALLOW`, `DENY` and `PASS`
    /// strings are accepted.
    pub fn from_value(value: &Value) -> Option<PolicyDecision> {
        match value {
            Value::Bool(true) => Some(PolicyDecision::Allow),
            Value::Bool(false) => Some(PolicyDecision::Deny),
            Value::Null => Some(PolicyDecision::Defer),
            Value::String(s) => match s.as_str() {
                "ALLOW" => Some(PolicyDecision::Allow),
                "DENY" => Some(PolicyDecision::Deny),
                "PASS" => Some(PolicyDecision::Defer),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Evaluates policies for the stages of one query.
///
/// Decisions are memoized by policy, effect and arguments for the lifetime of
/// the evaluator.
pub(crate) struct PolicyEvaluator<'a> {
    schema: &'a SchemaIndex,
    registry: &'a RuntimeRegistry,
    origin: QueryOrigin,
    memo: DashMap<(PolicyIdx, EffectKind, String), PolicyDecision>,
}

impl<'a> PolicyEvaluator<'a> {
    pub(crate) fn new(
        schema: &'a SchemaIndex,
        registry: &'a RuntimeRegistry,
        origin: QueryOrigin,
    ) -> Self {
        Self {
            schema,
            registry,
            origin,
            memo: DashMap::new(),
        }
    }

    /// Runs the policy chain of `stage` with its resolved arguments.
    ///
    /// Policies see the arguments and the context, never the parent object,
    /// so a decision holds for every row of a list.
    pub(crate) async fn authorize(
        &self,
        stage: &Stage,
        args: &Object,
        context: &Context,
    ) -> Result<(), StageError> {
        if !stage.check_policies {
            return Ok(());
        }
        for policy in &stage.policies {
            match self.evaluate(*policy, stage, args, context).await? {
                PolicyDecision::Allow => return Ok(()),
                PolicyDecision::Deny => break,
                PolicyDecision::Defer => {}
            }
        }
        Err(StageError::Denied {
            stage: stage.id.to_string(),
        })
    }

    async fn evaluate(
        &self,
        idx: PolicyIdx,
        stage: &Stage,
        args: &Object,
        context: &Context,
    ) -> Result<PolicyDecision, StageError> {
        let policy = self.schema.policy(idx);
        let Some(materializer_idx) = policy.materializer else {
            return match policy.name.as_str() {
                PUBLIC => Ok(PolicyDecision::Allow),
                INTERNAL if self.origin == QueryOrigin::Internal => Ok(PolicyDecision::Allow),
                INTERNAL => Ok(PolicyDecision::Deny),
                _ => Err(StageError::PolicyFailed {
                    stage: stage.id.to_string(),
                    policy: policy.name.clone(),
                    reason: "policy has no materializer".to_string(),
                }),
            };
        };

        let key = (idx, stage.effect, content_hash(args));
        if let Some(decision) = self.memo.get(&key) {
            return Ok(*decision);
        }

        let failed = |reason: String| StageError::PolicyFailed {
            stage: stage.id.to_string(),
            policy: policy.name.clone(),
            reason,
        };
        let materializer = self.schema.materializer(materializer_idx);
        let parent = Value::Null;
        let request = ExecutionRequest {
            stage_id: &stage.id,
            materializer,
            runtime: self.schema.runtime(materializer.runtime),
            args,
            parent: &parent,
            context,
            effect: stage.effect,
            output_type: stage.type_idx,
            selection: None,
            schema: self.schema,
        };
        let span = tracing::info_span!(
            POLICY_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            policy = %policy.name,
            stage = %stage.id,
        );
        let value = dispatch(self.registry.get(materializer.runtime), request)
            .instrument(span)
            .await
            .map_err(|err| failed(err.to_string()))?;
        let decision = PolicyDecision::from_value(&value)
            .ok_or_else(|| failed(format!("expected a boolean or null, got {value}")))?;

        tracing::debug!(policy = %policy.name, stage = %stage.id, ?decision, "policy evaluated");
        self.memo.insert(key, decision);
        Ok(decision)
    }
}

async fn dispatch(
    executor: &RuntimeExecutor,
    request: ExecutionRequest<'_>,
) -> Result<Value, ExecutorError> {
    match executor {
        RuntimeExecutor::Single(executor) => executor.execute(request).await,
        RuntimeExecutor::Batched(executor) => {
            let batch = executor.build_batch(&[request])?;
            let response = executor.execute_batch(&batch).await?;
            executor
                .split_batch(&batch, response)?
                .remove(request.stage_id)
                .ok_or_else(|| ExecutorError::MalformedResponse("missing policy result".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json_bytes::json;

    use super::*;
    use crate::query_planner::QueryPlanner;
    use crate::query_planner::StageId;
    use crate::test_utils::blog_registry;
    use crate::test_utils::blog_schema;
    use crate::test_utils::blog_typegraph;
    use crate::test_utils::MockFactory;

    #[test]
    fn chain_semantics() {
        use PolicyDecision::*;
        assert_eq!(PolicyDecision::fold([Defer, Deny]), Deny);
        assert_eq!(PolicyDecision::fold([Defer, Allow]), Allow);
        assert_eq!(PolicyDecision::fold([Allow, Deny]), Allow);
        assert_eq!(PolicyDecision::fold([Defer, Defer]), Deny);
        assert_eq!(PolicyDecision::fold([]), Deny);
    }

    #[test]
    fn decisions_from_values() {
        assert_eq!(PolicyDecision::from_value(&json!(true)), Some(PolicyDecision::Allow));
        assert_eq!(PolicyDecision::from_value(&json!(false)), Some(PolicyDecision::Deny));
        assert_eq!(PolicyDecision::from_value(&Value::Null), Some(PolicyDecision::Defer));
        assert_eq!(PolicyDecision::from_value(&json!("PASS")), Some(PolicyDecision::Defer));
        assert_eq!(PolicyDecision::from_value(&json!(1)), None);
    }

    fn stage(query: &str, id: &str) -> Stage {
        let schema = blog_schema();
        let plan = QueryPlanner::new(&schema, 16)
            .plan(query, None, &Object::new(), None)
            .unwrap();
        plan.stage(&StageId::from(id)).unwrap().clone()
    }

    #[tokio::test]
    async fn builtin_policies() {
        let schema = blog_schema();
        let factory = MockFactory::default();
        let registry = blog_registry(&schema, &factory);
        let context = Context::new();

        let users = stage("{ users { id } }", "users");
        let external = PolicyEvaluator::new(&schema, &registry, QueryOrigin::External);
        assert!(external
            .authorize(&users, &Object::new(), &context)
            .await
            .is_ok());

        let internal_stats = stage("{ internalStats { posts } }", "internalStats");
        let err = external
            .authorize(&internal_stats, &Object::new(), &context)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StageError::Denied {
                stage: "internalStats".to_string()
            }
        );

        let internal = PolicyEvaluator::new(&schema, &registry, QueryOrigin::Internal);
        assert!(internal
            .authorize(&internal_stats, &Object::new(), &context)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn policy_functions_run_on_their_runtime() {
        let schema = blog_schema();
        let factory = MockFactory::default();
        let registry = blog_registry(&schema, &factory);
        let evaluator = PolicyEvaluator::new(&schema, &registry, QueryOrigin::External);
        let admin_stats = stage("{ adminStats { posts } }", "adminStats");

        let admin = Context::new()
            .with_claims(json!({ "role": "admin" }).as_object().cloned().unwrap());
        assert!(evaluator
            .authorize(&admin_stats, &Object::new(), &admin)
            .await
            .is_ok());

        // a fresh evaluator, the previous decision is memoized
        let evaluator = PolicyEvaluator::new(&schema, &registry, QueryOrigin::External);
        let guest = Context::new()
            .with_claims(json!({ "role": "guest" }).as_object().cloned().unwrap());
        let err = evaluator
            .authorize(&admin_stats, &Object::new(), &guest)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Denied { .. }));
    }

    #[tokio::test]
    async fn empty_chains_deny() {
        let schema = blog_schema();
        let factory = MockFactory::default();
        let registry = blog_registry(&schema, &factory);
        let evaluator = PolicyEvaluator::new(&schema, &registry, QueryOrigin::Internal);
        let mut users = stage("{ users { id } }", "users");
        users.policies.clear();
        let err = evaluator
            .authorize(&users, &Object::new(), &Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Denied { .. }));
    }

    #[tokio::test]
    async fn policies_see_arguments_and_context_only() {
        let mut typegraph = blog_typegraph();
        typegraph.materializers[1] = serde_json::from_value(serde_json::json!({
            "name": "function",
            "runtime": 2,
            "data": { "script": "parentless" }
        }))
        .unwrap();
        let schema = SchemaIndex::new(typegraph).unwrap();
        let factory = MockFactory::default();
        let registry = blog_registry(&schema, &factory);
        let evaluator = PolicyEvaluator::new(&schema, &registry, QueryOrigin::External);
        let plan = QueryPlanner::new(&schema, 16)
            .plan("{ adminStats { posts } }", None, &Object::new(), None)
            .unwrap();
        let admin_stats = plan.stage(&StageId::from("adminStats")).unwrap();

        assert!(evaluator
            .authorize(admin_stats, &Object::new(), &Context::new())
            .await
            .is_ok());
        assert_eq!(factory.script.calls.load(Ordering::SeqCst), 1);
    }
}
