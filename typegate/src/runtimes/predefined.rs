//! Functions built into the gateway.

use async_trait::async_trait;
use regex::Regex;

use super::data_str;
use super::ExecutionRequest;
use super::Executor;
use crate::error::ExecutorError;
use crate::json_ext::Value;

/// Runs the predefined materializers, selected by name.
pub(crate) struct PredefinedExecutor;

#[async_trait]
impl Executor for PredefinedExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
        match request.materializer.name.as_str() {
            "identity" => Ok(Value::Object(request.args.clone())),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "allow" => Ok(Value::from("ALLOW")),
            "deny" => Ok(Value::from("DENY")),
            "pass" => Ok(Value::from("PASS")),
            "context_check" => context_check(&request),
            other => Err(ExecutorError::Unsupported(other.to_string())),
        }
    }
}

/// `true` when the context value at `key` matches, `null` otherwise so that
/// the next policy of the chain decides.
fn context_check(request: &ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
    let data = &request.materializer.data;
    let key = data_str(data, "key")
        .ok_or_else(|| ExecutorError::InvalidMaterializer("context_check needs a key".into()))?;
    let check = data
        .get("value")
        .and_then(Value::as_object)
        .ok_or_else(|| ExecutorError::InvalidMaterializer("context_check needs a value".into()))?;
    let expected = check.get("value").unwrap_or(&Value::Null);

    let Some(actual) = request.context.claim(key) else {
        return Ok(Value::Null);
    };
    let matches = match check.get("type").and_then(Value::as_str) {
        Some("pattern") => {
            let pattern = expected.as_str().ok_or_else(|| {
                ExecutorError::InvalidMaterializer("pattern must be a string".into())
            })?;
            let pattern = Regex::new(pattern)
                .map_err(|err| ExecutorError::InvalidMaterializer(err.to_string()))?;
            actual.as_str().is_some_and(|actual| pattern.is_match(actual))
        }
        Some("value") | None => actual == expected,
        Some(other) => {
            return Err(ExecutorError::InvalidMaterializer(format!(
                "unknown check type {other}"
            )))
        }
    };
    Ok(if matches { Value::Bool(true) } else { Value::Null })
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::json_ext::Object;
    use crate::query_planner::StageId;
    use crate::test_utils::blog_schema;
    use crate::typegraph::EffectKind;
    use crate::typegraph::Materializer;
    use crate::typegraph::Runtime;
    use crate::Context;

    async fn run(name: &str, data: Value, args: Value, context: &Context) -> Result<Value, ExecutorError> {
        let schema = blog_schema();
        let runtime = Runtime {
            name: "predefined".to_string(),
            data: Object::new(),
        };
        let materializer = Materializer {
            name: name.to_string(),
            runtime: 0,
            effect: Default::default(),
            data: data.as_object().cloned().unwrap_or_default(),
        };
        let stage_id = StageId::from("check");
        let args = args.as_object().cloned().unwrap_or_default();
        let result = PredefinedExecutor
            .execute(ExecutionRequest {
                stage_id: &stage_id,
                materializer: &materializer,
                runtime: &runtime,
                args: &args,
                parent: &Value::Null,
                context,
                effect: EffectKind::Read,
                output_type: 23,
                selection: None,
                schema: &schema,
            })
            .await;
        result
    }

    #[tokio::test]
    async fn constants_and_identity() {
        let context = Context::new();
        assert_eq!(run("true", Value::Null, Value::Null, &context).await, Ok(json!(true)));
        assert_eq!(run("pass", Value::Null, Value::Null, &context).await, Ok(json!("PASS")));
        assert_eq!(
            run("identity", Value::Null, json!({ "a": 1 }), &context).await,
            Ok(json!({ "a": 1 }))
        );
        assert!(run("eval", Value::Null, Value::Null, &context).await.is_err());
    }

    #[tokio::test]
    async fn context_checks() {
        let context = Context::new()
            .with_claims(json!({ "role": "admin", "email": "ada@example.com" }).as_object().cloned().unwrap());
        let by_value = json!({ "key": "role", "value": { "type": "value", "value": "admin" } });
        assert_eq!(
            run("context_check", by_value.clone(), Value::Null, &context).await,
            Ok(json!(true))
        );
        assert_eq!(
            run("context_check", by_value, Value::Null, &Context::new()).await,
            Ok(Value::Null)
        );

        let by_pattern =
            json!({ "key": "email", "value": { "type": "pattern", "value": "@example\\.com$" } });
        assert_eq!(
            run("context_check", by_pattern, Value::Null, &context).await,
            Ok(json!(true))
        );
    }
}
