//! The GraphQL runtime: forwards a stage to a remote GraphQL service.

use std::fmt::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::data_str;
use super::ExecutionRequest;
use super::Executor;
use crate::error::ExecutorError;
use crate::error::SchemaError;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::typegraph::Runtime;

pub(crate) struct GraphQLExecutor {
    http_client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<graphql::Error>,
}

impl GraphQLExecutor {
    pub(crate) fn new(runtime: &Runtime) -> Result<Self, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidRuntime {
            runtime: runtime.name.clone(),
            reason,
        };
        let endpoint = data_str(&runtime.data, "endpoint")
            .ok_or_else(|| invalid("missing endpoint".to_string()))?
            .to_string();
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Some(Duration::from_secs(5)))
            .build()
            .map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            http_client,
            endpoint,
        })
    }
}

/// The remote field a stage reads: the `field` of the materializer, or the
/// name of the stage field.
fn remote_field<'a>(request: &ExecutionRequest<'a>) -> &'a str {
    data_str(&request.materializer.data, "field").unwrap_or_else(|| {
        let segment = request.stage_id.last_segment().unwrap_or_default();
        segment.split_once('@').map_or(segment, |(name, _)| name)
    })
}

/// Renders the operation sent to the remote service.
pub(crate) fn render_operation(
    operation: &str,
    field: &str,
    args: &Object,
    selection: Option<&str>,
) -> String {
    let mut query = format!("{operation} {{ {field}");
    if !args.is_empty() {
        query.push('(');
        for (i, (name, value)) in args.iter().enumerate() {
            if i > 0 {
                query.push_str(", ");
            }
            let _ = write!(query, "{}: ", name.as_str());
            write_literal(&mut query, value);
        }
        query.push(')');
    }
    if let Some(selection) = selection {
        query.push(' ');
        query.push_str(selection);
    }
    query.push_str(" }");
    query
}

/// Writes a value as a GraphQL input literal.
fn write_literal(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(out, item);
            }
            out.push(']');
        }
        Value::Object(object) => {
            out.push('{');
            for (i, (name, value)) in object.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", name.as_str());
                write_literal(out, value);
            }
            out.push('}');
        }
        // JSON strings, numbers, booleans and null are valid GraphQL literals
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

#[async_trait]
impl Executor for GraphQLExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
        let operation = match request.materializer.name.as_str() {
            "mutation" => "mutation",
            _ => "query",
        };
        let field = remote_field(&request);
        let query = render_operation(operation, field, request.args, request.selection);
        tracing::debug!(endpoint = %self.endpoint, %query, "forwarding to remote graphql");

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        let remote: RemoteResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ExecutorError::MalformedResponse(err.to_string()))?;
        if !remote.errors.is_empty() {
            let messages: Vec<&str> = remote.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ExecutorError::Remote(messages.join("; ")));
        }
        remote
            .data
            .as_ref()
            .and_then(|data| data.get(field))
            .cloned()
            .ok_or_else(|| ExecutorError::MalformedResponse(format!("missing field {field}")))
    }
}
