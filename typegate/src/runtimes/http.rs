//! The HTTP runtime: maps function arguments onto a REST call.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Captures;
use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use reqwest::Method;

use super::data_str;
use super::ExecutionRequest;
use super::Executor;
use crate::error::ExecutorError;
use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::typegraph::Materializer;
use crate::typegraph::Runtime;

static PATH_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(\w+)\}|:(\w+)").expect("path parameter pattern is valid")
});

/// A path with its parameters replaced, and the arguments left over.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSubstitution {
    pub pathname: String,
    pub rest_args: Object,
}

/// Replaces the `{name}` and `:name` parameters of `path` with the matching
/// arguments.
///
/// Parameters without a matching argument are left in the path untouched.
pub fn replace_dynamic_path_params(path: &str, args: &Object) -> PathSubstitution {
    let mut rest_args = args.clone();
    let pathname = PATH_PARAM
        .replace_all(path, |captures: &Captures<'_>| {
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|name| name.as_str())
                .unwrap_or_default();
            match rest_args.remove(name) {
                Some(value) => value.to_plain_string(),
                None => captures[0].to_string(),
            }
        })
        .into_owned();
    PathSubstitution {
        pathname,
        rest_args,
    }
}

pub(crate) struct HttpExecutor {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpExecutor {
    pub(crate) fn new(runtime: &Runtime) -> Result<Self, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidRuntime {
            runtime: runtime.name.clone(),
            reason,
        };
        let endpoint = data_str(&runtime.data, "endpoint")
            .ok_or_else(|| invalid("missing endpoint".to_string()))?
            .trim_end_matches('/')
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

/// Where the arguments of one materializer go.
struct RequestMapping<'a> {
    method: Method,
    path: &'a str,
    query_fields: Option<Vec<&'a str>>,
    body_fields: Option<Vec<&'a str>>,
    header_prefix: Option<&'a str>,
}

impl<'a> RequestMapping<'a> {
    fn from_materializer(materializer: &'a Materializer) -> Result<Self, ExecutorError> {
        let method = data_str(&materializer.data, "method")
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ExecutorError::InvalidMaterializer(format!("unknown method {method}")))?;
        Ok(Self {
            method,
            path: data_str(&materializer.data, "path").unwrap_or_default(),
            query_fields: fields(&materializer.data, "query_fields"),
            body_fields: fields(&materializer.data, "body_fields"),
            header_prefix: data_str(&materializer.data, "header_prefix"),
        })
    }

    fn has_body(&self) -> bool {
        !matches!(self.method, Method::GET | Method::DELETE | Method::HEAD)
    }
}

fn fields<'a>(data: &'a Object, key: &str) -> Option<Vec<&'a str>> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
}

/// Splits arguments between headers, query string and body.
fn split_args(
    mapping: &RequestMapping<'_>,
    args: Object,
) -> Result<(HeaderMap, Vec<(String, String)>, Object), ExecutorError> {
    let mut headers = HeaderMap::new();
    let mut query = Vec::new();
    let mut body = Object::new();
    for (name, value) in args {
        let name = name.as_str();
        if let Some(header) = mapping
            .header_prefix
            .and_then(|prefix| name.strip_prefix(prefix))
        {
            let header = HeaderName::from_bytes(header.as_bytes())
                .map_err(|err| ExecutorError::InvalidMaterializer(err.to_string()))?;
            let value = HeaderValue::from_str(&value.to_plain_string())
                .map_err(|err| ExecutorError::InvalidMaterializer(err.to_string()))?;
            headers.insert(header, value);
            continue;
        }
        if value.is_null() {
            continue;
        }
        let in_query = match &mapping.query_fields {
            Some(fields) => fields.contains(&name),
            None => !mapping.has_body(),
        };
        let in_body = mapping.has_body()
            && match &mapping.body_fields {
                Some(fields) => fields.contains(&name),
                None => !in_query,
            };
        if in_query {
            match &value {
                Value::Array(items) => {
                    query.extend(items.iter().map(|item| (name.to_string(), item.to_plain_string())))
                }
                other => query.push((name.to_string(), other.to_plain_string())),
            }
        }
        if in_body {
            body.insert(name, value);
        }
    }
    Ok((headers, query, body))
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
        let mapping = RequestMapping::from_materializer(request.materializer)?;
        let PathSubstitution {
            pathname,
            rest_args,
        } = replace_dynamic_path_params(mapping.path, request.args);
        let (headers, query, body) = split_args(&mapping, rest_args)?;

        let url = format!("{}{}", self.endpoint, pathname);
        tracing::debug!(method = %mapping.method, %url, "making http request");
        let mut builder = self
            .http_client
            .request(mapping.method.clone(), &url)
            .headers(headers)
            .query(&query);
        if mapping.has_body() {
            builder = builder.json(&Value::Object(body));
        }
        let response = builder.send().await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| ExecutorError::MalformedResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;
    use wiremock::matchers::body_json;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;
    use crate::query_planner::StageId;
    use crate::test_utils::blog_schema;
    use crate::typegraph::EffectKind;
    use crate::Context;

    fn args(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn path_parameters() {
        let args = args(json!({ "postId": 12, "format": "json" }));

        let substitution = replace_dynamic_path_params("/posts/{postId}", &args);
        assert_eq!(substitution.pathname, "/posts/12");
        assert_eq!(substitution.rest_args, self::args(json!({ "format": "json" })));

        let substitution = replace_dynamic_path_params("/posts/:postId/comments", &args);
        assert_eq!(substitution.pathname, "/posts/12/comments");

        let substitution = replace_dynamic_path_params("/users/{userId}/posts/:postId", &args);
        assert_eq!(substitution.pathname, "/users/{userId}/posts/12");
        assert_eq!(substitution.rest_args.len(), 1);
    }

    fn materializer(data: Value) -> Materializer {
        Materializer {
            name: "rest".to_string(),
            runtime: 0,
            effect: Default::default(),
            data: args(data),
        }
    }

    async fn call(
        server: &MockServer,
        materializer: &Materializer,
        args: &Object,
    ) -> Result<Value, ExecutorError> {
        let schema = blog_schema();
        let runtime = Runtime {
            name: "http".to_string(),
            data: self::args(json!({ "endpoint": server.uri() })),
        };
        let executor = HttpExecutor::new(&runtime).unwrap();
        let stage_id = StageId::from("post");
        let context = Context::new();
        let result = executor
            .execute(ExecutionRequest {
                stage_id: &stage_id,
                materializer,
                runtime: &runtime,
                args,
                parent: &Value::Null,
                context: &context,
                effect: EffectKind::Read,
                output_type: 10,
                selection: None,
                schema: &schema,
            })
            .await;
        result
    }

    #[tokio::test]
    async fn get_requests_use_the_query_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts/12"))
            .and(query_param("expand", "author"))
            .and(header("x-tenant", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 12, "title": "Hello"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let value = call(
            &server,
            &materializer(json!({ "method": "GET", "path": "/posts/{id}", "header_prefix": "header_" })),
            &args(json!({ "id": 12, "expand": "author", "header_x-tenant": "acme" })),
        )
        .await
        .unwrap();
        assert_eq!(value, json!({ "id": 12, "title": "Hello" }));
    }

    #[tokio::test]
    async fn post_requests_send_a_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/posts"))
            .and(query_param("dryRun", "true"))
            .and(body_json(serde_json::json!({ "title": "New" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": 13 })))
            .expect(1)
            .mount(&server)
            .await;

        let value = call(
            &server,
            &materializer(json!({ "method": "post", "path": "/posts", "query_fields": ["dryRun"] })),
            &args(json!({ "title": "New", "dryRun": true })),
        )
        .await
        .unwrap();
        assert_eq!(value, json!({ "id": 13 }));
    }

    #[tokio::test]
    async fn error_statuses_fail_the_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such post"))
            .mount(&server)
            .await;

        let err = call(
            &server,
            &materializer(json!({ "path": "/posts/{id}" })),
            &args(json!({ "id": 1 })),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            ExecutorError::Status {
                status: 404,
                body: "no such post".to_string()
            }
        );
    }

    #[test]
    fn endpoint_is_required() {
        let runtime = Runtime {
            name: "http".to_string(),
            data: Object::new(),
        };
        assert!(matches!(
            HttpExecutor::new(&runtime),
            Err(SchemaError::InvalidRuntime { .. })
        ));
    }
}
