//! The HTTP surface of the gateway.
//!
//! Every typegraph is served under its own name: `POST /{name}` takes GraphQL
//! requests and `/{name}/rest/{endpoint}` runs the named endpoint documents.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::to_bytes;
use axum::extract::ConnectInfo;
use axum::extract::Path;
use axum::extract::Request;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use http::HeaderName;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use tower_http::cors::AllowOrigin;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::QueryError;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::typegraph::Cors;
use crate::Context;
use crate::Engine;
use crate::Query;

const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;
const FORWARDED_FOR: &str = "x-forwarded-for";

/// The router serving `engines`.
pub fn main_router(engines: impl IntoIterator<Item = Arc<Engine>>) -> Router {
    let router = engines
        .into_iter()
        .fold(Router::new(), |router, engine| {
            tracing::info!(typegraph = %engine.name(), "serving typegraph");
            router.merge(typegraph_router(engine))
        });
    router.layer(TraceLayer::new_for_http())
}

fn typegraph_router(engine: Arc<Engine>) -> Router {
    let name = engine.name().to_string();
    Router::new()
        .route(&format!("/{name}"), post(handle_graphql))
        .route(
            &format!("/{name}/rest/{{endpoint}}"),
            get(handle_rest).post(handle_rest),
        )
        .layer(cors_layer(engine.cors()))
        .with_state(engine)
}

fn cors_layer(cors: &Cors) -> CorsLayer {
    let any_origin = cors.allow_origin.iter().any(|origin| origin == "*");
    let origins = if any_origin {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            cors.allow_origin
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    let mut layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(origins)
        .allow_headers(header_names(&cors.allow_headers))
        .expose_headers(header_names(&cors.expose_headers))
        // credentials cannot be combined with a wildcard origin
        .allow_credentials(cors.allow_credentials && !any_origin);
    if let Some(max_age) = cors.max_age_sec {
        layer = layer.max_age(Duration::from_secs(max_age));
    }
    layer
}

fn header_names(names: &[String]) -> Vec<HeaderName> {
    names
        .iter()
        .filter_map(|name| HeaderName::try_from(name.as_str()).ok())
        .collect()
}

/// The query context of a request, or the response rejecting its
/// credentials.
fn request_context(engine: &Engine, request: &Request) -> Result<Context, Response> {
    let claims = engine.authenticate(request.headers()).map_err(|err| {
        tracing::debug!(%err, "authentication failed");
        (StatusCode::UNAUTHORIZED, Json(err.to_response())).into_response()
    })?;
    let mut context = Context::new().with_claims(claims);
    if let Some(addr) = client_addr(request) {
        context = context.with_client_addr(addr);
    }
    Ok(context)
}

fn client_addr(request: &Request) -> Option<String> {
    request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

fn bad_request(message: String) -> Response {
    let response = graphql::Response::builder()
        .error(
            graphql::Error::builder()
                .message(message)
                .extension_code("INVALID_REQUEST")
                .build(),
        )
        .build();
    (StatusCode::BAD_REQUEST, Json(response)).into_response()
}

async fn handle_graphql(State(engine): State<Arc<Engine>>, request: Request) -> Response {
    let context = match request_context(&engine, &request) {
        Ok(context) => context,
        Err(response) => return response,
    };
    if !engine.accepts_dynamic_queries() {
        return (
            StatusCode::FORBIDDEN,
            Json(QueryError::DynamicQueriesDisabled.to_response()),
        )
            .into_response();
    }
    let body = match to_bytes(request.into_body(), MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(err) => return bad_request(err.to_string()),
    };
    let request: graphql::Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(format!("invalid GraphQL request: {err}")),
    };
    let response = engine
        .execute(Query::builder().request(request).context(context).build())
        .await;
    Json(response).into_response()
}

async fn handle_rest(
    State(engine): State<Arc<Engine>>,
    Path(endpoint): Path<String>,
    request: Request,
) -> Response {
    let context = match request_context(&engine, &request) {
        Ok(context) => context,
        Err(response) => return response,
    };
    let method = request.method().clone();
    let variables = if method == Method::GET {
        query_variables(request.uri().query().unwrap_or_default())
    } else {
        let body = match to_bytes(request.into_body(), MAX_BODY_SIZE).await {
            Ok(body) => body,
            Err(err) => return bad_request(err.to_string()),
        };
        if body.is_empty() {
            Object::new()
        } else {
            match serde_json::from_slice::<Value>(&body) {
                Ok(Value::Object(variables)) => variables,
                Ok(_) => return bad_request("variables must be a JSON object".to_string()),
                Err(err) => return bad_request(format!("invalid variables: {err}")),
            }
        }
    };
    let response = engine
        .execute_rest(&endpoint, variables, context, &method)
        .await;
    Json(response).into_response()
}

/// Query string pairs as variables. Values are read as JSON where they parse,
/// as strings otherwise.
fn query_variables(query: &str) -> Object {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    pairs
        .into_iter()
        .map(|(name, raw)| {
            let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::from(raw));
            (name.into(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use http::header::AUTHORIZATION;
    use http::header::CONTENT_TYPE;
    use serde_json_bytes::json;
    use tower::ServiceExt;

    use super::*;
    use crate::test_utils::blog_engine;
    use crate::test_utils::MockFactory;

    fn router() -> Router {
        main_router([Arc::new(blog_engine(&MockFactory::default()))])
    }

    async fn send(request: http::Request<Body>) -> (StatusCode, graphql::Response) {
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn graphql_request(query: &str) -> http::Request<Body> {
        http::Request::post("/blog")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "query": query }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn serves_graphql() {
        let (status, response) = send(graphql_request("{ users(take: 1) { id name } }")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.data,
            Some(json!({ "users": [{ "id": 1, "name": "Ada" }] }))
        );
    }

    #[tokio::test]
    async fn rejects_invalid_credentials() {
        let mut request = graphql_request("{ users { id } }");
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", BASE64.encode("admin:nope"))).unwrap(),
        );
        let (status, response) = send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("UNAUTHENTICATED")
        );
    }

    #[tokio::test]
    async fn rejects_malformed_bodies() {
        let request = http::Request::post("/blog")
            .body(Body::from("{"))
            .unwrap();
        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn serves_rest_endpoints() {
        let request = http::Request::get("/blog/rest/listUsers?take=1")
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.data,
            Some(json!({ "users": [{ "id": 1, "name": "Ada" }] }))
        );

        let request = http::Request::post("/blog/rest/listUsers")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{ "take": 2 }"#))
            .unwrap();
        let (_, response) = send(request).await;
        let users = response.data.as_ref().and_then(|data| data.get("users"));
        assert_eq!(users.and_then(Value::as_array).map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn unknown_typegraphs_are_not_found() {
        let response = router()
            .oneshot(http::Request::post("/shop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn query_string_values_are_json_when_they_parse() {
        let variables = query_variables("take=2&name=Ada&ids=%5B1%2C2%5D");
        assert_eq!(variables.get("take"), Some(&json!(2)));
        assert_eq!(variables.get("name"), Some(&json!("Ada")));
        assert_eq!(variables.get("ids"), Some(&json!([1, 2])));
    }

    #[test]
    fn forwarded_addresses_win() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert(FORWARDED_FOR, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 80))));
        assert_eq!(client_addr(&request).as_deref(), Some("10.0.0.1"));

        request.headers_mut().remove(FORWARDED_FOR);
        assert_eq!(client_addr(&request).as_deref(), Some("127.0.0.1"));
    }
}
