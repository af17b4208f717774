//! Engine errors.
use std::sync::Arc;

use displaydoc::Display;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Object;
use crate::json_ext::Path;
pub use crate::rate::RateLimited;

/// Errors raised while indexing a typegraph document.
///
/// Any of these rejects the document: the engine for it is never built.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// typegraph document could not be parsed: {0}
    Parse(String),

    /// type #{from} references missing type #{to}
    DanglingType { from: u32, to: u32 },

    /// type #{from} references missing materializer #{to}
    DanglingMaterializer { from: u32, to: u32 },

    /// type #{from} references missing policy #{to}
    DanglingPolicy { from: u32, to: u32 },

    /// materializer #{from} references missing runtime #{to}
    DanglingRuntime { from: u32, to: u32 },

    /// policy '{policy}' references missing materializer #{to}
    DanglingPolicyMaterializer { policy: String, to: u32 },

    /// input of function #{function} is not an object
    InvalidFunctionInput { function: u32 },

    /// root type must be an object with 'query' and 'mutation' properties
    InvalidRoot,

    /// type name '{0}' is used by structurally different types
    DuplicateTypeName(String),

    /// unknown runtime '{0}'
    UnknownRuntime(String),

    /// no executor available for runtime '{0}'
    MissingExecutor(String),

    /// runtime '{0}' does not support batching
    UnbatchableRuntime(String),

    /// invalid configuration for runtime '{runtime}': {reason}
    InvalidRuntime { runtime: String, reason: String },

    /// invalid auth provider '{provider}': {reason}
    InvalidAuth { provider: String, reason: String },

    /// invalid REST endpoint document: {0}
    InvalidEndpoint(String),
}

/// Errors that prevent a query from being planned.
///
/// Planning errors are fatal for the whole query: no stage is executed and the
/// response carries no data.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanningError {
    /// parsing failed: {reason}
    Parse { reason: String },

    /// must provide a query string
    MissingQuery,

    /// unknown operation named '{name}'
    UnknownOperation { name: String },

    /// must provide operation name if query contains multiple operations
    AmbiguousOperation,

    /// no operation in the document
    NoOperation,

    /// {kind} operations are not supported
    UnsupportedOperation { kind: String },

    /// unknown fragment '{name}'
    UnknownFragment { name: String },

    /// type '{type_name}' has no field '{field}'
    UnknownField { type_name: String, field: String },

    /// unknown type '{name}'
    UnknownType { name: String },

    /// field '{field}' has no argument '{argument}'
    UnknownArgument { field: String, argument: String },

    /// missing required argument '{argument}' on field '{field}'
    MissingArgument { field: String, argument: String },

    /// field '{field}' of type '{type_name}' must have a selection of subfields
    MissingSelectionSet { field: String, type_name: String },

    /// field '{field}' must not have a selection since type '{type_name}' has no subfields
    UnexpectedSelectionSet { field: String, type_name: String },

    /// variable '{name}' of required type was not provided
    MissingVariable { name: String },

    /// undefined variable '{name}'
    UndefinedVariable { name: String },

    /// argument '{argument}' on field '{field}' is bound by the schema and cannot be overridden
    ReducedOverride { field: String, argument: String },

    /// argument '{argument}' on field '{field}' is injected and cannot be provided
    InjectedArgument { field: String, argument: String },

    /// field '{field}' with effect '{effect}' cannot be selected in a {operation}
    EffectMismatch {
        field: String,
        effect: String,
        operation: String,
    },

    /// fields '{response_key}' conflict because they select different fields or arguments
    FieldConflict { response_key: String },

    /// argument '{argument}' of field '{field}' depends on '{dependency}' which is not selected
    MissingDependency {
        field: String,
        argument: String,
        dependency: String,
    },

    /// dependency cycle detected at '{field}'
    DependencyCycle { field: String },

    /// selection is deeper than the configured limit of {limit}
    MaxDepth { limit: usize },

    /// unknown endpoint '{name}'
    UnknownEndpoint { name: String },
}

impl PlanningError {
    /// Convert the planning error to a GraphQL error.
    pub fn to_graphql_error(&self) -> graphql::Error {
        graphql::to_graphql_error(self, None)
    }
}

impl ErrorExtension for PlanningError {
    fn extension_code(&self) -> String {
        match self {
            PlanningError::Parse { .. } => "GRAPHQL_PARSE_FAILED",
            PlanningError::UnknownEndpoint { .. } => "ENDPOINT_NOT_FOUND",
            _ => "PLANNING_ERROR",
        }
        .to_string()
    }
}

/// Errors scoped to a single stage.
///
/// A failed stage turns into `null` plus an error at its response position;
/// independent stages are not affected.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StageError {
    /// authorization failed for '{stage}'
    Denied { stage: String },

    /// authorization failed for '{stage}': missing context value '{path}'
    MissingContext { stage: String, path: String },

    /// secret '{name}' required by '{stage}' is not available
    MissingSecret { stage: String, name: String },

    /// value '{key}' required by '{stage}' is missing from its parent
    MissingParentValue { stage: String, key: String },

    /// policy '{policy}' failed for '{stage}': {reason}
    PolicyFailed {
        stage: String,
        policy: String,
        reason: String,
    },

    /// runtime '{runtime}' failed for '{stage}': {reason}
    Runtime {
        stage: String,
        runtime: String,
        reason: String,
    },

    /// '{stage}' could not run because '{dependency}' failed
    DependencyFailed { stage: String, dependency: String },

    /// batch on runtime '{runtime}' failed for '{stage}': {reason}
    Batch {
        stage: String,
        runtime: String,
        reason: String,
    },
}

impl StageError {
    /// The id of the stage that failed.
    pub fn stage(&self) -> &str {
        match self {
            StageError::Denied { stage }
            | StageError::MissingContext { stage, .. }
            | StageError::MissingSecret { stage, .. }
            | StageError::MissingParentValue { stage, .. }
            | StageError::PolicyFailed { stage, .. }
            | StageError::Runtime { stage, .. }
            | StageError::DependencyFailed { stage, .. }
            | StageError::Batch { stage, .. } => stage,
        }
    }

    /// Convert the stage error to a GraphQL error located at `path`.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        graphql::to_graphql_error(self, path)
    }
}

impl ErrorExtension for StageError {
    fn extension_code(&self) -> String {
        match self {
            StageError::Denied { .. } | StageError::MissingContext { .. } => {
                "AUTHORIZATION_DENIED"
            }
            StageError::MissingSecret { .. } => "SECRET_NOT_FOUND",
            StageError::MissingParentValue { .. } => "INJECTION_FAILED",
            StageError::PolicyFailed { .. } => "POLICY_ERROR",
            StageError::Runtime { .. } => "RUNTIME_ERROR",
            StageError::DependencyFailed { .. } => "DEPENDENCY_FAILED",
            StageError::Batch { .. } => "BATCH_ERROR",
        }
        .to_string()
    }

    fn custom_extension_details(&self) -> Option<Object> {
        let mut details = Object::new();
        details.insert("stage", self.stage().into());
        Some(details)
    }
}

/// Errors returned by runtime executors.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorError {
    /// request failed: {0}
    Request(String),

    /// remote responded with status {status}: {body}
    Status { status: u16, body: String },

    /// response was malformed: {0}
    MalformedResponse(String),

    /// remote returned errors: {0}
    Remote(String),

    /// invalid materializer: {0}
    InvalidMaterializer(String),

    /// operation '{0}' is not supported by this runtime
    Unsupported(String),

    /// {0}
    Failed(String),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        ExecutorError::Request(err.to_string())
    }
}

/// Credential errors, answered with a 401 before any planning.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthenticationError {
    /// malformed authorization header
    MalformedHeader,

    /// unsupported authorization scheme '{0}'
    UnsupportedScheme(String),

    /// no {0} auth provider is configured
    NoProvider(String),

    /// invalid token: {0}
    InvalidToken(String),

    /// invalid credentials for user '{0}'
    InvalidCredentials(String),
}

impl ErrorExtension for AuthenticationError {
    fn extension_code(&self) -> String {
        "UNAUTHENTICATED".to_string()
    }
}

impl AuthenticationError {
    /// Convert the error into a complete GraphQL response.
    pub fn to_response(&self) -> graphql::Response {
        graphql::Response::builder()
            .error(graphql::to_graphql_error(self, None))
            .build()
    }
}

/// Errors that fail a whole query before or instead of stage execution.
#[derive(Error, Display, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// {0}
    Planning(#[from] PlanningError),

    /// {0}
    RateLimited(#[from] RateLimited),

    /// request timed out after {millis}ms
    Timeout { millis: u128 },

    /// only the REST endpoints of this typegraph may be queried
    DynamicQueriesDisabled,

    /// {0}
    Internal(Arc<String>),
}

impl ErrorExtension for QueryError {
    fn extension_code(&self) -> String {
        match self {
            QueryError::Planning(err) => err.extension_code(),
            QueryError::RateLimited(err) => err.extension_code(),
            QueryError::Timeout { .. } => "REQUEST_TIMEOUT".to_string(),
            QueryError::DynamicQueriesDisabled => "DYNAMIC_QUERIES_DISABLED".to_string(),
            QueryError::Internal(_) => "INTERNAL_SERVER_ERROR".to_string(),
        }
    }
}

impl QueryError {
    /// Convert the error into a complete GraphQL response without data.
    pub fn to_response(&self) -> graphql::Response {
        graphql::Response::builder()
            .error(graphql::to_graphql_error(self, None))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_carry_their_code_and_stage() {
        let error = StageError::Runtime {
            stage: "users".to_string(),
            runtime: "deno".to_string(),
            reason: "boom".to_string(),
        };
        let graphql_error = error.to_graphql_error(Some(Path::from("/users")));
        assert_eq!(graphql_error.extension_code().as_deref(), Some("RUNTIME_ERROR"));
        assert_eq!(
            graphql_error.message,
            "runtime 'deno' failed for 'users': boom"
        );
        assert_eq!(
            graphql_error.extensions.get("stage"),
            Some(&"users".into())
        );
        assert_eq!(graphql_error.path, Some(Path::from("/users")));
    }

    #[test]
    fn missing_context_is_an_authorization_error() {
        let error = StageError::MissingContext {
            stage: "me".to_string(),
            path: "user.id".to_string(),
        };
        assert_eq!(error.extension_code(), "AUTHORIZATION_DENIED");
    }

    #[test]
    fn planning_errors_have_no_data() {
        let response = QueryError::from(PlanningError::UnknownField {
            type_name: "Query".to_string(),
            field: "nope".to_string(),
        })
        .to_response();
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("PLANNING_ERROR")
        );
        assert_eq!(response.errors[0].message, "type 'Query' has no field 'nope'");
    }
}
