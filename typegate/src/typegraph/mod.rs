//! The compiled typegraph document.
//!
//! The document is produced by an external compiler: every cross reference is
//! an integer index into one of the top level arrays. These types only
//! describe its shape, [`SchemaIndex`] validates it and builds lookup tables.

mod index;
mod injection;

use std::collections::BTreeMap;

use indexmap::IndexMap;
pub use index::SchemaIndex;
pub use injection::Injection;
pub use injection::InjectionData;
use serde::Deserialize;
use serde::Serialize;

use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// Index into [`Typegraph::types`].
pub type TypeIdx = u32;
/// Index into [`Typegraph::materializers`].
pub type MaterializerIdx = u32;
/// Index into [`Typegraph::runtimes`].
pub type RuntimeIdx = u32;
/// Index into [`Typegraph::policies`].
pub type PolicyIdx = u32;

/// A compiled typegraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typegraph {
    pub types: Vec<TypeNode>,
    pub materializers: Vec<Materializer>,
    pub runtimes: Vec<Runtime>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    pub meta: Meta,
}

impl Typegraph {
    /// Parse a typegraph from its JSON serialization.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(|err| SchemaError::Parse(err.to_string()))
    }

    /// The typegraph name, which is the title of its root type.
    pub fn name(&self) -> &str {
        self.types
            .first()
            .map(|root| root.title.as_str())
            .unwrap_or_default()
    }
}

/// A node of the type graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeNode {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyIndices>,
    #[serde(flatten)]
    pub kind: TypeKind,
}

impl TypeNode {
    /// The function node, if this type is a function.
    pub fn as_function(&self) -> Option<&FunctionNode> {
        match &self.kind {
            TypeKind::Function(function) => Some(function),
            _ => None,
        }
    }

    /// The name of the type tag, as written in the document.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            TypeKind::Boolean {} => "boolean",
            TypeKind::Integer { .. } => "integer",
            TypeKind::Float { .. } => "float",
            TypeKind::String { .. } => "string",
            TypeKind::File {} => "file",
            TypeKind::Object { .. } => "object",
            TypeKind::List { .. } => "list",
            TypeKind::Optional { .. } => "optional",
            TypeKind::Union { .. } => "union",
            TypeKind::Either { .. } => "either",
            TypeKind::Function(_) => "function",
        }
    }
}

/// The variant specific part of a [`TypeNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypeKind {
    Boolean {},
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<i64>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
        enumeration: Option<Vec<String>>,
    },
    File {},
    Object {
        properties: IndexMap<String, TypeIdx>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required: Vec<String>,
        /// Visible field name to the key used in the runtime output.
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        renames: IndexMap<String, String>,
    },
    List {
        items: TypeIdx,
    },
    Optional {
        item: TypeIdx,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<Value>,
    },
    Union {
        any_of: Vec<TypeIdx>,
    },
    Either {
        one_of: Vec<TypeIdx>,
    },
    Function(FunctionNode),
}

/// A function: an input object, an output type and the materializer that
/// computes the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub input: TypeIdx,
    pub output: TypeIdx,
    pub materializer: MaterializerIdx,
    /// Input field name to the source of its value.
    #[serde(default)]
    pub injections: IndexMap<String, Injection>,
    /// Input fields pre-bound by the schema.
    #[serde(default)]
    pub reduce: IndexMap<String, ReduceEntry>,
    #[serde(default = "default_rate_weight")]
    pub rate_weight: u64,
    /// When set, the weight is multiplied by the number of returned items.
    #[serde(default)]
    pub rate_calls: bool,
}

fn default_rate_weight() -> u64 {
    1
}

/// A value bound to a function input field by the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceEntry {
    pub value: Value,
    /// Whether the caller may still override the value.
    #[serde(default)]
    pub inherit: bool,
}

/// Policies attached to a type: either one policy for every effect or one
/// policy per effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyIndices {
    Policy(PolicyIdx),
    EffectPolicies(EffectPolicies),
}

impl PolicyIndices {
    /// The policy that applies for `effect`, if any.
    pub fn for_effect(&self, effect: EffectKind) -> Option<PolicyIdx> {
        match self {
            PolicyIndices::Policy(idx) => Some(*idx),
            PolicyIndices::EffectPolicies(policies) => match effect {
                EffectKind::Read => policies.read,
                EffectKind::Create => policies.create,
                EffectKind::Update => policies.update,
                EffectKind::Delete => policies.delete,
            },
        }
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = PolicyIdx> + '_ {
        let indices = match self {
            PolicyIndices::Policy(idx) => vec![*idx],
            PolicyIndices::EffectPolicies(p) => [p.read, p.create, p.update, p.delete]
                .into_iter()
                .flatten()
                .collect(),
        };
        indices.into_iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectPolicies {
    #[serde(default)]
    pub read: Option<PolicyIdx>,
    #[serde(default)]
    pub create: Option<PolicyIdx>,
    #[serde(default)]
    pub update: Option<PolicyIdx>,
    #[serde(default)]
    pub delete: Option<PolicyIdx>,
}

/// The side-effect class of a materializer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    #[default]
    Read,
    Create,
    Update,
    Delete,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Read => "read",
            EffectKind::Create => "create",
            EffectKind::Update => "update",
            EffectKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of a materializer; an absent effect means `read`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    #[serde(default)]
    pub effect: Option<EffectKind>,
    #[serde(default)]
    pub idempotent: bool,
}

impl Effect {
    pub fn kind(&self) -> EffectKind {
        self.effect.unwrap_or_default()
    }
}

/// The executable binding behind a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Materializer {
    pub name: String,
    pub runtime: RuntimeIdx,
    #[serde(default)]
    pub effect: Effect,
    #[serde(default)]
    pub data: Object,
}

/// A runtime: `name` is the kind tag, `data` its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub name: String,
    #[serde(default)]
    pub data: Object,
}

/// A named check backed by a materializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub materializer: Option<MaterializerIdx>,
}

/// Document wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub cors: Cors,
    #[serde(default)]
    pub rate: Option<RateConfig>,
    #[serde(default)]
    pub auths: Vec<AuthProvider>,
    #[serde(default)]
    pub queries: Queries,
    #[serde(default)]
    pub version: Option<String>,
}

/// CORS settings of a typegraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cors {
    pub allow_origin: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_sec: Option<u64>,
}

impl Default for Cors {
    fn default() -> Self {
        Self {
            allow_origin: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: true,
            max_age_sec: None,
        }
    }
}

/// Rate limiting settings of a typegraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Total weight a partition may consume in one window.
    pub window_limit: u64,
    pub window_sec: u64,
    /// Maximum weight of a single query.
    pub query_limit: u64,
    /// Dotted path into the claims used as partition key.
    #[serde(default)]
    pub context_identifier: Option<String>,
    #[serde(default)]
    pub local_excess: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProtocol {
    Jwt,
    Basic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProvider {
    pub name: String,
    pub protocol: AuthProtocol,
    #[serde(default)]
    pub auth_data: BTreeMap<String, Value>,
}

/// REST endpoints, each a GraphQL document with a single named operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Queries {
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_nodes() {
        let node: TypeNode = serde_json::from_str(
            r#"{
                "type": "function",
                "title": "func_3",
                "policies": [0, {"read": 1, "update": 2}],
                "input": 4,
                "output": 5,
                "materializer": 0,
                "injections": {
                    "authorId": {"source": "context", "data": {"single": "user.id"}}
                },
                "reduce": {"published": {"value": true}},
                "rate_calls": true
            }"#,
        )
        .unwrap();
        let function = node.as_function().unwrap();
        assert_eq!(function.rate_weight, 1);
        assert!(function.rate_calls);
        assert!(!function.reduce["published"].inherit);
        assert_eq!(node.policies[0].for_effect(EffectKind::Delete), Some(0));
        assert_eq!(node.policies[1].for_effect(EffectKind::Update), Some(2));
        assert_eq!(node.policies[1].for_effect(EffectKind::Create), None);
    }

    #[test]
    fn absent_effect_means_read() {
        let materializer: Materializer =
            serde_json::from_str(r#"{"name": "identity", "runtime": 0}"#).unwrap();
        assert_eq!(materializer.effect.kind(), EffectKind::Read);
    }
}
