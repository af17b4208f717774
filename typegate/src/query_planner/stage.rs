use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::json_ext::Value;
use crate::typegraph::EffectKind;
use crate::typegraph::MaterializerIdx;
use crate::typegraph::PolicyIdx;
use crate::typegraph::RuntimeIdx;
use crate::typegraph::TypeIdx;

/// Separator between the segments of a stage id.
pub const SEPARATOR: char = '.';
/// Prefix of the segment of a polymorphic branch.
pub const BRANCH_PREFIX: char = '$';

/// Identifier of a stage: the dotted path of its segments.
///
/// The root of a plan is the empty id, stages selected at the root of the
/// operation have a single segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn root() -> Self {
        StageId(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|segment| !segment.is_empty())
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Whether the last segment marks a polymorphic branch.
    pub fn is_branch(&self) -> bool {
        self.last_segment()
            .is_some_and(|segment| segment.starts_with(BRANCH_PREFIX))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        StageId(s.to_string())
    }
}

/// Id of the stage `node` below `parent`.
pub fn get_child_id(parent: &StageId, node: &str) -> StageId {
    if parent.is_root() {
        StageId(node.to_string())
    } else {
        StageId(format!("{}{SEPARATOR}{node}", parent.0))
    }
}

/// Id of the parent of `id`; the root has no parent.
pub fn get_parent_id(id: &StageId) -> Option<StageId> {
    if id.is_root() {
        return None;
    }
    Some(match id.0.rsplit_once(SEPARATOR) {
        Some((parent, _)) => StageId(parent.to_string()),
        None => StageId::root(),
    })
}

/// The segment of `id` below `parent`, when `id` is a direct child of `parent`.
pub fn get_child_node<'a>(parent: &StageId, id: &'a StageId) -> Option<&'a str> {
    let node = if parent.is_root() {
        id.0.as_str()
    } else {
        id.0.strip_prefix(parent.0.as_str())?
            .strip_prefix(SEPARATOR)?
    };
    (!node.is_empty() && !node.contains(SEPARATOR)).then_some(node)
}

/// Where the value of a function argument comes from.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArgumentBinding {
    /// Caller supplied, reduced or default value.
    Value { value: Value },
    /// Dotted path into the request context.
    Context { path: String, optional: bool },
    Secret { name: String },
    /// Key of the parent object, as returned by its runtime.
    Parent { key: String, optional: bool },
    /// Result of a sibling function stage.
    Sibling {
        field: String,
        stage: StageId,
        optional: bool,
    },
    Random { type_idx: TypeIdx },
    Now,
}

/// What a stage does.
#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    /// Invokes a materializer on its runtime.
    Function {
        function: TypeIdx,
        materializer: MaterializerIdx,
        runtime: RuntimeIdx,
        arguments: IndexMap<String, ArgumentBinding>,
        rate_weight: u64,
        rate_calls: bool,
        /// Sub-selection to forward, for runtimes that execute GraphQL.
        selection: Option<String>,
    },
    /// Reads a key of the parent object.
    Field { source_key: String },
    /// `__typename` of the enclosing object.
    Typename { title: String },
    /// The children that apply when a polymorphic value is of type `variant`.
    Branch { variant: TypeIdx, title: String },
}

/// One node of a query plan.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub id: StageId,
    pub parent: StageId,
    pub field_name: String,
    pub kind: StageKind,
    /// Output type of the stage.
    pub type_idx: TypeIdx,
    pub effect: EffectKind,
    /// Policy chain for `effect`.
    pub policies: Vec<PolicyIdx>,
    pub check_policies: bool,
    pub children: Vec<StageId>,
    /// Sibling stages whose results feed this stage's arguments.
    pub depends_on: Vec<StageId>,
}

impl Stage {
    pub fn is_function(&self) -> bool {
        matches!(self.kind, StageKind::Function { .. })
    }

    pub fn runtime(&self) -> Option<RuntimeIdx> {
        match &self.kind {
            StageKind::Function { runtime, .. } => Some(*runtime),
            _ => None,
        }
    }

    pub fn rate_weight(&self) -> u64 {
        match &self.kind {
            StageKind::Function { rate_weight, .. } => *rate_weight,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_and_parent_are_inverses() {
        let parents = [
            StageId::root(),
            StageId::from("users"),
            StageId::from("users.posts@recent"),
            StageId::from("search.$Post"),
        ];
        for parent in &parents {
            for node in ["id", "posts@recent", "$User", "__typename"] {
                let child = get_child_id(parent, node);
                assert_eq!(get_parent_id(&child).as_ref(), Some(parent));
                assert_eq!(get_child_node(parent, &child), Some(node));
            }
        }
    }

    #[test]
    fn navigation_edge_cases() {
        assert_eq!(get_parent_id(&StageId::root()), None);
        assert_eq!(get_parent_id(&StageId::from("users")), Some(StageId::root()));
        // grandchildren are not children
        assert_eq!(
            get_child_node(&StageId::from("users"), &StageId::from("users.posts.id")),
            None
        );
        // a shared prefix is not a parent
        assert_eq!(
            get_child_node(&StageId::from("user"), &StageId::from("users.id")),
            None
        );
        assert_eq!(get_child_node(&StageId::root(), &StageId::from("a.b")), None);
    }

    #[test]
    fn branch_segments() {
        let id = get_child_id(&StageId::from("search"), "$Post");
        assert!(id.is_branch());
        assert_eq!(id.depth(), 2);
        assert!(!get_child_id(&id, "title").is_branch());
    }
}
