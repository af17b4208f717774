//! Query planning and execution.

use std::fmt;

use apollo_compiler::ast;
use serde::Deserialize;
use serde::Serialize;

pub(crate) mod composer;
pub(crate) mod execution;
pub(crate) mod injection;
mod planner;
mod stage;

pub(crate) use self::planner::operation_names;
pub use self::planner::QueryPlan;
pub use self::planner::QueryPlanner;
pub use self::planner::ShapeNode;
pub use self::stage::get_child_id;
pub use self::stage::get_child_node;
pub use self::stage::get_parent_id;
pub use self::stage::ArgumentBinding;
pub use self::stage::Stage;
pub use self::stage::StageId;
pub use self::stage::StageKind;

pub(crate) const PLAN_SPAN_NAME: &str = "plan";
pub(crate) const EXECUTE_SPAN_NAME: &str = "execute";
pub(crate) const STAGE_SPAN_NAME: &str = "stage";
pub(crate) const BATCH_SPAN_NAME: &str = "batch";
pub(crate) const POLICY_SPAN_NAME: &str = "policy";

/// The kind of the planned operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ast::OperationType> for OperationKind {
    fn from(operation_type: ast::OperationType) -> Self {
        match operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}
