//! GraphQL operation planning.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

pub use self::fetch::OperationKind;
pub use self::fetch::QueryHash;
pub(crate) use self::execution::ExecutionParameters;
pub use self::planner::Planner;
use crate::json_ext::Path;
use crate::spec::Query;

mod execution;
pub(crate) mod fetch;
mod planner;
pub(crate) mod selection;

pub(crate) const FETCH_SPAN_NAME: &str = "fetch";
pub(crate) const FLATTEN_SPAN_NAME: &str = "flatten";
pub(crate) const SEQUENCE_SPAN_NAME: &str = "sequence";
pub(crate) const PARALLEL_SPAN_NAME: &str = "parallel";

/// A plan for a given GraphQL operation.
///
/// Plans are immutable once built and shared between executions.
#[derive(Debug)]
pub struct QueryPlan {
    pub(crate) root: PlanNode,
    pub(crate) query: Arc<Query>,
}

impl QueryPlan {
    pub fn operation_kind(&self) -> OperationKind {
        self.query.kind
    }

    pub fn contains_mutations(&self) -> bool {
        self.root.contains_mutations()
    }

    /// Number of fetch nodes in the plan.
    pub fn fetches(&self) -> usize {
        self.root.fetches()
    }

    /// JSON representation of the plan tree.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.root).unwrap_or_default()
    }
}

/// Query plans are composed of a set of nodes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", tag = "kind")]
pub(crate) enum PlanNode {
    /// These nodes must be executed in order.
    Sequence {
        /// The plan nodes that make up the sequence execution.
        nodes: Vec<PlanNode>,
    },

    /// These nodes may be executed in parallel.
    Parallel {
        /// The plan nodes that make up the parallel execution.
        nodes: Vec<PlanNode>,
    },

    /// Fetch some data from a data source.
    Fetch(fetch::FetchNode),

    /// Merge the current resultset with the response.
    Flatten(FlattenNode),
}

/// A flatten node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FlattenNode {
    /// The path when result should be merged.
    pub(crate) path: Path,

    /// The child execution plan.
    pub(crate) node: Box<PlanNode>,
}

impl PlanNode {
    pub(crate) fn contains_mutations(&self) -> bool {
        match self {
            Self::Sequence { nodes } => nodes.iter().any(|n| n.contains_mutations()),
            Self::Parallel { nodes } => nodes.iter().any(|n| n.contains_mutations()),
            Self::Fetch(fetch_node) => fetch_node.operation_kind == OperationKind::Mutation,
            Self::Flatten(_) => false,
        }
    }

    pub(crate) fn fetches(&self) -> usize {
        match self {
            Self::Sequence { nodes } | Self::Parallel { nodes } => {
                nodes.iter().map(PlanNode::fetches).sum()
            }
            Self::Fetch(_) => 1,
            Self::Flatten(flatten) => flatten.node.fetches(),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Self::Sequence { nodes } | Self::Parallel { nodes } => {
                let name = if matches!(self, Self::Sequence { .. }) {
                    "Sequence"
                } else {
                    "Parallel"
                };
                writeln!(f, "{pad}{name} {{")?;
                for node in nodes {
                    node.write_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}},")
            }
            Self::Fetch(fetch) => {
                writeln!(
                    f,
                    "{pad}Fetch(source: {:?}, kind: {:?}) {{",
                    fetch.source_id,
                    fetch.kind
                )?;
                writeln!(f, "{pad}  {}", fetch.operation)?;
                writeln!(f, "{pad}}},")
            }
            Self::Flatten(flatten) => {
                writeln!(f, "{pad}Flatten(path: \"{}\") {{", flatten.path)?;
                flatten.node.write_indented(f, indent + 1)?;
                writeln!(f, "{pad}}},")
            }
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QueryPlan {{")?;
        self.root.write_indented(f, 1)?;
        f.write_str("}")
    }
}

pub(crate) mod log {
    use crate::query_planner::PlanNode;

    pub(crate) fn trace_query_plan(plan: &PlanNode) {
        tracing::trace!("query plan\n{plan}");
    }
}
