//! Format and dtype judgement.
//!
//! [FormatJudge] binds every kernel node to a candidate, writes the candidate's formats and
//! dtypes onto the node's tensors, forces shared layouts along [ReflectionRelations], and
//! finally inserts conversion nodes wherever a producer and consumer still disagree.

pub mod heavy;
pub mod judge;
pub mod reflection;
pub mod trans;

pub use judge::{FormatJudge, JudgeState, JudgeSummary, UnsupportedNode};
pub use reflection::{ReflectionRelations, SlotRef};

use crate::graph::GraphError;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PropagateError {
    #[error("Judge is {found}, but the step requires {expected}")]
    OutOfOrder {
        expected: JudgeState,
        found: JudgeState,
    },
    #[error("Graph topology changed since the previous judge step")]
    StaleGraph,
    #[error("{} operator(s) not supported", .0.len())]
    Unsupported(Vec<UnsupportedNode>),
    #[error("Format conflict at {node} ({slot}): {detail}")]
    FormatConflict {
        node: String,
        slot: String,
        detail: String,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}
