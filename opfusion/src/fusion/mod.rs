//! Buffer fusion: grouping chains of kernels into single compiled units.
//!
//! The engine runs in three steps. [matching] finds disjoint [FusionScope]s in the judged
//! graph, [merge] replaces each scope by one `FusedOp` node (reversibly), and [engine] compiles
//! the fused nodes, dissolving any scope the backend rejects.

pub mod engine;
pub mod matching;
pub mod merge;
pub mod patterns;

pub use engine::{run_buffer_fusion, FusionContext, FusionOutcome};
pub use matching::match_scopes;
pub use merge::{merge_scope, unmerge, MergeAccumulator};
pub use patterns::PatternKind;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::graph::{InAnchor, Node, NodeId, OutAnchor, ScopeId};

/// A group of nodes selected for fusion. `members` are in topological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionScope {
    pub id: ScopeId,
    pub pattern: PatternKind,
    pub members: Vec<NodeId>,
}

/// Everything needed to turn a fused node back into its members.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FusedBody {
    pub scope: ScopeId,
    pub pattern: PatternKind,
    /// The removed member nodes, in scope order, keeping their original ids.
    pub members: Vec<Node>,
    /// Data edges between members.
    pub internal_edges: Vec<(OutAnchor, InAnchor)>,
    /// For each fused input, the member inputs it feeds.
    pub input_map: Vec<Vec<InAnchor>>,
    /// For each fused output, the member output it exposes.
    pub output_map: Vec<OutAnchor>,
    /// Data edges entering the scope, as they were before the merge.
    pub external_inputs: Vec<(OutAnchor, InAnchor)>,
    /// Data edges leaving the scope, as they were before the merge.
    pub external_outputs: Vec<(OutAnchor, InAnchor)>,
    /// Control edges touching at least one member, as they were before the merge.
    pub control_edges: Vec<(NodeId, NodeId)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatternStats {
    pub matched: usize,
    pub applied: usize,
}

/// Match and application counts per fusion pattern or structural pass, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FusionStats(IndexMap<String, PatternStats>);

impl FusedBody {
    pub fn member_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

impl FusionStats {
    pub fn record(&mut self, name: &str, matched: usize, applied: usize) {
        let entry = self.0.entry(name.to_owned()).or_default();
        entry.matched += matched;
        entry.applied += applied;
    }

    pub fn get(&self, name: &str) -> PatternStats {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatternStats)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn absorb(&mut self, other: &FusionStats) {
        for (name, s) in other.iter() {
            self.record(name, s.matched, s.applied);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate_in_first_seen_order() {
        let mut stats = FusionStats::default();
        stats.record("ElemwiseChain", 1, 0);
        stats.record("IdentityElimination", 2, 2);
        stats.record("ElemwiseChain", 1, 1);
        let mut other = FusionStats::default();
        other.record("ConvElemwise", 1, 1);
        stats.absorb(&other);

        let names: Vec<_> = stats.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["ElemwiseChain", "IdentityElimination", "ConvElemwise"]);
        assert_eq!(
            stats.get("ElemwiseChain"),
            PatternStats {
                matched: 2,
                applied: 1
            }
        );
        assert_eq!(stats.get("MatmulElemwise"), PatternStats::default());
    }
}
