use std::collections::{BTreeSet, HashMap};

use crate::graph::{Graph, GraphError, NodeId};

/// Answers whether collapsing a group of nodes into one node would introduce a cycle.
///
/// Groups registered with [CycleDetector::accept] are treated as already collapsed, so a
/// sequence of accepted groups is jointly acyclic, not just individually.
pub struct CycleDetector {
    position: HashMap<NodeId, usize>,
    successors: HashMap<NodeId, BTreeSet<NodeId>>,
    group_of: HashMap<NodeId, usize>,
    groups: Vec<Vec<NodeId>>,
}

impl CycleDetector {
    pub fn new(graph: &Graph) -> Result<Self, GraphError> {
        let order = graph.topo_order()?;
        let position = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let successors = order
            .iter()
            .map(|id| (*id, graph.successors(*id)))
            .collect();
        Ok(CycleDetector {
            position,
            successors,
            group_of: HashMap::new(),
            groups: vec![],
        })
    }

    /// Returns `true` if some path leaves `group` and re-enters it.
    pub fn would_create_cycle(&self, group: &BTreeSet<NodeId>) -> bool {
        let Some(max_pos) = group.iter().filter_map(|n| self.position.get(n)).max() else {
            return false;
        };

        let mut stack: Vec<NodeId> = group
            .iter()
            .flat_map(|m| self.successors_of(*m))
            .filter(|s| !group.contains(s))
            .collect();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        while let Some(n) = stack.pop() {
            if group.contains(&n) {
                return true;
            }
            if !visited.insert(n) {
                continue;
            }
            let members = self.collapsed_members(n);
            if self.min_position(&members) > *max_pos {
                // Everything reachable from here sits later in the order than every member.
                continue;
            }
            for m in members {
                visited.insert(m);
                stack.extend(self.successors_of(m));
            }
        }
        false
    }

    /// Records `group` as collapsed for subsequent queries.
    pub fn accept(&mut self, group: &BTreeSet<NodeId>) {
        let idx = self.groups.len();
        for m in group {
            self.group_of.insert(*m, idx);
        }
        self.groups.push(group.iter().copied().collect());
    }

    fn successors_of(&self, n: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.successors.get(&n).into_iter().flatten().copied()
    }

    fn collapsed_members(&self, n: NodeId) -> Vec<NodeId> {
        match self.group_of.get(&n) {
            Some(&g) => self.groups[g].clone(),
            None => vec![n],
        }
    }

    fn min_position(&self, members: &[NodeId]) -> usize {
        members
            .iter()
            .filter_map(|m| self.position.get(m))
            .min()
            .copied()
            .unwrap_or(usize::MAX)
    }
}
