use std::collections::BTreeSet;

use crate::catalog::{BackendKind, Catalog, FusionKind};
use crate::fusion::patterns::PatternDef;
use crate::fusion::FusionScope;
use crate::graph::cycle::CycleDetector;
use crate::graph::{Graph, GraphError, NodeId, ScopeId};

/// Finds disjoint fusion scopes, trying `patterns` in order.
///
/// Each pattern walks the graph in topological order and grows the longest chain from every
/// unclaimed head, where each member's outputs feed only the next member. A chain that would
/// close a cycle once collapsed (taking previously accepted scopes as collapsed too) is
/// shortened from the tail until it does not, or dropped. Scope ids ascend in match order.
pub fn match_scopes(
    graph: &Graph,
    catalog: &Catalog,
    patterns: &[&PatternDef],
) -> Result<Vec<FusionScope>, GraphError> {
    let order = graph.topo_order()?;
    let mut detector = CycleDetector::new(graph)?;
    let mut claimed: BTreeSet<NodeId> = BTreeSet::new();
    let mut scopes = vec![];

    for def in patterns {
        for &start in &order {
            if claimed.contains(&start) {
                continue;
            }
            if !fusion_kind(graph, catalog, start).is_some_and(|k| def.head.contains(&k)) {
                continue;
            }
            let Some(members) = grow(graph, catalog, def, start, &claimed, &detector) else {
                continue;
            };
            let set: BTreeSet<NodeId> = members.iter().copied().collect();
            detector.accept(&set);
            claimed.extend(&set);
            let id = ScopeId(u32::try_from(scopes.len() + 1).unwrap_or(u32::MAX));
            log::debug!("Matched {} as {id} over {} node(s)", def.kind, members.len());
            scopes.push(FusionScope {
                id,
                pattern: def.kind,
                members,
            });
        }
    }
    Ok(scopes)
}

fn grow(
    graph: &Graph,
    catalog: &Catalog,
    def: &PatternDef,
    start: NodeId,
    claimed: &BTreeSet<NodeId>,
    detector: &CycleDetector,
) -> Option<Vec<NodeId>> {
    let next_of = |id: NodeId, kinds: &[FusionKind]| {
        sole_consumer(graph, id).filter(|n| {
            !claimed.contains(n) && fusion_kind(graph, catalog, *n).is_some_and(|k| kinds.contains(&k))
        })
    };

    let mut chain = vec![start];
    while let Some(next) = next_of(chain[chain.len() - 1], def.body) {
        chain.push(next);
    }
    if let Some(tail) = def.tail {
        chain.push(next_of(chain[chain.len() - 1], &[tail])?);
    }
    let fixed = 1 + usize::from(def.tail.is_some());

    loop {
        if chain.len() < fixed + def.min_body {
            return None;
        }
        let set: BTreeSet<NodeId> = chain.iter().copied().collect();
        if !detector.would_create_cycle(&set) {
            return Some(chain);
        }
        if def.tail.is_some() {
            return None;
        }
        chain.pop();
    }
}

/// The only node consuming any output of `id`, if there is exactly one.
fn sole_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    let outputs = graph.node(id).ok()?.op.outputs.len();
    let consumers: BTreeSet<NodeId> = (0..outputs)
        .flat_map(|i| graph.consumers(id.out(i)))
        .map(|dst| dst.node)
        .collect();
    match consumers.len() {
        1 => consumers.first().copied(),
        _ => None,
    }
}

/// The fusion role of a node, or `None` if it cannot take part in buffer fusion.
pub fn fusion_kind(graph: &Graph, catalog: &Catalog, id: NodeId) -> Option<FusionKind> {
    let op = &graph.node(id).ok()?.op;
    if op.is_framework() || op.is_trans() || op.fused.is_some() || !op.subgraphs.is_empty() {
        return None;
    }
    let binding = op.kernel.as_ref()?;
    if !matches!(binding.backend, BackendKind::Vector | BackendKind::Cube) {
        return None;
    }
    catalog
        .candidate(&op.op_type, &binding.candidate)
        .map(|c| c.fusion_kind)
}
