//! Shape generalization for graphs with dynamic inputs.
//!
//! The input ranges of a dynamic graph are narrowed until every range-limited kernel accepts
//! the ranges reaching it, so a bounded set of compiled variants covers them. If that is not
//! possible the graph is pinned to one static shape instead.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::attr::AttrValue;
use crate::catalog::{Catalog, FusionKind, RangeLimit, RangeViolation};
use crate::common::{Dim, DimRange};
use crate::graph::{attr_keys, op_types, Graph, GraphError, Node, NodeId};
use crate::tensor::TensorMark;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum GeneralizeOutcome {
    /// The graph has no dynamic inputs.
    Inactive,
    /// Every range-limited kernel accepts the committed ranges.
    Generalized {
        attempts: u32,
        /// Input axes whose upper bound was lowered, as `(input, axis, range)`.
        narrowed: Vec<(String, usize, DimRange)>,
    },
    /// No acceptable range was found for `input`'s `axis`; the graph now has static shapes.
    Pinned {
        input: String,
        axis: usize,
        attempts: u32,
    },
}

/// A range and the graph input axis it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tracked {
    range: DimRange,
    origin: Option<(NodeId, usize)>,
}

#[derive(Debug, Default)]
struct NodeRanges {
    inputs: Vec<Vec<Tracked>>,
    outputs: Vec<Vec<Tracked>>,
}

/// Steps one input axis's upper bound down from `bound` towards `static_dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DecentState {
    static_dim: u64,
    lower: u64,
    bound: u64,
    step: u64,
    attempt: u32,
    max_attempts: u32,
}

impl DecentState {
    /// Returns `None` if even the static dimension is above `cap`.
    fn new(static_dim: u64, current: DimRange, cap: u64, max_attempts: u32) -> Option<Self> {
        if static_dim > cap {
            return None;
        }
        let bound = current.upper.unwrap_or(cap).min(cap).max(static_dim);
        let step = (bound - static_dim)
            .div_ceil(u64::from(max_attempts.max(1)))
            .max(1);
        Some(DecentState {
            static_dim,
            lower: current.lower,
            bound,
            step,
            attempt: 0,
            max_attempts,
        })
    }

    fn next(&mut self) -> Option<DimRange> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let upper = self
            .bound
            .saturating_sub(u64::from(self.attempt - 1).saturating_mul(self.step))
            .max(self.static_dim);
        Some(DimRange::new(self.lower.min(self.static_dim), Some(upper)))
    }
}

/// Narrows the ranges of `graph`'s dynamic inputs until every bound, range-limited kernel
/// accepts them, trying at most `max_attempts` bounds per input axis.
///
/// Expects kernel bindings to be in place.
pub fn generalize(
    graph: &mut Graph,
    catalog: &Catalog,
    max_attempts: u32,
) -> Result<GeneralizeOutcome, GraphError> {
    if !graph.dynamic_shape {
        return Ok(GeneralizeOutcome::Inactive);
    }
    let order = graph.topo_order()?;
    let mut statics = BTreeMap::new();
    let mut inputs = BTreeMap::new();
    for &id in &order {
        let node = graph.node(id)?;
        if node.op.op_type != op_types::DATA {
            continue;
        }
        statics.insert(id, static_instance(node));
        inputs.insert(id, data_ranges(node));
    }

    let mut states: BTreeMap<(NodeId, usize), DecentState> = BTreeMap::new();
    let mut attempts = 0;
    loop {
        let tracked = propagate(graph, catalog, &order, &inputs)?;
        let Some((culprit, cap)) = first_violation(graph, catalog, &order, &tracked)? else {
            commit(graph, &tracked, true)?;
            let mut narrowed = vec![];
            for &(id, axis) in states.keys() {
                narrowed.push((graph.node(id)?.name.clone(), axis, inputs[&id][axis]));
            }
            log::debug!(
                "Generalized {} after {attempts} attempt(s), narrowed {narrowed:?}",
                graph.name
            );
            return Ok(GeneralizeOutcome::Generalized { attempts, narrowed });
        };

        let next = culprit.and_then(|key @ (id, axis)| {
            if !states.contains_key(&key) {
                let static_dim = *statics.get(&id).and_then(|s| s.get(axis))?;
                let range = *inputs.get(&id).and_then(|r| r.get(axis))?;
                let fresh = DecentState::new(static_dim, range, cap, max_attempts)?;
                states.insert(key, fresh);
            }
            let state = states.get_mut(&key)?;
            state.next().map(|range| (key, range, state.attempt))
        });
        match next {
            Some(((id, axis), range, attempt)) => {
                log::debug!("Attempt {attempt}: {id} axis {axis} -> {range}");
                if let Some(ranges) = inputs.get_mut(&id) {
                    ranges[axis] = range;
                }
                attempts += 1;
            }
            None => {
                let (input, axis) = match culprit {
                    Some((id, axis)) => (graph.node(id)?.name.clone(), axis),
                    None => (graph.name.clone(), 0),
                };
                let tried = culprit
                    .and_then(|key| states.get(&key))
                    .map_or(0, |s| s.attempt);
                log::warn!(
                    "No acceptable range for {input} axis {axis} after {tried} attempt(s); \
                     pinning {} to static shapes",
                    graph.name
                );
                pin(graph, catalog, &order, &statics)?;
                return Ok(GeneralizeOutcome::Pinned {
                    input,
                    axis,
                    attempts: tried,
                });
            }
        }
    }
}

/// The static shape an input is instantiated with.
///
/// A `_static_shape` attribute whose rank differs from the tensor's is ignored.
fn static_instance(node: &Node) -> Vec<u64> {
    let Some(desc) = node.op.outputs.first().map(|s| &s.desc) else {
        return vec![];
    };
    if let Some(dims) = node
        .op
        .attr(attr_keys::STATIC_SHAPE)
        .and_then(AttrValue::as_ints)
    {
        if dims.len() == desc.origin_shape.len() {
            return dims.iter().map(|&d| d.max(1).unsigned_abs()).collect();
        }
        log::warn!(
            "Ignoring {} of {}: rank {} does not match rank {}",
            attr_keys::STATIC_SHAPE,
            node.name,
            dims.len(),
            desc.origin_shape.len()
        );
    }
    desc.origin_shape
        .iter()
        .enumerate()
        .map(|(i, d)| match d {
            Dim::Known(v) => *v,
            Dim::Unknown => desc.shape_range.get(i).map_or(1, |r| r.lower.max(1)),
        })
        .collect()
}

fn data_ranges(node: &Node) -> Vec<DimRange> {
    let Some(desc) = node.op.outputs.first().map(|s| &s.desc) else {
        return vec![];
    };
    desc.origin_shape
        .iter()
        .enumerate()
        .map(|(i, d)| match desc.shape_range.get(i) {
            Some(r) if desc.shape_range.len() == desc.origin_shape.len() => *r,
            _ => DimRange::for_dim(*d),
        })
        .collect()
}

fn untracked(ranges: &[DimRange]) -> Vec<Tracked> {
    ranges
        .iter()
        .map(|&range| Tracked {
            range,
            origin: None,
        })
        .collect()
}

fn desc_ranges(node: &Node, output: usize) -> Vec<Tracked> {
    node.op.outputs.get(output).map_or_else(Vec::new, |s| {
        untracked(&s.desc.shape_range)
    })
}

fn propagate(
    graph: &Graph,
    catalog: &Catalog,
    order: &[NodeId],
    data: &BTreeMap<NodeId, Vec<DimRange>>,
) -> Result<BTreeMap<NodeId, NodeRanges>, GraphError> {
    let mut out: BTreeMap<NodeId, NodeRanges> = BTreeMap::new();
    for &id in order {
        let node = graph.node(id)?;
        let mut ranges = NodeRanges::default();
        for (i, slot) in node.op.inputs.iter().enumerate() {
            let from_producer = graph.producer(id.input(i)).and_then(|src| {
                out.get(&src.node)
                    .and_then(|r| r.outputs.get(src.index))
                    .cloned()
            });
            ranges
                .inputs
                .push(from_producer.unwrap_or_else(|| untracked(&slot.desc.shape_range)));
        }

        if let Some(input_ranges) = data.get(&id) {
            ranges.outputs.push(
                input_ranges
                    .iter()
                    .enumerate()
                    .map(|(axis, &range)| Tracked {
                        range,
                        origin: (!range.is_fixed()).then_some((id, axis)),
                    })
                    .collect(),
            );
        } else {
            let kind = node
                .op
                .kernel
                .as_ref()
                .and_then(|k| catalog.candidate(&node.op.op_type, &k.candidate))
                .map(|c| c.fusion_kind);
            for (o, slot) in node.op.outputs.iter().enumerate() {
                let rank = slot.desc.origin_shape.len();
                let derived = match kind {
                    Some(FusionKind::Elemwise | FusionKind::Broadcast) => {
                        Some(broadcast(&ranges.inputs, rank))
                    }
                    Some(FusionKind::Reduce) => ranges.inputs.first().map(|x| reduce(node, x)),
                    _ => ranges.inputs.first().cloned(),
                };
                ranges.outputs.push(match derived {
                    Some(r) if r.len() == rank => r,
                    _ => desc_ranges(node, o),
                });
            }
        }
        out.insert(id, ranges);
    }
    Ok(out)
}

/// Right-aligned broadcast of `inputs` to `rank` axes. The widest range wins each axis;
/// broadcast axes fixed at 1 are ignored.
fn broadcast(inputs: &[Vec<Tracked>], rank: usize) -> Vec<Tracked> {
    (0..rank)
        .map(|axis| {
            inputs
                .iter()
                .filter_map(|x| {
                    let offset = rank.checked_sub(x.len())?;
                    axis.checked_sub(offset).and_then(|a| x.get(a))
                })
                .filter(|t| t.range != DimRange::fixed(1))
                .copied()
                .max_by_key(|t| (t.range.upper.is_none(), t.range.upper))
                .unwrap_or(Tracked {
                    range: DimRange::fixed(1),
                    origin: None,
                })
        })
        .collect()
}

fn reduce(node: &Node, input: &[Tracked]) -> Vec<Tracked> {
    let rank = input.len();
    let axes: Vec<usize> = match node.op.attr("axes").and_then(AttrValue::as_ints) {
        Some(axes) => axes
            .iter()
            .filter_map(|&a| {
                let a = if a < 0 { a + rank as i64 } else { a };
                usize::try_from(a).ok()
            })
            .collect(),
        None => (0..rank).collect(),
    };
    let keep_dims = node
        .op
        .attr("keep_dims")
        .and_then(AttrValue::as_bool)
        .unwrap_or(false);
    input
        .iter()
        .enumerate()
        .filter_map(|(i, t)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(*t),
            (true, true) => Some(Tracked {
                range: DimRange::fixed(1),
                origin: None,
            }),
            (true, false) => None,
        })
        .collect()
}

/// Finds the first range-limited node that rejects its ranges and the input axis to narrow.
///
/// Returns the axis (if any input axis is to blame) and the per-dimension cap it must
/// respect.
fn first_violation(
    graph: &Graph,
    catalog: &Catalog,
    order: &[NodeId],
    tracked: &BTreeMap<NodeId, NodeRanges>,
) -> Result<Option<(Option<(NodeId, usize)>, u64)>, GraphError> {
    for &id in order {
        let node = graph.node(id)?;
        let Some(limit) = range_limit(node, catalog) else {
            continue;
        };
        let Some(ranges) = tracked.get(&id) else {
            continue;
        };
        for slot in ranges.inputs.iter().chain(&ranges.outputs) {
            let plain: Vec<DimRange> = slot.iter().map(|t| t.range).collect();
            let culprit = match limit.check(&plain) {
                Ok(()) => continue,
                Err(RangeViolation::Dim { axis, .. }) => slot[axis].origin,
                Err(RangeViolation::Volume { .. }) => slot
                    .iter()
                    .filter(|t| t.origin.is_some())
                    .max_by_key(|t| (t.range.upper.is_none(), t.range.upper))
                    .and_then(|t| t.origin),
            };
            log::debug!("{} rejects ranges {plain:?}", node.name);
            return Ok(Some((culprit, limit.max_dim)));
        }
    }
    Ok(None)
}

fn range_limit(node: &Node, catalog: &Catalog) -> Option<RangeLimit> {
    let binding = node.op.kernel.as_ref()?;
    catalog
        .candidate(&node.op.op_type, &binding.candidate)?
        .range_limit
}

/// Writes propagated ranges onto every tensor. Fixed ranges also fix unknown dimensions.
fn commit(
    graph: &mut Graph,
    tracked: &BTreeMap<NodeId, NodeRanges>,
    mark: bool,
) -> Result<(), GraphError> {
    for (&id, ranges) in tracked {
        let op = &mut graph.node_mut(id)?.op;
        let slots = op
            .inputs
            .iter_mut()
            .zip(&ranges.inputs)
            .chain(op.outputs.iter_mut().zip(&ranges.outputs));
        for (slot, r) in slots {
            let desc = &mut slot.desc;
            if r.len() != desc.origin_shape.len() {
                continue;
            }
            desc.shape_range = r.iter().map(|t| t.range).collect();
            let mut fixed_any = false;
            for (dim, t) in desc.origin_shape.iter_mut().zip(r) {
                if *dim == Dim::Unknown && t.range.is_fixed() {
                    *dim = Dim::Known(t.range.lower);
                    fixed_any = true;
                }
            }
            if fixed_any {
                if let Some(shape) =
                    desc.format
                        .derive_shape(desc.origin_format, &desc.origin_shape, desc.dtype)
                {
                    desc.shape = shape;
                }
            }
            if mark {
                desc.mark(TensorMark::RangeGeneralized);
            }
        }
    }
    Ok(())
}

fn pin(
    graph: &mut Graph,
    catalog: &Catalog,
    order: &[NodeId],
    statics: &BTreeMap<NodeId, Vec<u64>>,
) -> Result<(), GraphError> {
    let fixed: BTreeMap<NodeId, Vec<DimRange>> = statics
        .iter()
        .map(|(id, dims)| (*id, dims.iter().map(|&d| DimRange::fixed(d)).collect()))
        .collect();
    let tracked = propagate(graph, catalog, order, &fixed)?;
    commit(graph, &tracked, false)?;
    graph.dynamic_shape = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendKind, KernelCandidate, SlotDecl};
    use crate::common::{Dtype, Format, Shape};
    use crate::graph::GraphBuilder;
    use crate::tensor::TensorDesc;
    use crate::testing::bind_all;
    use proptest::prelude::*;

    fn dynamic(rank: usize, ranges: Vec<DimRange>) -> TensorDesc {
        let shape: Shape = (0..rank).map(|_| Dim::Unknown).collect();
        TensorDesc::new(shape, Dtype::Float16, Format::Nd).with_range(ranges)
    }

    fn catalog(limit: RangeLimit) -> Catalog {
        let f16 = || vec![Dtype::Float16];
        let mut b = Catalog::builder();
        b.add(
            KernelCandidate::new("relu", "Relu", BackendKind::Vector)
                .with_fusion_kind(FusionKind::Elemwise)
                .input(SlotDecl::required("x", f16()))
                .output(SlotDecl::required("y", f16()))
                .with_range_limit(limit),
        );
        b.build().unwrap()
    }

    fn relu_graph(range: DimRange) -> (Graph, NodeId, NodeId) {
        let mut gb = GraphBuilder::new("g").dynamic_shape(true);
        let x = gb.data("x", dynamic(1, vec![range]));
        let relu = gb.op("relu", "Relu", &[x.out(0)], vec![dynamic(1, vec![range])]);
        gb.output("out", &[relu.out(0)]);
        (gb.build().unwrap(), x, relu)
    }

    #[test]
    fn test_static_graphs_are_left_alone() {
        let catalog = catalog(RangeLimit::new(128));
        let (mut g, _, _) = relu_graph(DimRange::unbounded(1));
        g.dynamic_shape = false;
        assert_eq!(
            generalize(&mut g, &catalog, 8).unwrap(),
            GeneralizeOutcome::Inactive
        );
    }

    #[test]
    fn test_unbounded_input_is_capped() {
        let catalog = catalog(RangeLimit::new(128));
        let (mut g, x, relu) = relu_graph(DimRange::unbounded(1));
        bind_all(&mut g, &catalog);

        let outcome = generalize(&mut g, &catalog, 8).unwrap();
        assert_eq!(
            outcome,
            GeneralizeOutcome::Generalized {
                attempts: 1,
                narrowed: vec![("x".to_owned(), 0, DimRange::new(1, Some(128)))],
            }
        );
        let relu = g.node(relu).unwrap();
        for desc in [&relu.op.inputs[0].desc, &relu.op.outputs[0].desc] {
            assert_eq!(desc.shape_range, vec![DimRange::new(1, Some(128))]);
            assert!(desc.has_mark(TensorMark::RangeGeneralized));
        }
        assert!(g.dynamic_shape);
        assert_eq!(g.node(x).unwrap().op.outputs[0].desc.shape[0], Dim::Unknown);
    }

    #[test]
    fn test_volume_cap_steps_down_until_accepted() {
        // Two broadcast inputs; the volume cap forces the wider one down.
        let catalog = catalog(RangeLimit::new(64).with_max_volume(1000));
        let mut gb = GraphBuilder::new("g").dynamic_shape(true);
        let x = gb.data("x", dynamic(2, vec![DimRange::new(1, Some(64)); 2]));
        let relu = gb.op(
            "relu",
            "Relu",
            &[x.out(0)],
            vec![dynamic(2, vec![DimRange::new(1, Some(64)); 2])],
        );
        gb.output("out", &[relu.out(0)]);
        let mut g = gb.build().unwrap();
        bind_all(&mut g, &catalog);

        let GeneralizeOutcome::Generalized { attempts, .. } =
            generalize(&mut g, &catalog, 8).unwrap()
        else {
            panic!("expected a generalized graph");
        };
        assert!(attempts > 1);
        let ranges = &g.node(relu).unwrap().op.outputs[0].desc.shape_range;
        let volume: u64 = ranges.iter().map(|r| r.upper.unwrap()).product();
        assert!(volume <= 1000, "{ranges:?}");
        assert!(ranges.iter().all(|r| r.lower == 1));
    }

    #[test]
    fn test_static_shape_above_cap_pins_graph() {
        let catalog = catalog(RangeLimit::new(128));
        let (mut g, x, relu) = relu_graph(DimRange::unbounded(1));
        bind_all(&mut g, &catalog);
        g.node_mut(x)
            .unwrap()
            .op
            .attrs
            .insert(attr_keys::STATIC_SHAPE.to_owned(), AttrValue::Ints(vec![256]));

        assert_eq!(
            generalize(&mut g, &catalog, 8).unwrap(),
            GeneralizeOutcome::Pinned {
                input: "x".to_owned(),
                axis: 0,
                attempts: 0,
            }
        );
        assert!(!g.dynamic_shape);
        let out = &g.node(relu).unwrap().op.outputs[0].desc;
        assert_eq!(out.shape.as_slice(), &[Dim::Known(256)]);
        assert_eq!(out.shape_range, vec![DimRange::fixed(256)]);
        assert!(!out.has_mark(TensorMark::RangeGeneralized));
    }

    #[test]
    fn test_static_shape_of_wrong_rank_is_ignored() {
        let catalog = catalog(RangeLimit::new(128));
        let shape: Shape = [Dim::Known(4), Dim::Unknown].into_iter().collect();
        let t = || {
            TensorDesc::new(shape.clone(), Dtype::Float16, Format::Nd)
                .with_range(vec![DimRange::fixed(4), DimRange::unbounded(1)])
        };
        let mut gb = GraphBuilder::new("g").dynamic_shape(true);
        let x = gb.data("x", t());
        gb.attr(x, attr_keys::STATIC_SHAPE, AttrValue::Ints(vec![4]));
        let relu = gb.op("relu", "Relu", &[x.out(0)], vec![t()]);
        gb.output("out", &[relu.out(0)]);
        let mut g = gb.build().unwrap();
        bind_all(&mut g, &catalog);

        assert_eq!(static_instance(g.node(x).unwrap()), vec![4, 1]);
        assert_eq!(
            generalize(&mut g, &catalog, 8).unwrap(),
            GeneralizeOutcome::Generalized {
                attempts: 1,
                narrowed: vec![("x".to_owned(), 1, DimRange::new(1, Some(128)))],
            }
        );
    }

    #[test]
    fn test_reduce_drops_or_keeps_axes() {
        let t = |upper| Tracked {
            range: DimRange::new(1, Some(upper)),
            origin: None,
        };
        let mut gb = GraphBuilder::new("g");
        let x = gb.data("x", dynamic(3, vec![DimRange::new(1, Some(8)); 3]));
        let r = gb.op("r", "ReduceSumD", &[x.out(0)], vec![]);
        gb.attr(r, "axes", AttrValue::Ints(vec![-1]));
        let g = gb.build().unwrap();
        let node = g.node(r).unwrap();
        assert_eq!(reduce(node, &[t(2), t(3), t(4)]), vec![t(2), t(3)]);

        let mut node = node.clone();
        node.op.attrs.insert("keep_dims".to_owned(), AttrValue::Bool(true));
        assert_eq!(
            reduce(&node, &[t(2), t(3), t(4)]),
            vec![t(2), t(3), Tracked { range: DimRange::fixed(1), origin: None }]
        );
    }

    #[test]
    fn test_broadcast_prefers_widest_non_unit_axis() {
        let t = |lower, upper: Option<u64>| Tracked {
            range: DimRange::new(lower, upper),
            origin: None,
        };
        let a = vec![t(1, Some(1)), t(1, Some(4))];
        let b = vec![t(1, Some(9)), t(1, None), t(2, Some(2))];
        let merged = broadcast(&[a, b], 3);
        assert_eq!(merged, vec![t(1, Some(9)), t(1, None), t(1, Some(4))]);
    }

    proptest! {
        #[test]
        fn test_decent_steps_are_monotone(
            static_dim in 1u64..200,
            upper in proptest::option::of(1u64..10_000),
            cap in 1u64..4096,
            max_attempts in 1u32..16,
        ) {
            let current = DimRange::new(1, upper.map(|u| u.max(static_dim)));
            let Some(mut state) = DecentState::new(static_dim, current, cap, max_attempts) else {
                prop_assert!(static_dim > cap);
                return Ok(());
            };
            let mut previous = u64::MAX;
            let mut count = 0;
            while let Some(range) = state.next() {
                let u = range.upper.unwrap();
                prop_assert!(u <= previous);
                prop_assert!(u <= cap);
                prop_assert!(u >= static_dim);
                prop_assert!(range.lower <= static_dim);
                previous = u;
                count += 1;
            }
            prop_assert_eq!(count, max_attempts);
            // The last attempt gets close enough to the static dimension.
            prop_assert!(previous - static_dim <= state.step);
        }
    }
}
