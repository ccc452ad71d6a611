use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::Catalog;
use crate::common::Format;
use crate::config::PrecisionMode;
use crate::graph::{Graph, KernelBinding, NodeId, SlotDir};
use crate::matcher::{decl, supported, MatchFailure, MatchOutcome, MatchPolicy};
use crate::propagate::heavy::propagate_heavy;
use crate::propagate::reflection::ReflectionRelations;
use crate::propagate::trans::insert_trans_nodes;
use crate::propagate::PropagateError;
use crate::tensor::TensorMark;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
)]
pub enum JudgeState {
    Unjudged,
    CandidateSelected,
    FormatDtypeAssigned,
    HeavyFormatPropagated,
    TransNodesInserted,
}

/// A node no candidate accepted, with the reason each candidate gave.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedNode {
    pub name: String,
    pub op_type: String,
    pub attempts: Vec<(String, MatchFailure)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JudgeSummary {
    pub judged: usize,
    /// Nodes bound to a column that needs a float32 -> float16 relaxation.
    pub relaxed: usize,
    pub heavy_propagated: usize,
    pub trans_inserted: usize,
}

/// Runs the judge steps on one graph, in order.
///
/// Each step checks that the previous one ran and that the graph topology has not changed in
/// between.
pub struct FormatJudge<'a> {
    catalog: &'a Catalog,
    mode: PrecisionMode,
    state: JudgeState,
    version: Option<u64>,
    selections: BTreeMap<NodeId, (String, MatchOutcome)>,
    summary: JudgeSummary,
}

impl fmt::Display for UnsupportedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.op_type)?;
        if self.attempts.is_empty() {
            return write!(f, ": no kernel candidates");
        }
        for (candidate, failure) in &self.attempts {
            write!(f, "\n  {candidate}: {failure}")?;
        }
        Ok(())
    }
}

impl<'a> FormatJudge<'a> {
    pub fn new(catalog: &'a Catalog, mode: PrecisionMode) -> Self {
        FormatJudge {
            catalog,
            mode,
            state: JudgeState::Unjudged,
            version: None,
            selections: BTreeMap::new(),
            summary: JudgeSummary::default(),
        }
    }

    pub fn state(&self) -> JudgeState {
        self.state
    }

    pub fn summary(&self) -> JudgeSummary {
        self.summary
    }

    /// Runs every step.
    pub fn run(mut self, graph: &mut Graph) -> Result<JudgeSummary, PropagateError> {
        self.select(graph)?;
        self.assign(graph)?;
        self.propagate_heavy(graph)?;
        self.insert_trans(graph)?;
        Ok(self.summary)
    }

    /// Binds every kernel node (trans nodes excluded) to the first candidate that accepts it.
    pub fn select(&mut self, graph: &mut Graph) -> Result<(), PropagateError> {
        self.require(graph, JudgeState::Unjudged)?;
        let mut unsupported = vec![];
        let mut observed: Vec<(NodeId, SlotDir, usize)> = vec![];

        for node in graph.nodes() {
            let op = &node.op;
            if !op.needs_kernel() || op.is_trans() || op.fused.is_some() {
                continue;
            }
            let policy = MatchPolicy::for_op(self.catalog, self.mode, &op.op_type);
            let mut attempts = vec![];
            let mut chosen = None;
            for candidate in self.catalog.candidates(&op.op_type) {
                match supported(node, candidate, &policy) {
                    Ok(outcome) => {
                        observed.extend(
                            outcome
                                .observed_relaxations
                                .iter()
                                .map(|(dir, i)| (node.id, *dir, *i)),
                        );
                        chosen = Some((candidate.name.clone(), outcome));
                        break;
                    }
                    Err(failure) => {
                        observed.extend(
                            failure
                                .observed_relaxations
                                .iter()
                                .map(|(dir, i)| (node.id, *dir, *i)),
                        );
                        attempts.push((candidate.name.clone(), failure));
                    }
                }
            }
            match chosen {
                Some(selection) => {
                    log::debug!("{} ({}) -> {}", node.name, op.op_type, selection.0);
                    self.selections.insert(node.id, selection);
                }
                None => unsupported.push(UnsupportedNode {
                    name: node.name.clone(),
                    op_type: op.op_type.clone(),
                    attempts,
                }),
            }
        }

        for (id, dir, index) in observed {
            let op = &mut graph.node_mut(id)?.op;
            let slots = match dir {
                SlotDir::Input => &mut op.inputs,
                SlotDir::Output => &mut op.outputs,
            };
            slots[index].desc.mark(TensorMark::RelaxationObserved);
        }
        if !unsupported.is_empty() {
            for u in &unsupported {
                log::warn!("Unsupported operator {u}");
            }
            return Err(PropagateError::Unsupported(unsupported));
        }
        self.advance(graph, JudgeState::CandidateSelected);
        Ok(())
    }

    /// Writes each selected column's dtypes and declared formats onto the node's tensors and
    /// records the kernel binding.
    pub fn assign(&mut self, graph: &mut Graph) -> Result<(), PropagateError> {
        self.require(graph, JudgeState::CandidateSelected)?;
        let mut relaxed = 0;
        for (&id, (name, outcome)) in &self.selections {
            let node = graph.node_mut(id)?;
            let Some(candidate) = self.catalog.candidate(&node.op.op_type, name) else {
                continue;
            };
            for b in &outcome.bindings {
                let d = decl(candidate, b);
                let slot = match b.dir {
                    SlotDir::Input => &mut node.op.inputs[b.slot],
                    SlotDir::Output => &mut node.op.outputs[b.slot],
                };
                if let Some(&dtype) = d.dtypes.get(outcome.column) {
                    slot.desc.set_dtype(dtype);
                }
                match d.format_at(outcome.column) {
                    Some(format) if format != Format::Nd => {
                        if !slot.desc.set_format(format) {
                            return Err(PropagateError::FormatConflict {
                                node: node.name.clone(),
                                slot: slot.name.clone(),
                                detail: format!(
                                    "{} cannot be laid out as {format}",
                                    slot.desc
                                ),
                            });
                        }
                    }
                    _ => {}
                }
            }
            relaxed += usize::from(outcome.relaxed);
            node.op.kernel = Some(KernelBinding {
                candidate: name.clone(),
                column: outcome.column,
                backend: candidate.backend,
                compiled: None,
            });
        }
        self.summary.judged = self.selections.len();
        self.summary.relaxed = relaxed;
        self.advance(graph, JudgeState::FormatDtypeAssigned);
        Ok(())
    }

    pub fn propagate_heavy(&mut self, graph: &mut Graph) -> Result<(), PropagateError> {
        self.require(graph, JudgeState::FormatDtypeAssigned)?;
        let relations = ReflectionRelations::build(graph, self.catalog);
        self.summary.heavy_propagated = propagate_heavy(graph, self.catalog, &relations)?;
        self.advance(graph, JudgeState::HeavyFormatPropagated);
        Ok(())
    }

    pub fn insert_trans(&mut self, graph: &mut Graph) -> Result<(), PropagateError> {
        self.require(graph, JudgeState::HeavyFormatPropagated)?;
        self.summary.trans_inserted = insert_trans_nodes(graph)?;
        self.advance(graph, JudgeState::TransNodesInserted);
        Ok(())
    }

    fn require(&self, graph: &Graph, expected: JudgeState) -> Result<(), PropagateError> {
        if self.state != expected {
            return Err(PropagateError::OutOfOrder {
                expected,
                found: self.state,
            });
        }
        if self.version.is_some_and(|v| v != graph.version()) {
            return Err(PropagateError::StaleGraph);
        }
        Ok(())
    }

    fn advance(&mut self, graph: &Graph, state: JudgeState) {
        self.state = state;
        self.version = Some(graph.version());
    }
}
