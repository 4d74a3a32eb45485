use std::collections::{BTreeSet, HashMap};

use log::{debug, trace};
use serde::Serialize;
use strum_macros::Display;

use super::buffer::{BufferArena, LogicalBufferId, ViewDescriptor};
use crate::error::{Error, Result};
use crate::layout::TensorLayout;
use crate::memory::AllocatorRegistry;
use crate::model::{Graph, Node, NodeId, OpKind, OutputRef};

/// Why an alias candidate keeps its copying instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum DeclineReason {
    /// Input or Output buffers have a layout fixed by the caller
    CallerVisibleRegion,
    /// The region cannot host writable views
    UnsupportedRegion,
    /// Source and result live in different regions
    RegionMismatch,
    /// The region's size policy pads buffers, so offsets are not dense
    NonDenseRegion,
    /// An input has consumers besides the candidate
    SharedInput,
    /// An input is already a view of another buffer
    AlreadyAliased,
    /// The source is only addressable through a parent's strides
    NonContiguousSource,
    /// A stepped axis would need a stride the view cannot express
    NonUnitStride,
    /// A strided view would reach a node that only reads dense buffers
    StridedAccessUnsupported,
    /// Element types or byte sizes do not line up
    ShapeMismatch,
}

/// Outcome of analyzing one alias candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AliasDecision {
    /// `views` now address storage of another buffer
    Accepted { node: NodeId, views: Vec<LogicalBufferId> },
    Declined { node: NodeId, reason: DeclineReason },
}

impl AliasDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AliasDecision::Accepted { .. })
    }
}

/// Decisions of one analysis pass
#[derive(Debug, Clone, Default)]
pub struct AliasReport {
    pub decisions: Vec<AliasDecision>,
    /// Nodes whose data movement is fully replaced by views
    pub elided: BTreeSet<NodeId>,
}

type Verdict = std::result::Result<Vec<(LogicalBufferId, ViewDescriptor)>, DeclineReason>;

/// Turns reshape, bitcast, concat and slice nodes into views over existing storage.
///
/// Each candidate is checked in execution order. A candidate either has all of
/// its views applied at once or is left untouched.
pub struct AliasMotionAnalyzer<'a> {
    graph: &'a Graph,
    registry: &'a AllocatorRegistry,
    consumers: HashMap<OutputRef, Vec<NodeId>>,
}

impl<'a> AliasMotionAnalyzer<'a> {
    pub fn new(graph: &'a Graph, registry: &'a AllocatorRegistry) -> Self {
        Self {
            graph,
            registry,
            consumers: graph.consumers(),
        }
    }

    /// Analyze every candidate along `order`, rewriting `arena` in place
    pub fn run(&self, arena: &mut BufferArena, order: &[NodeId]) -> Result<AliasReport> {
        let mut report = AliasReport::default();

        for &node_id in order {
            let node = self.graph.node(node_id)?;
            let verdict = match &node.op {
                OpKind::Bitcast | OpKind::Reshape => self.analyze_reinterpret(node, arena)?,
                OpKind::Concat { axis } => self.analyze_concat(node, *axis, arena)?,
                OpKind::Slice { begins, steps, .. } => self.analyze_slice(node, begins, steps, arena)?,
                _ => continue,
            };

            match verdict {
                Ok(views) => {
                    let mut ids = Vec::with_capacity(views.len());
                    for (id, view) in views {
                        let buffer = arena.get_mut(id)?;
                        trace!(
                            "'{}' becomes a view of buffer {} at +{}{}",
                            buffer.name,
                            view.parent,
                            view.byte_offset,
                            if view.strided { " (strided)" } else { "" }
                        );
                        if !view.strided {
                            buffer.strides_shape = view.shape.clone();
                        }
                        buffer.view = Some(view);
                        ids.push(id);
                    }
                    report.elided.insert(node_id);
                    report.decisions.push(AliasDecision::Accepted { node: node_id, views: ids });
                }
                Err(reason) => {
                    trace!("keeping copy for '{}': {}", node.name, reason);
                    report.decisions.push(AliasDecision::Declined { node: node_id, reason });
                }
            }
        }

        debug!(
            "alias motion on '{}': {} of {} candidates became views",
            self.graph.name,
            report.decisions.iter().filter(|decision| decision.is_accepted()).count(),
            report.decisions.len()
        );
        Ok(report)
    }

    fn buffer_of(&self, arena: &BufferArena, output: OutputRef) -> Result<LogicalBufferId> {
        arena.lookup(output).ok_or_else(|| {
            Error::InvariantViolation(format!("No buffer was recorded for {} in '{}'", output, self.graph.name))
        })
    }

    fn single_io(&self, node: &Node, arena: &BufferArena) -> Result<(LogicalBufferId, LogicalBufferId)> {
        match (node.inputs.as_slice(), node.outputs.len()) {
            ([input], 1) => Ok((self.buffer_of(arena, *input)?, self.buffer_of(arena, OutputRef::new(node.id, 0))?)),
            _ => Err(Error::InvalidGraph(format!(
                "Node '{}' must have exactly one input and one output",
                node.name
            ))),
        }
    }

    /// Bitcast and reshape: the result aliases the whole source at offset 0
    fn analyze_reinterpret(&self, node: &Node, arena: &BufferArena) -> Result<Verdict> {
        let (source_id, result_id) = self.single_io(node, arena)?;
        let source = arena.get(source_id)?;
        let result = arena.get(result_id)?;

        if source.region.is_caller_visible() || result.region.is_caller_visible() {
            return Ok(Err(DeclineReason::CallerVisibleRegion));
        }
        if source.region != result.region {
            return Ok(Err(DeclineReason::RegionMismatch));
        }
        if !self.registry.is_dense(result.region) {
            return Ok(Err(DeclineReason::NonDenseRegion));
        }
        if source.dense_size_in_bytes() != result.dense_size_in_bytes() {
            return Ok(Err(DeclineReason::ShapeMismatch));
        }
        if source.is_strided_view() {
            return Ok(Err(DeclineReason::NonContiguousSource));
        }

        Ok(Ok(vec![(
            result_id,
            ViewDescriptor {
                parent: source_id,
                byte_offset: 0,
                shape: result.shape.clone(),
                strided: false,
                inner_step: 1,
            },
        )]))
    }

    /// Concat: every input is placed inside the result at its running axis offset
    fn analyze_concat(&self, node: &Node, axis: usize, arena: &BufferArena) -> Result<Verdict> {
        if node.outputs.len() != 1 || node.inputs.is_empty() {
            return Err(Error::InvalidGraph(format!(
                "Concat '{}' must have inputs and exactly one output",
                node.name
            )));
        }
        let result_id = self.buffer_of(arena, OutputRef::new(node.id, 0))?;
        let result = arena.get(result_id)?;
        if axis >= result.shape.len() {
            return Err(Error::InvalidGraph(format!(
                "Concat '{}' axis {} is out of bounds for rank {}",
                node.name,
                axis,
                result.shape.len()
            )));
        }

        if result.region.is_caller_visible() {
            return Ok(Err(DeclineReason::CallerVisibleRegion));
        }
        if !result.region.is_writable_alias_target() {
            return Ok(Err(DeclineReason::UnsupportedRegion));
        }
        if !self.registry.is_dense(result.region) {
            return Ok(Err(DeclineReason::NonDenseRegion));
        }

        // Row-major data is contiguous per input only when nothing precedes the axis
        let contiguous = result.shape[..axis].iter().product::<usize>() == 1;
        let axis_stride = TensorLayout::compute_contiguous_strides(&result.shape)[axis];
        let element_size = result.data_type.size_in_bytes();

        let mut seen = BTreeSet::new();
        let mut views = Vec::with_capacity(node.inputs.len());
        let mut running = 0;
        for &input in &node.inputs {
            let input_id = self.buffer_of(arena, input)?;
            let buffer = arena.get(input_id)?;

            if !seen.insert(input_id) {
                return Ok(Err(DeclineReason::SharedInput));
            }
            if buffer.region != result.region {
                return Ok(Err(if buffer.region.is_caller_visible() {
                    DeclineReason::CallerVisibleRegion
                } else {
                    DeclineReason::RegionMismatch
                }));
            }
            if buffer.data_type != result.data_type || buffer.shape.len() != result.shape.len() {
                return Ok(Err(DeclineReason::ShapeMismatch));
            }
            if self.consumers.get(&input).map_or(0, Vec::len) != 1 {
                return Ok(Err(DeclineReason::SharedInput));
            }
            if buffer.view.is_some() {
                return Ok(Err(DeclineReason::AlreadyAliased));
            }
            if !contiguous {
                if !self.graph.node(input.node)?.strided_io {
                    return Ok(Err(DeclineReason::StridedAccessUnsupported));
                }
                if arena.has_views_into(input_id) {
                    return Ok(Err(DeclineReason::NonContiguousSource));
                }
            }

            views.push((
                input_id,
                ViewDescriptor {
                    parent: result_id,
                    byte_offset: running * axis_stride * element_size,
                    shape: buffer.shape.clone(),
                    strided: !contiguous,
                    inner_step: 1,
                },
            ));
            running += buffer.shape[axis];
        }

        if running != result.shape[axis] {
            return Ok(Err(DeclineReason::ShapeMismatch));
        }
        Ok(Ok(views))
    }

    /// Slice: the result addresses a window of the source
    fn analyze_slice(&self, node: &Node, begins: &[usize], steps: &[usize], arena: &BufferArena) -> Result<Verdict> {
        let (source_id, result_id) = self.single_io(node, arena)?;
        let source = arena.get(source_id)?;
        let result = arena.get(result_id)?;
        let rank = source.shape.len();
        if begins.len() != rank || steps.len() != rank || result.shape.len() != rank {
            return Err(Error::InvalidGraph(format!(
                "Slice '{}' parameters do not match input rank {}",
                node.name, rank
            )));
        }

        if source.region.is_caller_visible() || result.region.is_caller_visible() {
            return Ok(Err(DeclineReason::CallerVisibleRegion));
        }
        if source.region != result.region {
            return Ok(Err(DeclineReason::RegionMismatch));
        }
        if !self.registry.is_dense(result.region) {
            return Ok(Err(DeclineReason::NonDenseRegion));
        }
        if source.data_type != result.data_type {
            return Ok(Err(DeclineReason::ShapeMismatch));
        }
        if source.is_strided_view() {
            return Ok(Err(DeclineReason::NonContiguousSource));
        }
        // A step only matters on axes that keep more than one element, and
        // only the innermost axis can express one through its stride
        let innermost = rank.saturating_sub(1);
        let stepped = |axis: usize| steps[axis] != 1 && result.shape[axis] > 1;
        if (0..innermost).any(stepped) {
            return Ok(Err(DeclineReason::NonUnitStride));
        }
        let inner_step = if rank > 0 && stepped(innermost) { steps[innermost] } else { 1 };

        let strides = TensorLayout::compute_contiguous_strides(&source.shape);
        let element_size = source.data_type.size_in_bytes();
        let byte_offset = begins.iter().zip(&strides).map(|(begin, stride)| begin * stride).sum::<usize>() * element_size;

        let contiguous = inner_step == 1 && TensorLayout::is_contiguous_block(&source.shape, begins, &result.shape);
        if !contiguous {
            let output = OutputRef::new(node.id, 0);
            let readers = self.consumers.get(&output).map(Vec::as_slice).unwrap_or_default();
            for &reader in readers {
                if !self.graph.node(reader)?.strided_io {
                    return Ok(Err(DeclineReason::StridedAccessUnsupported));
                }
            }
        }

        Ok(Ok(vec![(
            result_id,
            ViewDescriptor {
                parent: source_id,
                byte_offset,
                shape: result.shape.clone(),
                strided: !contiguous,
                inner_step,
            },
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_order, GraphBuilder};
    use crate::model::{DataType, MemoryRegion};
    use crate::schedule::liveness::record_liveness;

    fn analyze(graph: &Graph) -> (BufferArena, AliasReport) {
        let registry = AllocatorRegistry::new();
        let order = build_order(graph).unwrap();
        let mut arena = record_liveness(graph, &order).unwrap().arena;
        let report = AliasMotionAnalyzer::new(graph, &registry).run(&mut arena, &order).unwrap();
        (arena, report)
    }

    fn view_of(arena: &BufferArena, output: OutputRef) -> Option<ViewDescriptor> {
        arena.get(arena.lookup(output).unwrap()).unwrap().view.clone()
    }

    #[test]
    fn test_reshape_becomes_view() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![4, 4]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![4, 4]).unwrap();
        let r = builder.reshape("r", a, vec![16]).unwrap();
        let b = builder.compute("b", "Relu", &[r], DataType::Float32, vec![16]).unwrap();
        builder.output("out", b).unwrap();
        let graph = builder.build();
        let (arena, report) = analyze(&graph);

        let view = view_of(&arena, r).unwrap();
        assert_eq!(view.parent, arena.lookup(a).unwrap());
        assert_eq!(view.byte_offset, 0);
        assert!(report.elided.contains(&r.node));
    }

    #[test]
    fn test_reshape_of_output_is_declined() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![4, 4]);
        let r = builder.reshape("r", x, vec![16]).unwrap();
        builder.set_region(r, MemoryRegion::Output).unwrap();
        builder.output("out", r).unwrap();
        let graph = builder.build();
        let (arena, report) = analyze(&graph);

        assert!(view_of(&arena, r).is_none());
        assert_eq!(
            report.decisions,
            vec![AliasDecision::Declined {
                node: r.node,
                reason: DeclineReason::CallerVisibleRegion
            }]
        );
    }

    #[test]
    fn test_concat_axis_zero_offsets() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![4, 8]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let b = builder.compute("b", "Neg", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let c = builder.concat("c", &[a, b], 0).unwrap();
        let d = builder.compute("d", "Relu", &[c], DataType::Float32, vec![8, 8]).unwrap();
        builder.output("out", d).unwrap();
        let graph = builder.build();
        let (arena, _) = analyze(&graph);

        let c_id = arena.lookup(c).unwrap();
        let a_view = view_of(&arena, a).unwrap();
        let b_view = view_of(&arena, b).unwrap();
        assert_eq!((a_view.parent, a_view.byte_offset, a_view.strided), (c_id, 0, false));
        assert_eq!((b_view.parent, b_view.byte_offset, b_view.strided), (c_id, 4 * 8 * 4, false));
    }

    #[test]
    fn test_concat_inner_axis_needs_strided_producers() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![4, 8]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let b = builder.compute("b", "Neg", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let c = builder.concat("c", &[a, b], 1).unwrap();
        builder.output("out", c).unwrap();
        let mut declined = builder.build();
        // The concat result is caller visible, move it back to scratch
        let c_node = c.node;
        declined.nodes[c_node].outputs[0].region = MemoryRegion::ScratchData;
        let mut accepted = declined.clone();

        let (_, report) = analyze(&declined);
        assert_eq!(
            report.decisions,
            vec![AliasDecision::Declined {
                node: c_node,
                reason: DeclineReason::StridedAccessUnsupported
            }]
        );

        accepted.nodes[a.node].strided_io = true;
        accepted.nodes[b.node].strided_io = true;
        let (arena, _) = analyze(&accepted);
        let b_view = view_of(&arena, b).unwrap();
        assert!(b_view.strided);
        assert_eq!(b_view.byte_offset, 8 * 4);
        assert_eq!(arena.effective_strides_shape(arena.lookup(b).unwrap()).unwrap(), vec![4, 16]);
    }

    #[test]
    fn test_concat_with_shared_input_is_declined() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![4, 8]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let b = builder.compute("b", "Neg", &[x], DataType::Float32, vec![4, 8]).unwrap();
        let c = builder.concat("c", &[a, b], 0).unwrap();
        let d = builder.compute("d", "Add", &[c, a], DataType::Float32, vec![8, 8]).unwrap();
        builder.output("out", d).unwrap();
        let graph = builder.build();
        let (arena, report) = analyze(&graph);

        assert!(view_of(&arena, a).is_none());
        assert!(view_of(&arena, b).is_none());
        assert_eq!(
            report.decisions,
            vec![AliasDecision::Declined {
                node: c.node,
                reason: DeclineReason::SharedInput
            }]
        );
    }

    #[test]
    fn test_slice_offsets_and_contiguity() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![8, 8]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![8, 8]).unwrap();
        let rows = builder.slice("rows", a, vec![2, 0], vec![4, 8], vec![1, 1]).unwrap();
        let r = builder.compute("r", "Relu", &[rows], DataType::Float32, vec![2, 8]).unwrap();
        let cols = builder.slice("cols", a, vec![0, 2], vec![8, 4], vec![1, 1]).unwrap();
        let c = builder.compute("c", "Relu", &[cols], DataType::Float32, vec![8, 2]).unwrap();
        builder.output("out_r", r).unwrap();
        builder.output("out_c", c).unwrap();
        let graph = builder.build();
        let (arena, report) = analyze(&graph);

        let rows_view = view_of(&arena, rows).unwrap();
        assert_eq!((rows_view.byte_offset, rows_view.strided), (2 * 8 * 4, false));
        // The column window is strided and its reader only takes dense buffers
        assert!(view_of(&arena, cols).is_none());
        assert!(report.decisions.contains(&AliasDecision::Declined {
            node: cols.node,
            reason: DeclineReason::StridedAccessUnsupported
        }));
    }

    #[test]
    fn test_slice_with_step_is_declined() {
        let mut builder = GraphBuilder::new("g");
        let x = builder.input("x", DataType::Float32, vec![8, 8]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![8, 8]).unwrap();
        let s = builder.slice("s", a, vec![0, 0], vec![8, 8], vec![2, 1]).unwrap();
        builder.output("out", s).unwrap();
        let mut graph = builder.build();
        graph.nodes[s.node].outputs[0].region = MemoryRegion::ScratchData;
        let (_, report) = analyze(&graph);
        assert_eq!(
            report.decisions,
            vec![AliasDecision::Declined {
                node: s.node,
                reason: DeclineReason::NonUnitStride
            }]
        );
    }

    #[test]
    fn test_slice_with_innermost_step_needs_strided_readers() {
        let build = |strided_reader: bool| {
            let mut builder = GraphBuilder::new("g");
            let x = builder.input("x", DataType::Float32, vec![8, 8]);
            let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![8, 8]).unwrap();
            let s = builder.slice("s", a, vec![2, 0], vec![3, 8], vec![1, 2]).unwrap();
            let c = builder.compute("c", "Relu", &[s], DataType::Float32, vec![1, 4]).unwrap();
            builder.set_strided_io(c, strided_reader).unwrap();
            builder.output("out", c).unwrap();
            (builder.build(), a, s)
        };

        let (graph, a, s) = build(true);
        let (arena, report) = analyze(&graph);
        let view = view_of(&arena, s).unwrap();
        assert_eq!(view.parent, arena.lookup(a).unwrap());
        assert_eq!((view.byte_offset, view.strided, view.inner_step), (2 * 8 * 4, true, 2));
        assert!(report.decisions.iter().all(AliasDecision::is_accepted));

        let (graph, _, s) = build(false);
        let (arena, report) = analyze(&graph);
        assert!(view_of(&arena, s).is_none());
        assert_eq!(
            report.decisions,
            vec![AliasDecision::Declined {
                node: s.node,
                reason: DeclineReason::StridedAccessUnsupported
            }]
        );
    }
}
