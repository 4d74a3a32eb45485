use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use serde::Serialize;
use strum_macros::Display;

use super::alias::{AliasDecision, AliasMotionAnalyzer, AliasReport};
use super::buffer::{BufferArena, Lifetime, LogicalBuffer, LogicalBufferId, PhysicalBuffer, PhysicalBufferId};
use super::liveness::{LivenessRecord, LivenessRecorder};
use super::options::ScheduleOptions;
use super::union_find::UnionFind;
use crate::error::{Error, Result};
use crate::graph::build_order;
use crate::layout::TensorLayout;
use crate::memory::{AllocationSession, AllocatorRegistry, BufferAllocator, MemorySpan};
use crate::model::{DataType, Graph, MemoryRegion, NodeId, OpKind, OutputRef};

/// Steps of a subgraph scheduling run, in the only order they may happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
pub enum ScheduleStage {
    Idle,
    BuildOrder,
    RecordLiveness,
    AnalyzeAlias,
    FixLifetimes,
    FormPhysicalBuffers,
    Allocate,
    Assign,
    Done,
}

/// Enforces forward-only stage transitions for one subgraph
struct StageTracker {
    graph: String,
    stage: ScheduleStage,
}

impl StageTracker {
    fn new(graph: &str) -> Self {
        Self {
            graph: graph.to_string(),
            stage: ScheduleStage::Idle,
        }
    }

    fn enter(&mut self, next: ScheduleStage) -> Result<()> {
        if next <= self.stage {
            return Err(Error::InvariantViolation(format!(
                "Scheduling of '{}' cannot move from {} back to {}",
                self.graph, self.stage, next
            )));
        }
        debug!("'{}': {} -> {}", self.graph, self.stage, next);
        self.stage = next;
        Ok(())
    }
}

/// Final placement of one tensor-producing output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferAssignment {
    pub output: OutputRef,
    pub name: String,
    pub logical: LogicalBufferId,
    pub physical: PhysicalBufferId,
    pub region: MemoryRegion,
    /// Byte offset inside the region
    pub start: usize,
    pub size_bytes: usize,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    /// Element strides, which differ from the dense ones for strided views
    pub strides: Vec<usize>,
    /// Parent buffer when the output is a view
    pub view_of: Option<LogicalBufferId>,
}

impl BufferAssignment {
    pub fn span(&self) -> MemorySpan {
        MemorySpan::new(self.start, self.size_bytes)
    }
}

/// One entry of the finalized instruction stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledInstruction {
    pub node: NodeId,
    pub name: String,
    pub op: String,
    /// The node moves no data because its outputs became views
    pub elided: bool,
    pub inputs: Vec<OutputRef>,
    pub outputs: Vec<OutputRef>,
}

/// Schedule of a call node's body
#[derive(Debug, Clone, Serialize)]
pub struct CalleeSchedule {
    pub call_node: NodeId,
    pub schedule: SubgraphSchedule,
}

/// Everything decided for one subgraph
#[derive(Debug, Clone, Serialize)]
pub struct SubgraphSchedule {
    pub name: String,
    pub start_age: u64,
    pub end_age: u64,
    pub order: Vec<NodeId>,
    pub instructions: Vec<ScheduledInstruction>,
    pub logical_buffers: Vec<LogicalBuffer>,
    pub physical_buffers: Vec<PhysicalBuffer>,
    pub assignments: Vec<BufferAssignment>,
    pub alias_decisions: Vec<AliasDecision>,
    /// High-water mark of every region after this subgraph
    pub peak_usage: BTreeMap<MemoryRegion, usize>,
    pub callees: Vec<CalleeSchedule>,
}

impl SubgraphSchedule {
    /// Placement of `output`
    pub fn assignment(&self, output: OutputRef) -> Option<&BufferAssignment> {
        self.assignments.iter().find(|assignment| assignment.output == output)
    }

    /// Placement of the output called `name`
    pub fn assignment_by_name(&self, name: &str) -> Option<&BufferAssignment> {
        self.assignments.iter().find(|assignment| assignment.name == name)
    }

    /// Region peaks across this subgraph and every nested callee
    pub fn total_peak_usage(&self) -> BTreeMap<MemoryRegion, usize> {
        let mut peaks = self.peak_usage.clone();
        for callee in &self.callees {
            for (region, usage) in callee.schedule.total_peak_usage() {
                let peak = peaks.entry(region).or_insert(0);
                *peak = (*peak).max(usage);
            }
        }
        peaks
    }

    /// Check that live buffers of this subgraph never share memory
    pub fn verify(&self) -> Result<()> {
        verify_no_overlap(&self.physical_buffers)?;
        for callee in &self.callees {
            callee.schedule.verify()?;
        }
        Ok(())
    }
}

/// Drives the scheduling stages of a subgraph against one allocator registry
pub struct BufferScheduler<'r> {
    registry: &'r mut AllocatorRegistry,
    options: ScheduleOptions,
}

impl<'r> BufferScheduler<'r> {
    pub fn new(registry: &'r mut AllocatorRegistry, options: ScheduleOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &ScheduleOptions {
        &self.options
    }

    /// Schedule `graph` and every callee it invokes.
    ///
    /// On failure the shared regions of the registry are left exactly as they were.
    pub fn schedule(&mut self, graph: &Graph) -> Result<SubgraphSchedule> {
        let snapshot = self.registry.snapshot();
        let result = self.schedule_graph(graph);
        if let Err(err) = &result {
            debug!("scheduling of '{}' failed, rolling back shared regions: {}", graph.name, err);
            self.registry.restore(snapshot);
        }
        result
    }

    fn schedule_graph(&mut self, graph: &Graph) -> Result<SubgraphSchedule> {
        let mut stages = StageTracker::new(&graph.name);

        stages.enter(ScheduleStage::BuildOrder)?;
        let order = build_order(graph)?;

        stages.enter(ScheduleStage::RecordLiveness)?;
        let record = LivenessRecorder::new(graph, 0).record(&order)?;

        self.schedule_recorded(graph, order, record, &BTreeMap::new(), stages)
    }

    fn schedule_recorded(
        &mut self,
        graph: &Graph,
        order: Vec<NodeId>,
        record: LivenessRecord,
        bias: &BTreeMap<MemoryRegion, usize>,
        mut stages: StageTracker,
    ) -> Result<SubgraphSchedule> {
        let LivenessRecord {
            mut arena,
            start_age,
            end_age,
            callees,
        } = record;

        let alias = if self.options.enable_alias_motion {
            stages.enter(ScheduleStage::AnalyzeAlias)?;
            AliasMotionAnalyzer::new(graph, &*self.registry).run(&mut arena, &order)?
        } else {
            AliasReport::default()
        };

        stages.enter(ScheduleStage::FixLifetimes)?;
        let widened = fix_lifetimes(&mut arena)?;
        debug!("'{}': widened {} root lifetimes", graph.name, widened);

        stages.enter(ScheduleStage::FormPhysicalBuffers)?;
        let mut physical = form_physical_buffers(&mut arena, &*self.registry)?;
        debug!(
            "'{}': {} logical buffers in {} physical buffers",
            graph.name,
            arena.len(),
            physical.len()
        );

        stages.enter(ScheduleStage::Allocate)?;
        let mut session = self.registry.open_session(bias);
        allocate(&mut physical, &arena, &mut session)?;
        let peak_usage = session.finish();
        if self.options.verify_allocations {
            verify_no_overlap(&physical)?;
        }

        stages.enter(ScheduleStage::Assign)?;
        let assignments = assign(&arena, &physical)?;
        let instructions = build_instructions(graph, &order, &alias.elided)?;
        self.registry.commit(session);
        stages.enter(ScheduleStage::Done)?;

        let mut schedule = SubgraphSchedule {
            name: graph.name.clone(),
            start_age,
            end_age,
            order,
            instructions,
            logical_buffers: arena.into_buffers(),
            physical_buffers: physical,
            assignments,
            alias_decisions: alias.decisions,
            peak_usage,
            callees: Vec::new(),
        };

        if self.options.schedule_callees {
            // Callee bodies sit above everything the caller uses in private regions
            let callee_bias: BTreeMap<MemoryRegion, usize> = schedule
                .peak_usage
                .iter()
                .filter(|(region, _)| !self.registry.is_shared(**region))
                .map(|(&region, &usage)| (region, usage))
                .collect();

            for callee in callees {
                let node = graph.node(callee.call_node)?;
                let body = match &node.op {
                    OpKind::Call { callee: body } => body,
                    _ => {
                        return Err(Error::InvariantViolation(format!(
                            "Node '{}' recorded a callee but is not a call",
                            node.name
                        )))
                    }
                };
                let mut callee_stages = StageTracker::new(&body.name);
                callee_stages.enter(ScheduleStage::BuildOrder)?;
                callee_stages.enter(ScheduleStage::RecordLiveness)?;
                let callee_schedule =
                    self.schedule_recorded(body, callee.order, callee.record, &callee_bias, callee_stages)?;
                schedule.callees.push(CalleeSchedule {
                    call_node: callee.call_node,
                    schedule: callee_schedule,
                });
            }
        }

        Ok(schedule)
    }
}

/// Widen every view's root so it stays live for as long as the view is used.
///
/// Returns the number of roots whose interval changed.
pub fn fix_lifetimes(arena: &mut BufferArena) -> Result<usize> {
    let views: Vec<_> = arena
        .iter()
        .filter(|buffer| buffer.view.is_some())
        .map(|buffer| (buffer.id, buffer.lifetime))
        .collect();

    let mut widened = 0;
    for (id, lifetime) in views {
        let (root, _) = arena.resolve_root(id)?;
        let root = arena.get_mut(root)?;
        let before = root.lifetime;
        root.lifetime.widen(&lifetime);
        if root.lifetime != before {
            trace!(
                "'{}' widened to [{}, {}]",
                root.name,
                root.lifetime.birth,
                root.lifetime.end()
            );
            widened += 1;
        }
    }
    Ok(widened)
}

/// Group logical buffers by view chain into physical buffers
pub fn form_physical_buffers(arena: &mut BufferArena, registry: &AllocatorRegistry) -> Result<Vec<PhysicalBuffer>> {
    let mut sets = UnionFind::new(arena.len());
    for buffer in arena.iter() {
        if let Some(view) = &buffer.view {
            if view.parent >= arena.len() {
                return Err(Error::InvariantViolation(format!(
                    "View '{}' points at missing parent buffer {}",
                    buffer.name, view.parent
                )));
            }
            sets.union(buffer.id, view.parent);
        }
    }

    let mut physical = Vec::new();
    for members in sets.groups() {
        let id = physical.len();
        let mut roots = Vec::new();
        let mut region = None;
        let mut lifetime: Option<Lifetime> = None;
        let mut requested_alignment = 0;

        for &member in &members {
            let buffer = arena.get(member)?;
            if buffer.view.is_none() {
                roots.push(member);
            }
            match region {
                None => region = Some(buffer.region),
                Some(existing) if existing != buffer.region => {
                    return Err(Error::InvariantViolation(format!(
                        "Buffer '{}' in {} shares storage with buffers in {}",
                        buffer.name, buffer.region, existing
                    )));
                }
                Some(_) => {}
            }
            lifetime = Some(match lifetime {
                None => buffer.lifetime,
                Some(mut union) => {
                    union.widen(&buffer.lifetime);
                    union
                }
            });
            requested_alignment = requested_alignment.max(buffer.alignment.unwrap_or(0));
        }

        let root = match roots.as_slice() {
            [root] => *root,
            _ => {
                let names: Vec<&str> = members
                    .iter()
                    .filter_map(|&member| arena.get(member).ok())
                    .map(|buffer| buffer.name.as_str())
                    .collect();
                return Err(Error::InvariantViolation(format!(
                    "Buffers {:?} resolve to {} roots instead of one",
                    names,
                    roots.len()
                )));
            }
        };
        let (region, lifetime) = match (region, lifetime) {
            (Some(region), Some(lifetime)) => (region, lifetime),
            _ => return Err(Error::InvariantViolation(format!("Physical buffer {} has no members", id))),
        };

        let root_buffer = arena.get(root)?;
        let size_bytes = registry.size_in_bytes(region, root_buffer.data_type, &root_buffer.shape)?;
        let alignment = registry.alignment_for(region).max(requested_alignment);
        for &member in &members {
            arena.get_mut(member)?.physical = Some(id);
        }
        physical.push(PhysicalBuffer {
            id,
            root,
            members,
            region,
            alignment,
            size_bytes,
            lifetime,
            allocation: None,
        });
    }
    Ok(physical)
}

/// Place physical buffers in birth order, releasing dead ones before each placement
pub fn allocate(physical: &mut [PhysicalBuffer], arena: &BufferArena, session: &mut AllocationSession) -> Result<()> {
    let mut order: Vec<PhysicalBufferId> = (0..physical.len()).collect();
    order.sort_by_key(|&id| (physical[id].lifetime.birth, physical[id].id));

    // (end, id) of every placed buffer that is still live
    let mut live: Vec<(u64, PhysicalBufferId)> = Vec::new();
    for id in order {
        let birth = physical[id].lifetime.birth;

        let mut expired = Vec::new();
        live.retain(|&(end, other)| {
            if end < birth {
                expired.push((end, other));
                false
            } else {
                true
            }
        });
        expired.sort_unstable();
        for (_, other) in expired {
            let buffer = &physical[other];
            let span = buffer.span()?;
            session.allocator(buffer.region)?.release(span)?;
            trace!("release {} in {} before step {}", span, buffer.region, birth);
        }

        let buffer = &mut physical[id];
        let root_name = &arena.get(buffer.root)?.name;
        let span = session
            .allocator(buffer.region)?
            .mark(buffer.size_bytes, buffer.alignment)
            .map_err(|err| {
                debug!("cannot place '{}' ({} bytes): {}", root_name, buffer.size_bytes, err);
                err
            })?;
        trace!("place '{}' at {} in {}", root_name, span, buffer.region);
        buffer.allocation = Some(span);
        live.push((buffer.lifetime.end(), buffer.id));
    }
    Ok(())
}

/// Check that physical buffers live at the same time never share bytes of a region
pub fn verify_no_overlap(physical: &[PhysicalBuffer]) -> Result<()> {
    for (index, first) in physical.iter().enumerate() {
        let first_placement = first.placement()?;
        for second in &physical[index + 1..] {
            if !first.lifetime.overlaps(&second.lifetime) {
                continue;
            }
            let second_placement = second.placement()?;
            if first_placement.overlaps(&second_placement) {
                return Err(Error::InvariantViolation(format!(
                    "Physical buffers {} {} and {} {} overlap in {} while both are live",
                    first.id, first_placement.span, second.id, second_placement.span, first.region
                )));
            }
        }
    }
    Ok(())
}

/// Resolve the final offset, size and strides of every logical buffer
pub fn assign(arena: &BufferArena, physical: &[PhysicalBuffer]) -> Result<Vec<BufferAssignment>> {
    let mut assignments = Vec::with_capacity(arena.len());
    for buffer in arena.iter() {
        let (root, offset) = arena.resolve_root(buffer.id)?;
        let physical_id = buffer.physical.ok_or_else(|| {
            Error::InvariantViolation(format!("Buffer '{}' was never grouped into a physical buffer", buffer.name))
        })?;
        let owner = physical.get(physical_id).ok_or_else(|| {
            Error::InvariantViolation(format!("Physical buffer {} does not exist", physical_id))
        })?;
        if owner.root != root {
            return Err(Error::InvariantViolation(format!(
                "Buffer '{}' resolves to root {} but is stored in physical buffer {} rooted at {}",
                buffer.name, root, physical_id, owner.root
            )));
        }
        let span = owner.span()?;

        let (strides, size_bytes) = match &buffer.view {
            None => (TensorLayout::compute_contiguous_strides(&buffer.shape), owner.size_bytes),
            Some(view) => {
                let strides_shape = arena.effective_strides_shape(buffer.id)?;
                let layout =
                    TensorLayout::strided_layout(&buffer.shape, &strides_shape, 0)?.with_inner_step(view.inner_step);
                if !view.strided && !layout.is_contiguous() {
                    return Err(Error::InvariantViolation(format!(
                        "Dense view '{}' resolved to strides {:?}",
                        buffer.name,
                        layout.strides()
                    )));
                }
                let size = layout.size_in_bytes(buffer.data_type.size_in_bytes());
                (layout.strides().to_vec(), size)
            }
        };
        if offset + size_bytes > owner.size_bytes {
            return Err(Error::InvariantViolation(format!(
                "View '{}' at +{} spans {} bytes past its root of {} bytes",
                buffer.name, offset, size_bytes, owner.size_bytes
            )));
        }

        assignments.push(BufferAssignment {
            output: buffer.owner,
            name: buffer.name.clone(),
            logical: buffer.id,
            physical: physical_id,
            region: owner.region,
            start: span.start + offset,
            size_bytes,
            data_type: buffer.data_type,
            shape: buffer.shape.clone(),
            strides,
            view_of: buffer.view.as_ref().map(|view| view.parent),
        });
    }
    Ok(assignments)
}

fn build_instructions(graph: &Graph, order: &[NodeId], elided: &BTreeSet<NodeId>) -> Result<Vec<ScheduledInstruction>> {
    let mut instructions = Vec::new();
    for &node_id in order {
        let node = graph.node(node_id)?;
        if !node.is_action() {
            continue;
        }
        instructions.push(ScheduledInstruction {
            node: node_id,
            name: node.name.clone(),
            op: node.op.mnemonic().to_string(),
            elided: elided.contains(&node_id),
            inputs: node.inputs.clone(),
            outputs: (0..node.outputs.len()).map(|index| OutputRef::new(node_id, index)).collect(),
        });
    }
    Ok(instructions)
}
