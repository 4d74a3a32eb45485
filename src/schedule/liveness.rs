use std::collections::{BTreeSet, HashMap};

use log::{debug, trace};

use super::buffer::{BufferArena, Lifetime, LogicalBufferId};
use crate::error::{Error, Result};
use crate::graph::build_order;
use crate::model::{Graph, NodeId, OpKind, OutputRef};

/// Liveness of a subgraph invoked through a call node
#[derive(Debug, Clone)]
pub struct CalleeLiveness {
    /// Call node of the caller that invokes the callee
    pub call_node: NodeId,
    /// Execution order of the callee's nodes
    pub order: Vec<NodeId>,
    pub record: LivenessRecord,
}

/// Result of one liveness pass over a subgraph
#[derive(Debug, Clone)]
pub struct LivenessRecord {
    pub arena: BufferArena,
    /// Age counter value when the pass started
    pub start_age: u64,
    /// Age counter value after the last node
    pub end_age: u64,
    pub callees: Vec<CalleeLiveness>,
}

/// Walks an execution order once, opening a logical buffer per produced
/// output and closing it after its last consumer.
pub struct LivenessRecorder<'a> {
    graph: &'a Graph,
    consumers: HashMap<OutputRef, Vec<NodeId>>,
    arena: BufferArena,
    start_age: u64,
    age_counter: u64,
    /// Buffers with pending consumers
    alive: BTreeSet<LogicalBufferId>,
    callees: Vec<CalleeLiveness>,
}

impl<'a> LivenessRecorder<'a> {
    /// Create a recorder whose age counter starts at `start_age`
    pub fn new(graph: &'a Graph, start_age: u64) -> Self {
        Self {
            graph,
            consumers: graph.consumers(),
            arena: BufferArena::new(),
            start_age,
            age_counter: start_age,
            alive: BTreeSet::new(),
            callees: Vec::new(),
        }
    }

    /// Record the lifetime of every output produced along `order`
    pub fn record(mut self, order: &[NodeId]) -> Result<LivenessRecord> {
        for &node_id in order {
            self.step(node_id)?;
        }

        if !self.alive.is_empty() {
            let pending: Vec<String> = self
                .alive
                .iter()
                .filter_map(|&id| self.arena.get(id).ok())
                .map(|buffer| format!("'{}' ({} pending)", buffer.name, buffer.lifetime.used_count))
                .collect();
            return Err(Error::InvalidGraph(format!(
                "Graph '{}' ends with unconsumed buffers: {}",
                self.graph.name,
                pending.join(", ")
            )));
        }

        debug!(
            "liveness of '{}': {} buffers over ages [{}, {})",
            self.graph.name,
            self.arena.len(),
            self.start_age,
            self.age_counter
        );
        Ok(LivenessRecord {
            arena: self.arena,
            start_age: self.start_age,
            end_age: self.age_counter,
            callees: self.callees,
        })
    }

    fn step(&mut self, node_id: NodeId) -> Result<()> {
        let node = self.graph.node(node_id)?;

        // A callee runs between the consumption of the call's inputs and the
        // production of its outputs, so it advances the caller's clock first
        if let OpKind::Call { callee } = &node.op {
            let order = build_order(callee)?;
            let record = LivenessRecorder::new(callee, self.age_counter).record(&order)?;
            let elapsed = record.end_age - self.age_counter;
            self.advance(elapsed)?;
            trace!("call '{}' spans {} steps of '{}'", node.name, elapsed, callee.name);
            self.callees.push(CalleeLiveness {
                call_node: node_id,
                order,
                record,
            });
        }

        let alignment = match node.op {
            OpKind::Constant { alignment } => alignment,
            _ => None,
        };
        for (index, info) in node.outputs.iter().enumerate() {
            let output = OutputRef::new(node_id, index);
            if self.arena.lookup(output).is_some() {
                continue;
            }
            let used_count = self.consumers.get(&output).map_or(0, Vec::len);
            let used_count = u32::try_from(used_count).map_err(|_| {
                Error::InvalidGraph(format!("Output '{}' has too many consumers", info.name))
            })?;
            let id = self
                .arena
                .insert(output, info, Lifetime::new(self.age_counter, used_count), alignment);
            trace!("birth of '{}' at {} with {} consumers", info.name, self.age_counter, used_count);
            if used_count > 0 {
                self.alive.insert(id);
            }
        }

        for &input in &node.inputs {
            let id = self.arena.lookup(input).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Node '{}' consumes {} before it is produced",
                    node.name, input
                ))
            })?;
            let buffer = self.arena.get_mut(id)?;
            if !buffer.lifetime.is_alive() {
                return Err(Error::InvariantViolation(format!(
                    "Used count of buffer '{}' underflows at node '{}'",
                    buffer.name, node.name
                )));
            }
            buffer.lifetime.used_count -= 1;
            if !buffer.lifetime.is_alive() {
                trace!("'{}' dies at {}", buffer.name, buffer.lifetime.end());
                self.alive.remove(&id);
            }
        }

        self.advance(1)
    }

    /// Move the age counter forward, ageing every live buffer
    fn advance(&mut self, steps: u64) -> Result<()> {
        self.age_counter += steps;
        for &id in &self.alive {
            self.arena.get_mut(id)?.lifetime.age += steps;
        }
        Ok(())
    }
}

/// Record the liveness of `graph` along `order`, starting at age zero
pub fn record_liveness(graph: &Graph, order: &[NodeId]) -> Result<LivenessRecord> {
    LivenessRecorder::new(graph, 0).record(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::DataType;

    fn lifetime_of(record: &LivenessRecord, name: &str) -> Lifetime {
        record
            .arena
            .iter()
            .find(|buffer| buffer.name == name)
            .map(|buffer| buffer.lifetime)
            .unwrap()
    }

    #[test]
    fn test_chain_lifetimes() {
        let mut builder = GraphBuilder::new("chain");
        let x = builder.input("x", DataType::Float32, vec![4]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![4]).unwrap();
        let b = builder.compute("b", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        builder.output("out", b).unwrap();
        let graph = builder.build();
        let order = build_order(&graph).unwrap();
        let record = record_liveness(&graph, &order).unwrap();

        let x = lifetime_of(&record, "x");
        assert_eq!((x.birth, x.end(), x.used_count), (0, 1, 0));
        let a = lifetime_of(&record, "a");
        assert_eq!((a.birth, a.end()), (1, 2));
        let b = lifetime_of(&record, "b");
        assert_eq!((b.birth, b.end()), (2, 3));
        assert_eq!(record.end_age, 4);
    }

    #[test]
    fn test_dead_output_has_zero_age() {
        let mut builder = GraphBuilder::new("dead");
        let x = builder.input("x", DataType::Float32, vec![4]);
        builder.compute("unused", "Relu", &[x], DataType::Float32, vec![4]).unwrap();
        let graph = builder.build();
        let record = record_liveness(&graph, &[0, 1]).unwrap();
        let unused = lifetime_of(&record, "unused");
        assert_eq!((unused.birth, unused.age), (1, 0));
    }

    #[test]
    fn test_multiple_consumer_edges() {
        let mut builder = GraphBuilder::new("fanout");
        let x = builder.input("x", DataType::Float32, vec![4]);
        let a = builder.compute("a", "Add", &[x, x], DataType::Float32, vec![4]).unwrap();
        let b = builder.compute("b", "Relu", &[x], DataType::Float32, vec![4]).unwrap();
        let c = builder.compute("c", "Add", &[a, b], DataType::Float32, vec![4]).unwrap();
        builder.output("out", c).unwrap();
        let graph = builder.build();
        let order = build_order(&graph).unwrap();
        let record = record_liveness(&graph, &order).unwrap();
        let x = lifetime_of(&record, "x");
        assert_eq!((x.birth, x.end()), (0, 2));
    }

    #[test]
    fn test_underflow_is_an_invariant_violation() {
        let mut builder = GraphBuilder::new("bad");
        let x = builder.input("x", DataType::Float32, vec![4]);
        builder.compute("a", "Relu", &[x], DataType::Float32, vec![4]).unwrap();
        let graph = builder.build();
        // Visiting the consumer twice consumes one edge too many
        let err = record_liveness(&graph, &[0, 1, 1]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_nested_call_keeps_one_age_space() {
        let mut callee = GraphBuilder::new("body");
        let p = callee.input("p", DataType::Float32, vec![4]);
        let q = callee.compute("q", "Relu", &[p], DataType::Float32, vec![4]).unwrap();
        let r = callee.compute("r", "Relu", &[q], DataType::Float32, vec![4]).unwrap();
        callee.output("ret", r).unwrap();
        let callee = callee.build();

        let mut builder = GraphBuilder::new("main");
        let x = builder.input("x", DataType::Float32, vec![4]);
        let keep = builder.compute("keep", "Relu", &[x], DataType::Float32, vec![4]).unwrap();
        let result = builder.call("call", callee, &[x]).unwrap();
        let sum = builder
            .compute("sum", "Add", &[keep, result[0]], DataType::Float32, vec![4])
            .unwrap();
        builder.output("out", sum).unwrap();
        let graph = builder.build();
        let order = build_order(&graph).unwrap();
        let record = record_liveness(&graph, &order).unwrap();

        let body = &record.callees[0].record;
        assert_eq!(body.start_age, 2);
        assert_eq!(body.end_age, 6);
        // The callee's first buffer is born where the caller left off
        assert_eq!(lifetime_of(body, "p").birth, 2);
        // The caller's live buffer ages through the callee's steps
        let keep = lifetime_of(&record, "keep");
        assert_eq!((keep.birth, keep.end()), (1, 7));
        let call_out = lifetime_of(&record, "call.r");
        assert_eq!(call_out.birth, 6);
        assert_eq!(record.end_age, 9);
    }
}
