use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::trace;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::model::{Graph, NodeId};

/// Build the dependency graph of `graph`: one edge per consumed output, producer to consumer
pub fn dependency_graph(graph: &Graph) -> Result<DiGraph<NodeId, usize>> {
    let mut deps = DiGraph::with_capacity(graph.nodes.len(), graph.nodes.len());
    for node in &graph.nodes {
        deps.add_node(node.id);
    }

    for (position, node) in graph.nodes.iter().enumerate() {
        if node.id != position {
            return Err(Error::InvalidGraph(format!(
                "Node '{}' has ID {} but is stored at position {}",
                node.name, node.id, position
            )));
        }
        for (slot, &input) in node.inputs.iter().enumerate() {
            graph.output_info(input).map_err(|_| {
                Error::InvalidGraph(format!(
                    "Input {} of node '{}' references missing output {}",
                    slot, node.name, input
                ))
            })?;
            deps.add_edge(NodeIndex::new(input.node), NodeIndex::new(node.id), slot);
        }
    }

    Ok(deps)
}

/// Linearize the nodes of `graph` into an instruction order honoring every data dependency.
///
/// The stored node order is kept when it is already valid. Otherwise the
/// smallest ready node id is emitted first, so the result is deterministic.
pub fn build_order(graph: &Graph) -> Result<Vec<NodeId>> {
    let deps = dependency_graph(graph)?;

    if let Err(cycle) = toposort(&deps, None) {
        return Err(Error::InvalidGraph(format!(
            "Cycle detected in graph '{}' at node {}",
            graph.name,
            deps[cycle.node_id()]
        )));
    }

    let in_order = graph
        .nodes
        .iter()
        .all(|node| node.inputs.iter().all(|input| input.node < node.id));
    if in_order {
        return Ok(graph.nodes.iter().map(|node| node.id).collect());
    }

    trace!("graph '{}' is not stored in dependency order, relinearizing", graph.name);

    let mut in_degree: Vec<usize> = deps
        .node_indices()
        .map(|index| deps.edges_directed(index, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(id, _)| Reverse(id))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for edge in deps.edges_directed(NodeIndex::new(id), Direction::Outgoing) {
            let consumer = edge.target().index();
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{DataType, OutputRef};

    #[test]
    fn test_keeps_valid_order() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4]);
        let b = builder.compute("b", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        builder.output("out", b).unwrap();
        let graph = builder.build();

        assert_eq!(build_order(&graph).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_relinearizes_out_of_order_nodes() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4]);
        let b = builder.compute("b", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        builder.output("out", b).unwrap();
        let mut graph = builder.build();

        // Move the input to the end while keeping ids consistent with positions
        graph.nodes.rotate_left(1);
        for (position, node) in graph.nodes.iter_mut().enumerate() {
            node.id = position;
        }
        graph.nodes[0].inputs = vec![OutputRef::new(2, 0)];
        graph.nodes[1].inputs = vec![OutputRef::new(0, 0)];

        assert_eq!(build_order(&graph).unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn test_rejects_cycle() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4]);
        let b = builder.compute("b", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        let c = builder.compute("c", "Relu", &[b], DataType::Float32, vec![4]).unwrap();
        let mut graph = builder.build();
        graph.nodes[b.node].inputs = vec![c];

        assert!(matches!(build_order(&graph), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_rejects_dangling_input() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4]);
        builder.compute("b", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        let mut graph = builder.build();
        graph.nodes[1].inputs = vec![OutputRef::new(0, 3)];

        assert!(build_order(&graph).is_err());
    }
}
