use crate::error::{Error, Result};
use crate::model::{DataType, Graph, MemoryRegion, Node, NodeId, OpKind, OutputInfo, OutputRef};

/// Incrementally constructs a [`Graph`] in dependency order.
///
/// Nodes are appended in the order the builder methods are called, so the
/// resulting node list is already a valid linearization.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    /// Create a builder for an empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    /// Finish building and return the graph
    pub fn build(self) -> Graph {
        self.graph
    }

    fn push(&mut self, name: &str, op: OpKind, inputs: Vec<OutputRef>, outputs: Vec<OutputInfo>) -> NodeId {
        let id = self.graph.nodes.len();
        let name = if name.is_empty() {
            format!("node_{}", id)
        } else {
            name.to_string()
        };
        self.graph.nodes.push(Node {
            id,
            name,
            op,
            inputs,
            outputs,
            strided_io: false,
        });
        id
    }

    fn info(&self, value: OutputRef) -> Result<&OutputInfo> {
        self.graph.output_info(value)
    }

    /// Add a graph parameter living in the input staging region
    pub fn input(&mut self, name: &str, data_type: DataType, shape: Vec<usize>) -> OutputRef {
        let info = OutputInfo::new(name, data_type, shape, MemoryRegion::Input);
        OutputRef::new(self.push(name, OpKind::Input, Vec::new(), vec![info]), 0)
    }

    /// Add a constant tensor living in the constant data region
    pub fn constant(&mut self, name: &str, data_type: DataType, shape: Vec<usize>, alignment: Option<usize>) -> OutputRef {
        let info = OutputInfo::new(name, data_type, shape, MemoryRegion::ConstantData);
        OutputRef::new(self.push(name, OpKind::Constant { alignment }, Vec::new(), vec![info]), 0)
    }

    /// Add an opaque compute node producing a single scratch output
    pub fn compute(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: &[OutputRef],
        data_type: DataType,
        shape: Vec<usize>,
    ) -> Result<OutputRef> {
        self.compute_in(name, op_type, inputs, data_type, shape, MemoryRegion::ScratchData)
    }

    /// Add an opaque compute node whose output lives in `region`
    pub fn compute_in(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: &[OutputRef],
        data_type: DataType,
        shape: Vec<usize>,
        region: MemoryRegion,
    ) -> Result<OutputRef> {
        for &input in inputs {
            self.info(input)?;
        }
        let info = OutputInfo::new(name, data_type, shape, region);
        let op = OpKind::Compute {
            op_type: op_type.to_string(),
        };
        Ok(OutputRef::new(self.push(name, op, inputs.to_vec(), vec![info]), 0))
    }

    /// Add a compute node with several outputs
    pub fn compute_multi(&mut self, name: &str, op_type: &str, inputs: &[OutputRef], outputs: Vec<OutputInfo>) -> Result<Vec<OutputRef>> {
        for &input in inputs {
            self.info(input)?;
        }
        let count = outputs.len();
        let op = OpKind::Compute {
            op_type: op_type.to_string(),
        };
        let id = self.push(name, op, inputs.to_vec(), outputs);
        Ok((0..count).map(|index| OutputRef::new(id, index)).collect())
    }

    /// Mark the producer of `value` as able to read and write strided sub-buffers
    pub fn set_strided_io(&mut self, value: OutputRef, enabled: bool) -> Result<()> {
        let name = self.graph.name.clone();
        let node = self
            .graph
            .nodes
            .get_mut(value.node)
            .ok_or_else(|| Error::InvalidGraph(format!("Node with ID {} not found in graph '{}'", value.node, name)))?;
        node.strided_io = enabled;
        Ok(())
    }

    /// Reinterpret `input` with the same byte size and a new element type and shape
    pub fn bitcast(&mut self, name: &str, input: OutputRef, data_type: DataType, shape: Vec<usize>) -> Result<OutputRef> {
        let source = self.info(input)?;
        let source_bytes = source.element_count() * source.data_type.size_in_bytes();
        let target_bytes = shape.iter().product::<usize>() * data_type.size_in_bytes();
        if source_bytes != target_bytes {
            return Err(Error::InvalidGraph(format!(
                "Bitcast '{}' changes byte size from {} to {}",
                name, source_bytes, target_bytes
            )));
        }
        let info = OutputInfo::new(name, data_type, shape, derived_region(source.region));
        Ok(OutputRef::new(self.push(name, OpKind::Bitcast, vec![input], vec![info]), 0))
    }

    /// Change the shape of `input` without changing the element order
    pub fn reshape(&mut self, name: &str, input: OutputRef, shape: Vec<usize>) -> Result<OutputRef> {
        let source = self.info(input)?;
        if source.element_count() != shape.iter().product::<usize>() {
            return Err(Error::InvalidGraph(format!(
                "Reshape '{}' from {:?} to {:?} changes the element count",
                name, source.shape, shape
            )));
        }
        let info = OutputInfo::new(name, source.data_type, shape, derived_region(source.region));
        Ok(OutputRef::new(self.push(name, OpKind::Reshape, vec![input], vec![info]), 0))
    }

    /// Concatenate `inputs` along `axis`
    pub fn concat(&mut self, name: &str, inputs: &[OutputRef], axis: usize) -> Result<OutputRef> {
        let first = match inputs.first() {
            Some(&first) => self.info(first)?.clone(),
            None => return Err(Error::InvalidGraph(format!("Concat '{}' has no inputs", name))),
        };
        if axis >= first.shape.len() {
            return Err(Error::InvalidGraph(format!(
                "Concat axis {} is out of bounds for rank {}",
                axis,
                first.shape.len()
            )));
        }

        let mut shape = first.shape.clone();
        shape[axis] = 0;
        for &input in inputs {
            let info = self.info(input)?;
            let compatible = info.data_type == first.data_type
                && info.shape.len() == first.shape.len()
                && info
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(dim, (a, b))| dim == axis || a == b);
            if !compatible {
                return Err(Error::InvalidGraph(format!(
                    "Concat '{}' input {} with shape {:?} is incompatible with {:?} along axis {}",
                    name, input, info.shape, first.shape, axis
                )));
            }
            shape[axis] += info.shape[axis];
        }

        let info = OutputInfo::new(name, first.data_type, shape, MemoryRegion::ScratchData);
        Ok(OutputRef::new(self.push(name, OpKind::Concat { axis }, inputs.to_vec(), vec![info]), 0))
    }

    /// Slice `input` to `[begins, ends)` with `steps` on every axis
    pub fn slice(&mut self, name: &str, input: OutputRef, begins: Vec<usize>, ends: Vec<usize>, steps: Vec<usize>) -> Result<OutputRef> {
        let source = self.info(input)?;
        let rank = source.shape.len();
        if begins.len() != rank || ends.len() != rank || steps.len() != rank {
            return Err(Error::InvalidGraph(format!(
                "Slice '{}' parameters do not match input rank {}",
                name, rank
            )));
        }

        let mut shape = Vec::with_capacity(rank);
        for axis in 0..rank {
            let (begin, end, step) = (begins[axis], ends[axis], steps[axis]);
            if step == 0 || begin > end || end > source.shape[axis] {
                return Err(Error::InvalidGraph(format!(
                    "Slice '{}' range {}..{} step {} is invalid for axis {} of extent {}",
                    name, begin, end, step, axis, source.shape[axis]
                )));
            }
            shape.push((end - begin).div_ceil(step));
        }

        let info = OutputInfo::new(name, source.data_type, shape, derived_region(source.region));
        let op = OpKind::Slice { begins, ends, steps };
        Ok(OutputRef::new(self.push(name, op, vec![input], vec![info]), 0))
    }

    /// Call `callee` with `inputs`, producing outputs shaped like the callee's results
    pub fn call(&mut self, name: &str, callee: Graph, inputs: &[OutputRef]) -> Result<Vec<OutputRef>> {
        for &input in inputs {
            self.info(input)?;
        }

        let mut outputs = Vec::new();
        for node in callee.nodes.iter().filter(|n| matches!(n.op, OpKind::Output)) {
            let result = node.inputs.first().ok_or_else(|| {
                Error::InvalidGraph(format!("Output node '{}' of '{}' has no input", node.name, callee.name))
            })?;
            let info = callee.output_info(*result)?;
            outputs.push(OutputInfo::new(
                format!("{}.{}", name, info.name),
                info.data_type,
                info.shape.clone(),
                MemoryRegion::ScratchData,
            ));
        }

        let count = outputs.len();
        let op = OpKind::Call {
            callee: Box::new(callee),
        };
        let id = self.push(name, op, inputs.to_vec(), outputs);
        Ok((0..count).map(|index| OutputRef::new(id, index)).collect())
    }

    /// Hand `value` back to the caller. Its producer is moved into the output region.
    pub fn output(&mut self, name: &str, value: OutputRef) -> Result<NodeId> {
        let graph_name = self.graph.name.clone();
        let info = self
            .graph
            .nodes
            .get_mut(value.node)
            .and_then(|node| node.outputs.get_mut(value.index))
            .ok_or_else(|| Error::InvalidGraph(format!("Output {} not found in graph '{}'", value, graph_name)))?;
        if info.region != MemoryRegion::Input {
            info.region = MemoryRegion::Output;
        }
        Ok(self.push(name, OpKind::Output, vec![value], Vec::new()))
    }

    /// Override the region hint of an existing output
    pub fn set_region(&mut self, value: OutputRef, region: MemoryRegion) -> Result<()> {
        let graph_name = self.graph.name.clone();
        let info = self
            .graph
            .nodes
            .get_mut(value.node)
            .and_then(|node| node.outputs.get_mut(value.index))
            .ok_or_else(|| Error::InvalidGraph(format!("Output {} not found in graph '{}'", value, graph_name)))?;
        info.region = region;
        Ok(())
    }
}

/// Region of a value derived from a view-like op over a source in `region`
fn derived_region(region: MemoryRegion) -> MemoryRegion {
    match region {
        MemoryRegion::Input | MemoryRegion::Output => MemoryRegion::ScratchData,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_infers_shape() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4, 8]);
        let b = builder.input("b", DataType::Float32, vec![2, 8]);
        let c = builder.concat("c", &[a, b], 0).unwrap();
        let graph = builder.build();
        assert_eq!(graph.output_info(c).unwrap().shape, vec![6, 8]);
    }

    #[test]
    fn test_concat_rejects_mismatched_inputs() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4, 8]);
        let b = builder.input("b", DataType::Float32, vec![4, 7]);
        assert!(builder.concat("c", &[a, b], 0).is_err());
    }

    #[test]
    fn test_slice_infers_shape_with_steps() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![10, 6]);
        let s = builder.slice("s", a, vec![1, 0], vec![7, 6], vec![2, 1]).unwrap();
        let graph = builder.build();
        assert_eq!(graph.output_info(s).unwrap().shape, vec![3, 6]);
    }

    #[test]
    fn test_output_moves_producer_into_output_region() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![4]);
        let r = builder.compute("relu", "Relu", &[a], DataType::Float32, vec![4]).unwrap();
        builder.output("out", r).unwrap();
        let graph = builder.build();
        assert_eq!(graph.output_info(r).unwrap().region, MemoryRegion::Output);
        assert_eq!(graph.output_info(a).unwrap().region, MemoryRegion::Input);
    }

    #[test]
    fn test_multi_output_node() {
        let mut builder = GraphBuilder::new("g");
        let a = builder.input("a", DataType::Float32, vec![8]);
        let halves = builder
            .compute_multi(
                "split",
                "Split",
                &[a],
                vec![
                    OutputInfo::new("lo", DataType::Float32, vec![4], MemoryRegion::ScratchData),
                    OutputInfo::new("hi", DataType::Float32, vec![4], MemoryRegion::ScratchData),
                ],
            )
            .unwrap();
        assert_eq!(halves, vec![OutputRef::new(1, 0), OutputRef::new(1, 1)]);
        let graph = builder.build();
        assert_eq!(graph.output_info(halves[1]).unwrap().name, "hi");
    }

    #[test]
    fn test_rejects_unknown_input() {
        let mut builder = GraphBuilder::new("g");
        let result = builder.compute_multi("split", "Split", &[OutputRef::new(5, 0)], Vec::new());
        assert!(matches!(result, Err(Error::InvalidGraph(_))));
    }
}
