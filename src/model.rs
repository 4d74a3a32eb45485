use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};

/// Unique identifier for a node in the graph
pub type NodeId = usize;

/// Element types a tensor output can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DataType {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
    BFloat16,
    Float16,
    Complex64,
    Complex128,
}

impl DataType {
    /// Get the size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 => 4,
            DataType::Uint64 => 8,
            DataType::Bool => 1,
            DataType::BFloat16 => 2,
            DataType::Float16 => 2,
            DataType::Complex64 => 8,
            DataType::Complex128 => 16,
        }
    }
}

/// Class of storage a buffer lives in. Each region gets its own allocator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
pub enum MemoryRegion {
    Input,
    Output,
    ConstantData,
    ScratchData,
    AcceleratorLocal,
}

impl MemoryRegion {
    /// Whether the region's layout is fixed by a contract with the caller
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, MemoryRegion::Input | MemoryRegion::Output)
    }

    /// Whether buffers in this region may be written through a view into another buffer
    pub fn is_writable_alias_target(&self) -> bool {
        matches!(self, MemoryRegion::ScratchData | MemoryRegion::AcceleratorLocal)
    }
}

/// Reference to one output connector of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: NodeId,
    pub index: usize,
}

impl OutputRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.node, self.index)
    }
}

/// Declared type, shape, and region hint of an output connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    pub region: MemoryRegion,
}

impl OutputInfo {
    pub fn new(name: impl Into<String>, data_type: DataType, shape: Vec<usize>, region: MemoryRegion) -> Self {
        Self {
            name: name.into(),
            data_type,
            shape,
            region,
        }
    }

    /// Number of elements in the tensor
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Operation performed by a node
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Graph parameter supplied by the caller
    Input,
    /// Graph result handed back to the caller
    Output,
    /// Read-only data baked into the model, optionally with a larger alignment
    Constant { alignment: Option<usize> },
    /// Opaque compute instruction
    Compute { op_type: String },
    /// Reinterpretation of the element bits without moving data
    Bitcast,
    /// Shape change with unchanged element order
    Reshape,
    Concat { axis: usize },
    Slice {
        begins: Vec<usize>,
        ends: Vec<usize>,
        steps: Vec<usize>,
    },
    /// Invocation of a nested subgraph
    Call { callee: Box<Graph> },
}

impl OpKind {
    /// Short mnemonic used in dumps
    pub fn mnemonic(&self) -> &str {
        match self {
            OpKind::Input => "input",
            OpKind::Output => "output",
            OpKind::Constant { .. } => "constant",
            OpKind::Compute { op_type } => op_type,
            OpKind::Bitcast => "bitcast",
            OpKind::Reshape => "reshape",
            OpKind::Concat { .. } => "concat",
            OpKind::Slice { .. } => "slice",
            OpKind::Call { .. } => "call",
        }
    }
}

/// Node in the scheduled dataflow graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<OutputRef>,
    pub outputs: Vec<OutputInfo>,
    /// The node reads and writes through strided sub-buffers
    pub strided_io: bool,
}

impl Node {
    /// Whether the node emits an instruction, as opposed to pure metadata
    pub fn is_action(&self) -> bool {
        !matches!(self.op, OpKind::Input | OpKind::Output | OpKind::Constant { .. })
    }
}

/// A schedulable subgraph. Node ids index into `nodes`.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Look up a node by id
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node with ID {} not found in graph '{}'", id, self.name)))
    }

    /// Declared info for an output connector
    pub fn output_info(&self, output: OutputRef) -> Result<&OutputInfo> {
        self.node(output.node)?.outputs.get(output.index).ok_or_else(|| {
            Error::InvalidGraph(format!(
                "Node {} in graph '{}' has no output {}",
                output.node, self.name, output.index
            ))
        })
    }

    /// Consumer nodes of every output, one entry per consuming edge
    pub fn consumers(&self) -> HashMap<OutputRef, Vec<NodeId>> {
        let mut consumers: HashMap<OutputRef, Vec<NodeId>> = HashMap::new();
        for node in &self.nodes {
            for &input in &node.inputs {
                consumers.entry(input).or_default().push(node.id);
            }
        }
        consumers
    }
}
