pub mod error;
pub mod graph;
pub mod layout;
pub mod memory;
pub mod model;
pub mod schedule;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::{build_order, GraphBuilder};
pub use layout::TensorLayout;
pub use memory::{
    AllocatorRegistry, AllocatorStrategy, BufferAllocator, FirstFitAllocator, Freelist, LinearAllocator,
    MemorySpan, RegionConfig, RegistryConfig, SizePolicyConfig,
};
pub use model::{DataType, Graph, MemoryRegion, Node, NodeId, OpKind, OutputInfo, OutputRef};
pub use schedule::{
    schedule_targets, BufferAssignment, BufferScheduler, ModelSchedule, ScheduleOptions, SubgraphSchedule,
    TargetSubgraphs,
};
