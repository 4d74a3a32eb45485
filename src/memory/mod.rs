pub mod allocator;
pub mod freelist;
pub mod registry;
pub mod size_policy;
pub mod span;

pub use allocator::{
    AllocatorStrategy,
    BufferAllocator,
    FirstFitAllocator,
    LinearAllocator,
    RegionAllocator,
};

pub use freelist::{align_up, Freelist, FreelistError};

pub use registry::{
    AllocationSession,
    AllocatorRegistry,
    RegionConfig,
    RegistryConfig,
    RegistrySnapshot,
    DEFAULT_ALIGNMENT,
};

pub use size_policy::{DenseSizePolicy, RowPaddedSizePolicy, SizePolicy, SizePolicyConfig};

pub use span::{Allocation, MemorySpan};
