use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::allocator::{AllocatorStrategy, BufferAllocator, RegionAllocator};
use super::size_policy::{SizePolicy, SizePolicyConfig};
use crate::error::{Error, Result};
use crate::model::{DataType, MemoryRegion};

/// Alignment applied to buffers when nothing larger is requested
pub const DEFAULT_ALIGNMENT: usize = 8;

fn default_alignment() -> usize {
    DEFAULT_ALIGNMENT
}

/// Allocator configuration of one memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub strategy: AllocatorStrategy,
    /// Size-fixed regions fail instead of growing past this many bytes
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Shared regions keep one allocator across every subgraph of a run
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub base_offset: usize,
    /// Overrides the registry's default alignment for this region
    #[serde(default)]
    pub alignment: Option<usize>,
    #[serde(default)]
    pub size_policy: SizePolicyConfig,
}

impl RegionConfig {
    pub fn new(strategy: AllocatorStrategy) -> Self {
        Self {
            strategy,
            capacity: None,
            shared: false,
            base_offset: 0,
            alignment: None,
            size_policy: SizePolicyConfig::Dense,
        }
    }

    pub fn linear() -> Self {
        Self::new(AllocatorStrategy::Linear)
    }

    pub fn first_fit() -> Self {
        Self::new(AllocatorStrategy::FirstFit)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_base_offset(mut self, base_offset: usize) -> Self {
        self.base_offset = base_offset;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn with_size_policy(mut self, size_policy: SizePolicyConfig) -> Self {
        self.size_policy = size_policy;
        self
    }
}

/// Serializable description of an [`AllocatorRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_alignment")]
    pub default_alignment: usize,
    pub regions: BTreeMap<MemoryRegion, RegionConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(MemoryRegion::Input, RegionConfig::linear());
        regions.insert(MemoryRegion::Output, RegionConfig::linear());
        regions.insert(MemoryRegion::ConstantData, RegionConfig::linear().shared(true));
        regions.insert(MemoryRegion::ScratchData, RegionConfig::first_fit());
        regions.insert(MemoryRegion::AcceleratorLocal, RegionConfig::first_fit());
        Self {
            default_alignment: DEFAULT_ALIGNMENT,
            regions,
        }
    }
}

struct RegionEntry {
    config: RegionConfig,
    policy: Arc<dyn SizePolicy>,
    persistent: Option<RegionAllocator>,
}

impl RegionEntry {
    fn new(region: MemoryRegion, config: RegionConfig) -> Self {
        let policy = config.size_policy.build();
        let mut entry = Self {
            config,
            policy,
            persistent: None,
        };
        if entry.config.shared {
            entry.persistent = Some(entry.fresh_allocator(region, 0));
        }
        entry
    }

    fn fresh_allocator(&self, region: MemoryRegion, bias: usize) -> RegionAllocator {
        let mut allocator = RegionAllocator::new(region, self.config.strategy, self.config.capacity);
        allocator.base_offset(self.config.base_offset);
        // A bias reserves the low end of the region instead of shifting it
        allocator.reserve_below(bias);
        allocator
    }
}

/// Maps every memory region to its allocator strategy, alignment, and size policy.
///
/// One registry serves one compilation run for one target. Shared regions keep
/// their allocator state across subgraphs; every other region starts fresh
/// for each subgraph.
pub struct AllocatorRegistry {
    default_alignment: usize,
    regions: BTreeMap<MemoryRegion, RegionEntry>,
}

impl AllocatorRegistry {
    /// Create a registry with the default region layout
    pub fn new() -> Self {
        let config = RegistryConfig::default();
        Self {
            default_alignment: config.default_alignment,
            regions: config
                .regions
                .into_iter()
                .map(|(region, region_config)| (region, RegionEntry::new(region, region_config)))
                .collect(),
        }
    }

    /// Build a registry from its serializable description
    pub fn from_config(config: RegistryConfig) -> Result<Self> {
        validate_alignment("default", config.default_alignment)?;
        let mut registry = Self {
            default_alignment: config.default_alignment,
            regions: BTreeMap::new(),
        };
        for (region, region_config) in config.regions {
            registry.set_region(region, region_config)?;
        }
        let missing = registry.unconfigured_regions();
        if !missing.is_empty() {
            debug!("no allocator configured for {:?}", missing);
        }
        Ok(registry)
    }

    /// Parse a JSON registry description
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        Self::from_config(config)
    }

    /// Register or replace the allocator configuration of `region`
    pub fn set_region(&mut self, region: MemoryRegion, config: RegionConfig) -> Result<()> {
        if let Some(alignment) = config.alignment {
            validate_alignment(&region.to_string(), alignment)?;
        }
        if let SizePolicyConfig::RowPadded { row_alignment } = config.size_policy {
            validate_alignment(&format!("{} row", region), row_alignment)?;
        }

        self.regions.insert(region, RegionEntry::new(region, config));
        Ok(())
    }

    /// Install a custom size policy for `region`
    pub fn set_size_policy(&mut self, region: MemoryRegion, policy: Arc<dyn SizePolicy>) -> Result<()> {
        self.entry_mut(region)?.policy = policy;
        Ok(())
    }

    fn entry(&self, region: MemoryRegion) -> Result<&RegionEntry> {
        self.regions
            .get(&region)
            .ok_or_else(|| Error::InvalidConfig(format!("No allocator registered for region {}", region)))
    }

    fn entry_mut(&mut self, region: MemoryRegion) -> Result<&mut RegionEntry> {
        self.regions
            .get_mut(&region)
            .ok_or_else(|| Error::InvalidConfig(format!("No allocator registered for region {}", region)))
    }

    /// Regions without an allocator. Buffers placed there fail to schedule.
    pub fn unconfigured_regions(&self) -> Vec<MemoryRegion> {
        MemoryRegion::iter()
            .filter(|region| !self.regions.contains_key(region))
            .collect()
    }

    /// Configuration of `region`
    pub fn region_config(&self, region: MemoryRegion) -> Result<&RegionConfig> {
        Ok(&self.entry(region)?.config)
    }

    /// Minimum alignment of buffers in `region`
    pub fn alignment_for(&self, region: MemoryRegion) -> usize {
        self.regions
            .get(&region)
            .and_then(|entry| entry.config.alignment)
            .unwrap_or(self.default_alignment)
    }

    /// Byte footprint of a tensor placed in `region`
    pub fn size_in_bytes(&self, region: MemoryRegion, data_type: DataType, shape: &[usize]) -> Result<usize> {
        Ok(self.entry(region)?.policy.size_in_bytes(data_type, shape))
    }

    /// Whether byte offsets inside buffers of `region` follow dense strides
    pub fn is_dense(&self, region: MemoryRegion) -> bool {
        self.regions.get(&region).is_some_and(|entry| entry.policy.is_dense())
    }

    /// Whether `region` persists across subgraphs
    pub fn is_shared(&self, region: MemoryRegion) -> bool {
        self.regions.get(&region).is_some_and(|entry| entry.config.shared)
    }

    /// Current high-water mark of a shared region
    pub fn shared_usage(&self, region: MemoryRegion) -> Option<usize> {
        self.regions
            .get(&region)
            .and_then(|entry| entry.persistent.as_ref())
            .map(|allocator| allocator.max_usage())
    }

    /// Snapshot the allocators for one subgraph run.
    ///
    /// Non-shared regions get a fresh allocator starting no lower than
    /// `bias[region]`; shared regions start from a copy of their persistent state.
    pub fn open_session(&self, bias: &BTreeMap<MemoryRegion, usize>) -> AllocationSession {
        let allocators = self
            .regions
            .iter()
            .map(|(&region, entry)| {
                let allocator = match &entry.persistent {
                    Some(persistent) => persistent.clone(),
                    None => entry.fresh_allocator(region, bias.get(&region).copied().unwrap_or(0)),
                };
                (region, allocator)
            })
            .collect();
        AllocationSession { allocators }
    }

    /// Capture the persistent state of every shared region
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            shared: self
                .regions
                .iter()
                .filter_map(|(&region, entry)| entry.persistent.clone().map(|allocator| (region, allocator)))
                .collect(),
        }
    }

    /// Roll the shared regions back to `snapshot`
    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        for (region, allocator) in snapshot.shared {
            if let Some(entry) = self.regions.get_mut(&region) {
                entry.persistent = Some(allocator);
            }
        }
    }

    /// Persist the shared regions of a successful session
    pub fn commit(&mut self, session: AllocationSession) {
        for (region, allocator) in session.allocators {
            if let Some(entry) = self.regions.get_mut(&region) {
                if entry.persistent.is_some() {
                    debug!("committing shared region {} at {} bytes", region, allocator.max_usage());
                    entry.persistent = Some(allocator);
                }
            }
        }
    }
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (region, entry) in &self.regions {
            map.entry(region, &entry.config);
        }
        map.finish()
    }
}

fn validate_alignment(what: &str, alignment: usize) -> Result<()> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "{} alignment must be a non-zero power of two, got {}",
            what, alignment
        )));
    }
    Ok(())
}

/// Saved state of the shared regions of an [`AllocatorRegistry`]
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    shared: BTreeMap<MemoryRegion, RegionAllocator>,
}

/// Working copy of the region allocators used while scheduling one subgraph
#[derive(Debug, Clone)]
pub struct AllocationSession {
    allocators: BTreeMap<MemoryRegion, RegionAllocator>,
}

impl AllocationSession {
    /// Allocator of `region`
    pub fn allocator(&mut self, region: MemoryRegion) -> Result<&mut RegionAllocator> {
        self.allocators
            .get_mut(&region)
            .ok_or_else(|| Error::InvalidConfig(format!("No allocator registered for region {}", region)))
    }

    /// Close every allocator and report its high-water mark
    pub fn finish(&mut self) -> BTreeMap<MemoryRegion, usize> {
        self.allocators
            .iter_mut()
            .map(|(&region, allocator)| {
                allocator.finish();
                (region, allocator.max_usage())
            })
            .collect()
    }
}
