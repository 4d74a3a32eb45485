use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};

use super::freelist::{align_up, Freelist, FreelistError};
use super::span::MemorySpan;
use crate::error::{Error, Result};
use crate::model::MemoryRegion;

/// Placement strategy of a region allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorStrategy {
    /// Monotonic bump allocation, nothing is ever reused
    Linear,
    /// First-fit reuse of spans released by dead buffers
    FirstFit,
}

/// Region allocator trait for the buffer scheduler.
///
/// Offsets handed out are absolute: they already include the base offset.
pub trait BufferAllocator: fmt::Debug + Send {
    /// Region this allocator places buffers in
    fn region(&self) -> MemoryRegion;

    /// Bias every subsequent allocation by `value` bytes.
    /// Only meaningful before the first call to [`BufferAllocator::mark`].
    fn base_offset(&mut self, value: usize);

    /// Hand out nothing below `offset`. A size-fixed allocator keeps its end,
    /// so the reserved bytes come out of its capacity.
    fn reserve_below(&mut self, offset: usize);

    /// Reserve `size` bytes starting at a multiple of `alignment`
    fn mark(&mut self, size: usize, alignment: usize) -> Result<MemorySpan>;

    /// Return a span previously handed out by [`BufferAllocator::mark`]
    fn release(&mut self, span: MemorySpan) -> Result<()>;

    /// Close the allocation pass
    fn finish(&mut self);

    /// High-water mark in bytes, base offset included
    fn max_usage(&self) -> usize;
}

/// Bump allocator for regions whose buffers stay valid for the whole invocation
#[derive(Debug, Clone)]
pub struct LinearAllocator {
    region: MemoryRegion,
    base: usize,
    watermark: usize,
    capacity: Option<usize>,
    max_usage: usize,
}

impl LinearAllocator {
    /// Create an unbounded linear allocator
    pub fn new(region: MemoryRegion) -> Self {
        Self {
            region,
            base: 0,
            watermark: 0,
            capacity: None,
            max_usage: 0,
        }
    }

    /// Create a linear allocator that fails past `capacity` bytes
    pub fn with_capacity(region: MemoryRegion, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(region)
        }
    }
}

impl BufferAllocator for LinearAllocator {
    fn region(&self) -> MemoryRegion {
        self.region
    }

    fn base_offset(&mut self, value: usize) {
        self.base = value;
        self.watermark = self.watermark.max(value);
        self.max_usage = self.max_usage.max(value);
    }

    fn reserve_below(&mut self, offset: usize) {
        self.watermark = self.watermark.max(offset);
        self.max_usage = self.max_usage.max(offset);
    }

    fn mark(&mut self, size: usize, alignment: usize) -> Result<MemorySpan> {
        let start = align_up(self.watermark, alignment);
        let end = start + size;
        if let Some(capacity) = self.capacity {
            let limit = self.base + capacity;
            if end > limit {
                return Err(Error::CapacityExceeded {
                    region: self.region,
                    requested: size,
                    available: limit.saturating_sub(start),
                });
            }
        }
        self.watermark = end;
        trace!("{}: linear mark [{}, {})", self.region, start, end);
        Ok(MemorySpan::new(start, size))
    }

    fn release(&mut self, _span: MemorySpan) -> Result<()> {
        // Linear regions never reuse memory
        Ok(())
    }

    fn finish(&mut self) {
        self.max_usage = self.max_usage.max(self.watermark);
    }

    fn max_usage(&self) -> usize {
        self.max_usage.max(self.watermark)
    }
}

/// Freelist-backed allocator that reuses the spans of dead buffers
#[derive(Debug, Clone)]
pub struct FirstFitAllocator {
    region: MemoryRegion,
    freelist: Freelist,
}

impl FirstFitAllocator {
    /// Create a first-fit allocator whose heap grows on demand
    pub fn new(region: MemoryRegion) -> Self {
        Self {
            region,
            freelist: Freelist::growable(),
        }
    }

    /// Create a first-fit allocator over exactly `capacity` bytes
    pub fn with_capacity(region: MemoryRegion, capacity: usize) -> Self {
        Self {
            region,
            freelist: Freelist::fixed(capacity),
        }
    }

    /// The underlying freelist
    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }
}

impl BufferAllocator for FirstFitAllocator {
    fn region(&self) -> MemoryRegion {
        self.region
    }

    fn base_offset(&mut self, value: usize) {
        self.freelist = match self.freelist.capacity() {
            Some(capacity) => Freelist::fixed_at(value, capacity),
            None => Freelist::growable_at(value),
        };
    }

    fn reserve_below(&mut self, offset: usize) {
        self.freelist.reserve_below(offset);
    }

    fn mark(&mut self, size: usize, alignment: usize) -> Result<MemorySpan> {
        let size = align_up(size, alignment);
        let span = self.freelist.allocate(size, alignment).map_err(|err| match err {
            FreelistError::OutOfMemory { requested, available } => Error::CapacityExceeded {
                region: self.region,
                requested,
                available,
            },
            other => Error::InvariantViolation(format!("{}: {}", self.region, other)),
        })?;
        trace!("{}: first-fit mark {}", self.region, span);
        Ok(span)
    }

    fn release(&mut self, span: MemorySpan) -> Result<()> {
        self.freelist
            .free(span)
            .map_err(|err| Error::InvariantViolation(format!("{}: {}", self.region, err)))
    }

    fn finish(&mut self) {}

    fn max_usage(&self) -> usize {
        self.freelist.max_usage()
    }
}

/// The closed set of allocator strategies, dispatched by tag
#[derive(Debug, Clone)]
pub enum RegionAllocator {
    Linear(LinearAllocator),
    FirstFit(FirstFitAllocator),
}

impl RegionAllocator {
    /// Create an allocator for `region` using `strategy`, optionally size-fixed
    pub fn new(region: MemoryRegion, strategy: AllocatorStrategy, capacity: Option<usize>) -> Self {
        match (strategy, capacity) {
            (AllocatorStrategy::Linear, None) => RegionAllocator::Linear(LinearAllocator::new(region)),
            (AllocatorStrategy::Linear, Some(capacity)) => {
                RegionAllocator::Linear(LinearAllocator::with_capacity(region, capacity))
            }
            (AllocatorStrategy::FirstFit, None) => RegionAllocator::FirstFit(FirstFitAllocator::new(region)),
            (AllocatorStrategy::FirstFit, Some(capacity)) => {
                RegionAllocator::FirstFit(FirstFitAllocator::with_capacity(region, capacity))
            }
        }
    }

    pub fn strategy(&self) -> AllocatorStrategy {
        match self {
            RegionAllocator::Linear(_) => AllocatorStrategy::Linear,
            RegionAllocator::FirstFit(_) => AllocatorStrategy::FirstFit,
        }
    }

    fn inner(&self) -> &dyn BufferAllocator {
        match self {
            RegionAllocator::Linear(allocator) => allocator,
            RegionAllocator::FirstFit(allocator) => allocator,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BufferAllocator {
        match self {
            RegionAllocator::Linear(allocator) => allocator,
            RegionAllocator::FirstFit(allocator) => allocator,
        }
    }
}

impl BufferAllocator for RegionAllocator {
    fn region(&self) -> MemoryRegion {
        self.inner().region()
    }

    fn base_offset(&mut self, value: usize) {
        self.inner_mut().base_offset(value)
    }

    fn reserve_below(&mut self, offset: usize) {
        self.inner_mut().reserve_below(offset)
    }

    fn mark(&mut self, size: usize, alignment: usize) -> Result<MemorySpan> {
        self.inner_mut().mark(size, alignment)
    }

    fn release(&mut self, span: MemorySpan) -> Result<()> {
        self.inner_mut().release(span)
    }

    fn finish(&mut self) {
        self.inner_mut().finish()
    }

    fn max_usage(&self) -> usize {
        self.inner().max_usage()
    }
}
