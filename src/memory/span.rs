use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::MemoryRegion;

/// A half-open byte interval `[start, start + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MemorySpan {
    pub start: usize,
    pub size: usize,
}

impl MemorySpan {
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last byte of the span
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether both spans are non-empty and share at least one byte
    pub fn overlaps(&self, other: &MemorySpan) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Whether `other` lies entirely inside this span
    pub fn contains(&self, other: &MemorySpan) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

impl fmt::Display for MemorySpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// A span placed in a specific memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub region: MemoryRegion,
    pub span: MemorySpan,
}

impl Allocation {
    pub fn new(region: MemoryRegion, span: MemorySpan) -> Self {
        Self { region, span }
    }

    /// Overlap requires the same region in addition to intersecting spans
    pub fn overlaps(&self, other: &Allocation) -> bool {
        self.region == other.region && self.span.overlaps(&other.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_end_and_overlap() {
        let a = MemorySpan::new(0, 16);
        let b = MemorySpan::new(16, 8);
        let c = MemorySpan::new(8, 16);
        assert_eq!(a.end(), 16);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_empty_span_never_overlaps() {
        let a = MemorySpan::new(0, 16);
        let empty = MemorySpan::new(4, 0);
        assert!(!a.overlaps(&empty));
        assert!(!empty.overlaps(&a));
    }

    #[test]
    fn test_allocation_overlap_requires_same_region() {
        let span = MemorySpan::new(0, 32);
        let scratch = Allocation::new(MemoryRegion::ScratchData, span);
        let constant = Allocation::new(MemoryRegion::ConstantData, span);
        assert!(scratch.overlaps(&scratch));
        assert!(!scratch.overlaps(&constant));
    }
}
