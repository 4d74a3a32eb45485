use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use super::span::MemorySpan;

/// Failures reported by [`Freelist`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreelistError {
    #[error("out of memory: requested {requested} bytes, largest free span is {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("span {0} is not allocated or overlaps free space")]
    InvalidFree(MemorySpan),
}

/// Round `offset` up to the next multiple of `alignment`
pub fn align_up(offset: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    offset.div_ceil(alignment) * alignment
}

/// First-fit allocator over a set of free spans.
///
/// Free spans are keyed by their start offset and kept maximally merged:
/// no two free spans are ever adjacent. A growable freelist extends its heap
/// when no free span fits; a fixed freelist fails instead.
#[derive(Debug, Clone)]
pub struct Freelist {
    free: BTreeMap<usize, MemorySpan>,
    heap_end: usize,
    capacity: Option<usize>,
    high_water: usize,
}

impl Freelist {
    /// Create a freelist whose heap grows on demand
    pub fn growable() -> Self {
        Self::growable_at(0)
    }

    /// Create a growable freelist whose heap starts at `base`
    pub fn growable_at(base: usize) -> Self {
        Self {
            free: BTreeMap::new(),
            heap_end: base,
            capacity: None,
            high_water: base,
        }
    }

    /// Create a freelist over exactly `capacity` bytes
    pub fn fixed(capacity: usize) -> Self {
        Self::fixed_at(0, capacity)
    }

    /// Create a freelist over the `capacity` bytes starting at `base`
    pub fn fixed_at(base: usize, capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(base, MemorySpan::new(base, capacity));
        }
        Self {
            free,
            heap_end: base + capacity,
            capacity: Some(capacity),
            high_water: base,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.capacity.is_some()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Highest byte offset ever handed out
    pub fn max_usage(&self) -> usize {
        self.high_water
    }

    /// Sum of all free span sizes
    pub fn total_free(&self) -> usize {
        self.free.values().map(|span| span.size).sum()
    }

    /// Size of the largest free span
    pub fn largest_free(&self) -> usize {
        self.free.values().map(|span| span.size).max().unwrap_or(0)
    }

    /// Free spans in ascending offset order
    pub fn free_spans(&self) -> impl Iterator<Item = &MemorySpan> {
        self.free.values()
    }

    /// Withdraw every free byte below `offset`. A growable heap is extended to
    /// `offset`; a fixed one keeps its end and loses the reserved capacity.
    pub fn reserve_below(&mut self, offset: usize) {
        let below: Vec<MemorySpan> = self.free.range(..offset).map(|(_, span)| *span).collect();
        for span in below {
            self.free.remove(&span.start);
            if span.end() > offset {
                self.free.insert(offset, MemorySpan::new(offset, span.end() - offset));
            }
        }
        if !self.is_fixed() {
            self.heap_end = self.heap_end.max(offset);
        }
        self.high_water = self.high_water.max(offset.min(self.heap_end));
        trace!("freelist: reserved everything below {}", offset);
    }

    fn find_fit(&self, size: usize, alignment: usize) -> Option<(MemorySpan, usize)> {
        self.free.values().find_map(|span| {
            let start = align_up(span.start, alignment);
            (start + size <= span.end()).then_some((*span, start))
        })
    }

    /// Allocate `size` bytes whose start is a multiple of `alignment`.
    ///
    /// The first free span that fits is used; any leading alignment gap and
    /// trailing remainder stay free.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<MemorySpan, FreelistError> {
        if size == 0 {
            return Ok(MemorySpan::new(self.high_water, 0));
        }

        if let Some((span, start)) = self.find_fit(size, alignment) {
            self.free.remove(&span.start);
            if start > span.start {
                self.free.insert(span.start, MemorySpan::new(span.start, start - span.start));
            }
            let end = start + size;
            if end < span.end() {
                self.free.insert(end, MemorySpan::new(end, span.end() - end));
            }
            self.high_water = self.high_water.max(end);
            trace!("freelist: reused [{}, {}) from free span {}", start, end, span);
            return Ok(MemorySpan::new(start, size));
        }

        if self.is_fixed() {
            return Err(FreelistError::OutOfMemory {
                requested: size,
                available: self.largest_free(),
            });
        }

        // Extend from the free tail when one touches the heap end
        let tail = self
            .free
            .values()
            .next_back()
            .copied()
            .filter(|span| span.end() == self.heap_end);
        let base = match tail {
            Some(span) => {
                self.free.remove(&span.start);
                span.start
            }
            None => self.heap_end,
        };
        let start = align_up(base, alignment);
        if start > base {
            self.free.insert(base, MemorySpan::new(base, start - base));
        }
        self.heap_end = start + size;
        self.high_water = self.high_water.max(self.heap_end);
        trace!("freelist: grew heap to {} for {} bytes", self.heap_end, size);
        Ok(MemorySpan::new(start, size))
    }

    /// Return `span` to the free set, merging it with adjacent free spans
    pub fn free(&mut self, span: MemorySpan) -> Result<(), FreelistError> {
        if span.is_empty() {
            return Ok(());
        }
        if span.end() > self.heap_end {
            return Err(FreelistError::InvalidFree(span));
        }

        let previous = self.free.range(..span.start).next_back().map(|(_, s)| *s);
        let next = self.free.range(span.start..).next().map(|(_, s)| *s);
        if previous.is_some_and(|p| p.end() > span.start) || next.is_some_and(|n| n.start < span.end()) {
            return Err(FreelistError::InvalidFree(span));
        }

        let mut merged = span;
        if let Some(previous) = previous.filter(|p| p.end() == span.start) {
            self.free.remove(&previous.start);
            merged = MemorySpan::new(previous.start, previous.size + merged.size);
        }
        if let Some(next) = next.filter(|n| n.start == span.end()) {
            self.free.remove(&next.start);
            merged = MemorySpan::new(merged.start, merged.size + next.size);
        }
        self.free.insert(merged.start, merged);
        Ok(())
    }
}
