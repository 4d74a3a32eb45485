use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::memory::{Allocation, MemorySpan};
use crate::model::{DataType, MemoryRegion, OutputInfo, OutputRef};

/// Index of a logical buffer inside its [`BufferArena`]
pub type LogicalBufferId = usize;

/// Index of a physical buffer inside a subgraph schedule
pub type PhysicalBufferId = usize;

/// Liveness of a buffer measured in instruction steps.
///
/// The buffer is considered live over the inclusive interval `[birth, birth + age]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Lifetime {
    pub birth: u64,
    /// Consumer edges that have not been visited yet
    pub used_count: u32,
    pub age: u64,
}

impl Lifetime {
    pub fn new(birth: u64, used_count: u32) -> Self {
        Self {
            birth,
            used_count,
            age: 0,
        }
    }

    /// Last step at which the buffer is live
    pub fn end(&self) -> u64 {
        self.birth + self.age
    }

    pub fn is_alive(&self) -> bool {
        self.used_count > 0
    }

    /// Whether both lifetimes are live at some common step
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.birth <= other.end() && other.birth <= self.end()
    }

    /// Widen this lifetime to also cover `other`
    pub fn widen(&mut self, other: &Lifetime) {
        let birth = self.birth.min(other.birth);
        let end = self.end().max(other.end());
        self.birth = birth;
        self.age = end - birth;
    }
}

/// Marks a logical buffer as a no-copy view into another buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewDescriptor {
    pub parent: LogicalBufferId,
    /// Byte offset of the view's first element inside the parent
    pub byte_offset: usize,
    pub shape: Vec<usize>,
    /// The view steps through memory with its parent's strides instead of its own
    pub strided: bool,
    /// Elements skipped per step along the innermost axis, 1 for a plain window
    pub inner_step: usize,
}

/// Scheduling-time representation of one tensor value
#[derive(Debug, Clone, Serialize)]
pub struct LogicalBuffer {
    pub id: LogicalBufferId,
    pub owner: OutputRef,
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    pub region: MemoryRegion,
    pub view: Option<ViewDescriptor>,
    /// Shape whose row-major strides address this buffer's elements
    pub strides_shape: Vec<usize>,
    pub lifetime: Lifetime,
    /// Alignment requested by the producer on top of the region default
    pub alignment: Option<usize>,
    pub physical: Option<PhysicalBufferId>,
}

impl LogicalBuffer {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Dense byte size of the logical shape
    pub fn dense_size_in_bytes(&self) -> usize {
        self.element_count() * self.data_type.size_in_bytes()
    }

    pub fn is_strided_view(&self) -> bool {
        self.view.as_ref().is_some_and(|view| view.strided)
    }
}

/// A group of logical buffers sharing one allocation
#[derive(Debug, Clone, Serialize)]
pub struct PhysicalBuffer {
    pub id: PhysicalBufferId,
    /// The member without a parent view
    pub root: LogicalBufferId,
    pub members: Vec<LogicalBufferId>,
    pub region: MemoryRegion,
    pub alignment: usize,
    pub size_bytes: usize,
    /// Union of the members' lifetimes
    pub lifetime: Lifetime,
    pub allocation: Option<MemorySpan>,
}

impl PhysicalBuffer {
    /// Assigned span, or an invariant violation when allocation has not run
    pub fn span(&self) -> Result<MemorySpan> {
        self.allocation.ok_or_else(|| {
            Error::InvariantViolation(format!("Physical buffer {} was never allocated", self.id))
        })
    }

    /// Assigned span tagged with its region
    pub fn placement(&self) -> Result<Allocation> {
        Ok(Allocation::new(self.region, self.span()?))
    }
}

/// Index-addressed storage of every logical buffer of one subgraph
#[derive(Debug, Clone, Default)]
pub struct BufferArena {
    buffers: Vec<LogicalBuffer>,
    by_output: HashMap<OutputRef, LogicalBufferId>,
}

impl BufferArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Create the buffer for `owner`
    pub fn insert(&mut self, owner: OutputRef, info: &OutputInfo, lifetime: Lifetime, alignment: Option<usize>) -> LogicalBufferId {
        let id = self.buffers.len();
        self.buffers.push(LogicalBuffer {
            id,
            owner,
            name: info.name.clone(),
            data_type: info.data_type,
            shape: info.shape.clone(),
            region: info.region,
            view: None,
            strides_shape: info.shape.clone(),
            lifetime,
            alignment,
            physical: None,
        });
        self.by_output.insert(owner, id);
        id
    }

    /// Buffer created for `output`, if it has been visited
    pub fn lookup(&self, output: OutputRef) -> Option<LogicalBufferId> {
        self.by_output.get(&output).copied()
    }

    pub fn get(&self, id: LogicalBufferId) -> Result<&LogicalBuffer> {
        self.buffers
            .get(id)
            .ok_or_else(|| Error::InvariantViolation(format!("Logical buffer {} does not exist", id)))
    }

    pub fn get_mut(&mut self, id: LogicalBufferId) -> Result<&mut LogicalBuffer> {
        self.buffers
            .get_mut(id)
            .ok_or_else(|| Error::InvariantViolation(format!("Logical buffer {} does not exist", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalBuffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogicalBuffer> {
        self.buffers.iter_mut()
    }

    /// Whether some other buffer is a view into `id`
    pub fn has_views_into(&self, id: LogicalBufferId) -> bool {
        self.buffers
            .iter()
            .any(|buffer| buffer.view.as_ref().is_some_and(|view| view.parent == id))
    }

    /// Follow the view chain of `id` to its root.
    ///
    /// Returns the root id and the byte offset of `id` inside the root.
    pub fn resolve_root(&self, id: LogicalBufferId) -> Result<(LogicalBufferId, usize)> {
        let mut current = id;
        let mut offset = 0;
        for _ in 0..=self.buffers.len() {
            match &self.get(current)?.view {
                None => return Ok((current, offset)),
                Some(view) => {
                    if view.parent >= self.buffers.len() {
                        return Err(Error::InvariantViolation(format!(
                            "View '{}' points at missing parent buffer {}",
                            self.buffers[current].name, view.parent
                        )));
                    }
                    offset += view.byte_offset;
                    current = view.parent;
                }
            }
        }
        Err(Error::InvariantViolation(format!(
            "View chain of '{}' never reaches a root buffer",
            self.buffers[id].name
        )))
    }

    /// Shape whose strides address `id`, resolved through strided views
    pub fn effective_strides_shape(&self, id: LogicalBufferId) -> Result<Vec<usize>> {
        let mut current = self.get(id)?;
        for _ in 0..=self.buffers.len() {
            match &current.view {
                Some(view) if view.strided => current = self.get(view.parent)?,
                _ => return Ok(current.strides_shape.clone()),
            }
        }
        Err(Error::InvariantViolation(format!(
            "Strided view chain of '{}' is cyclic",
            self.buffers[id].name
        )))
    }

    /// Consume the arena, returning the buffers in id order
    pub fn into_buffers(self) -> Vec<LogicalBuffer> {
        self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, shape: Vec<usize>) -> OutputInfo {
        OutputInfo::new(name, DataType::Float32, shape, MemoryRegion::ScratchData)
    }

    #[test]
    fn test_lifetime_overlap_is_inclusive() {
        let a = Lifetime {
            birth: 0,
            used_count: 0,
            age: 2,
        };
        let b = Lifetime {
            birth: 2,
            used_count: 0,
            age: 1,
        };
        let c = Lifetime {
            birth: 3,
            used_count: 0,
            age: 2,
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_lifetime_widen() {
        let mut a = Lifetime {
            birth: 4,
            used_count: 0,
            age: 1,
        };
        a.widen(&Lifetime {
            birth: 2,
            used_count: 0,
            age: 1,
        });
        assert_eq!((a.birth, a.end()), (2, 5));
    }

    #[test]
    fn test_resolve_root_accumulates_offsets() {
        let mut arena = BufferArena::new();
        let root = arena.insert(OutputRef::new(0, 0), &info("root", vec![16]), Lifetime::default(), None);
        let mid = arena.insert(OutputRef::new(1, 0), &info("mid", vec![8]), Lifetime::default(), None);
        let leaf = arena.insert(OutputRef::new(2, 0), &info("leaf", vec![4]), Lifetime::default(), None);
        arena.get_mut(mid).unwrap().view = Some(ViewDescriptor {
            parent: root,
            byte_offset: 32,
            shape: vec![8],
            strided: false,
            inner_step: 1,
        });
        arena.get_mut(leaf).unwrap().view = Some(ViewDescriptor {
            parent: mid,
            byte_offset: 16,
            shape: vec![4],
            strided: false,
            inner_step: 1,
        });

        assert_eq!(arena.resolve_root(leaf).unwrap(), (root, 48));
        assert_eq!(arena.resolve_root(root).unwrap(), (root, 0));
        assert!(arena.has_views_into(mid));
        assert!(!arena.has_views_into(leaf));
    }

    #[test]
    fn test_resolve_root_detects_cycles_and_dangling_parents() {
        let mut arena = BufferArena::new();
        let a = arena.insert(OutputRef::new(0, 0), &info("a", vec![4]), Lifetime::default(), None);
        let b = arena.insert(OutputRef::new(1, 0), &info("b", vec![4]), Lifetime::default(), None);
        let view = |parent| ViewDescriptor {
            parent,
            byte_offset: 0,
            shape: vec![4],
            strided: false,
            inner_step: 1,
        };
        arena.get_mut(a).unwrap().view = Some(view(b));
        arena.get_mut(b).unwrap().view = Some(view(a));
        assert!(matches!(arena.resolve_root(a), Err(Error::InvariantViolation(_))));

        arena.get_mut(b).unwrap().view = Some(view(9));
        assert!(matches!(arena.resolve_root(a), Err(Error::InvariantViolation(_))));
    }
}
