use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A tensor layout defines the shape, strides, and offset of a tensor in memory.
/// It describes how the logical indices of a tensor are mapped to element positions
/// inside the buffer that backs it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorLayout {
    /// The shape of the tensor (dimensions)
    shape: Vec<usize>,
    /// The strides of the tensor (number of elements to skip in each dimension)
    strides: Vec<usize>,
    /// The offset in elements from the start of the backing buffer
    offset: usize,
}

impl TensorLayout {
    /// Lay `shape` out inside a buffer whose rows follow `strides_shape`.
    ///
    /// Used for sub-buffers of an aliased parent: the view keeps its own
    /// extents but steps through memory with the parent's strides.
    pub fn strided_layout(shape: &[usize], strides_shape: &[usize], offset: usize) -> Result<Self> {
        if shape.len() != strides_shape.len() {
            return Err(Error::InvalidGraph(format!(
                "Shape {:?} cannot be laid out with strides of rank-{} shape {:?}",
                shape,
                strides_shape.len(),
                strides_shape
            )));
        }
        if shape.iter().zip(strides_shape).any(|(dim, outer)| dim > outer) {
            return Err(Error::InvalidGraph(format!(
                "Shape {:?} does not fit inside strides shape {:?}",
                shape, strides_shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: Self::compute_contiguous_strides(strides_shape),
            offset,
        })
    }

    /// Step `step` elements at a time along the innermost axis
    pub fn with_inner_step(mut self, step: usize) -> Self {
        if let Some(stride) = self.strides.last_mut() {
            *stride *= step;
        }
        self
    }

    /// Calculate contiguous strides for a given shape in row-major (C-style) order.
    /// e.g., for shape [2, 3, 4], strides would be [12, 4, 1]
    pub fn compute_contiguous_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Check if this layout is row-major contiguous (elements are stored without gaps).
    pub fn is_contiguous(&self) -> bool {
        if self.shape.is_empty() || self.is_empty() {
            return true;
        }

        // Axes of extent 1 never step, so their stride is irrelevant
        let c_strides = Self::compute_contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(&c_strides))
            .all(|(&dim, (stride, expected))| dim == 1 || stride == expected)
    }

    /// Number of elements between the first and one past the last addressed element,
    /// counted from the start of the backing buffer.
    pub fn extent(&self) -> usize {
        if self.is_empty() {
            return self.offset;
        }

        let mut max_index = self.offset;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()) {
            max_index += (dim - 1) * stride;
        }
        max_index + 1
    }

    /// Calculate the total size in bytes, accounting for strides.
    pub fn size_in_bytes(&self, element_size: usize) -> usize {
        self.extent() * element_size
    }

    /// Whether the box `[begins, begins + shape)` of a row-major tensor with `outer`
    /// shape occupies one gap-free run of memory.
    pub fn is_contiguous_block(outer: &[usize], begins: &[usize], shape: &[usize]) -> bool {
        if shape.iter().any(|&dim| dim == 0) {
            return true;
        }
        // Leading axes of extent 1 never step. After the first wider axis every
        // axis must span its full outer extent.
        match shape.iter().position(|&dim| dim != 1) {
            None => true,
            Some(axis) => {
                shape[axis + 1..] == outer[axis + 1..] && begins[axis + 1..].iter().all(|&begin| begin == 0)
            }
        }
    }

    /// Return the strides of the tensor.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Check if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&dim| dim == 0)
    }
}

impl fmt::Debug for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorLayout {{ shape: {:?}, strides: {:?}, offset: {} }}",
            self.shape, self.strides, self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(TensorLayout::compute_contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(TensorLayout::compute_contiguous_strides(&[7]), vec![1]);
        assert!(TensorLayout::compute_contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_strided_layout_extent() {
        // A [4, 3] column block starting at column 5 of an [4, 8] tensor
        let layout = TensorLayout::strided_layout(&[4, 3], &[4, 8], 5).unwrap();
        assert_eq!(layout.strides(), &[8, 1]);
        assert!(!layout.is_contiguous());
        assert_eq!(layout.extent(), 5 + 3 * 8 + 2 + 1);
        assert_eq!(layout.size_in_bytes(4), 32 * 4);
    }

    #[test]
    fn test_strided_layout_rejects_oversized_view() {
        assert!(TensorLayout::strided_layout(&[5, 3], &[4, 8], 0).is_err());
        assert!(TensorLayout::strided_layout(&[5], &[4, 8], 0).is_err());
    }

    #[test]
    fn test_contiguous_block_detection() {
        // Full trailing rows
        assert!(TensorLayout::is_contiguous_block(&[8, 8], &[2, 0], &[3, 8]));
        // Partial rows
        assert!(!TensorLayout::is_contiguous_block(&[8, 8], &[0, 2], &[3, 4]));
        // Single partial row
        assert!(TensorLayout::is_contiguous_block(&[8, 8], &[5, 2], &[1, 4]));
        // Whole tensor
        assert!(TensorLayout::is_contiguous_block(&[2, 3], &[0, 0], &[2, 3]));
    }

    #[test]
    fn test_inner_step_widens_extent() {
        // Every other column of row 2 in an [8, 8] tensor
        let layout = TensorLayout::strided_layout(&[1, 4], &[8, 8], 16).unwrap().with_inner_step(2);
        assert_eq!(layout.strides(), &[8, 2]);
        assert!(!layout.is_contiguous());
        assert_eq!(layout.extent(), 16 + 3 * 2 + 1);
    }
}
