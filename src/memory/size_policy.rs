use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::freelist::align_up;
use crate::model::DataType;

/// Computes the byte footprint of a buffer in a region
pub trait SizePolicy: fmt::Debug + Send + Sync {
    /// Bytes needed to store a tensor of `shape` with elements of `data_type`
    fn size_in_bytes(&self, data_type: DataType, shape: &[usize]) -> usize;

    /// Whether byte offsets inside a buffer follow dense row-major strides.
    /// Views can only be expressed as offsets when this holds.
    fn is_dense(&self) -> bool {
        true
    }
}

/// Plain `elements * element_size`
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseSizePolicy;

impl SizePolicy for DenseSizePolicy {
    fn size_in_bytes(&self, data_type: DataType, shape: &[usize]) -> usize {
        shape.iter().product::<usize>() * data_type.size_in_bytes()
    }
}

/// Pads every innermost row to a multiple of `row_alignment` bytes,
/// as required by accelerators that fetch whole rows.
#[derive(Debug, Clone, Copy)]
pub struct RowPaddedSizePolicy {
    pub row_alignment: usize,
}

impl SizePolicy for RowPaddedSizePolicy {
    fn size_in_bytes(&self, data_type: DataType, shape: &[usize]) -> usize {
        let element_size = data_type.size_in_bytes();
        match shape.split_last() {
            None => align_up(element_size, self.row_alignment),
            Some((&row, outer)) => {
                let rows: usize = outer.iter().product();
                rows * align_up(row * element_size, self.row_alignment)
            }
        }
    }

    fn is_dense(&self) -> bool {
        false
    }
}

/// Serializable selection of a size policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizePolicyConfig {
    #[default]
    Dense,
    RowPadded { row_alignment: usize },
}

impl SizePolicyConfig {
    pub fn build(&self) -> Arc<dyn SizePolicy> {
        match *self {
            SizePolicyConfig::Dense => Arc::new(DenseSizePolicy),
            SizePolicyConfig::RowPadded { row_alignment } => Arc::new(RowPaddedSizePolicy { row_alignment }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_size() {
        assert_eq!(DenseSizePolicy.size_in_bytes(DataType::Float32, &[4, 8]), 128);
        assert_eq!(DenseSizePolicy.size_in_bytes(DataType::Int8, &[]), 1);
    }

    #[test]
    fn test_row_padding() {
        let policy = RowPaddedSizePolicy { row_alignment: 32 };
        // 3 rows of 5 * 4 = 20 bytes, each padded to 32
        assert_eq!(policy.size_in_bytes(DataType::Float32, &[3, 5]), 96);
        assert_eq!(policy.size_in_bytes(DataType::Float32, &[]), 32);
        assert!(!policy.is_dense());
    }
}
