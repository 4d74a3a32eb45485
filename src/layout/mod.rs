pub mod tensor_layout;

pub use tensor_layout::TensorLayout;
