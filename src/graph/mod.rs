pub mod builder;
pub mod order;

pub use builder::GraphBuilder;
pub use order::{build_order, dependency_graph};
