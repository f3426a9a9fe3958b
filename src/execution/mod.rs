pub mod engine;
pub mod sizing;

pub use engine::{ExecutionEngine, ExecutionResult, ExecutionSettings};
pub use sizing::{SizingConfig, SizingQuery, SizingRamp};
