pub mod layer;
pub mod lm;
pub mod stack;

pub use layer::{FeatureLayer, RecurrentUnit};
pub use lm::{Direction, LmConfig, SparseLm};
pub use stack::{SparseStack, SparsityPenalty};
