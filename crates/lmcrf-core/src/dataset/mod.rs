pub mod batch;
pub mod instance;
pub mod iter;

pub use batch::{Batch, BatchIndices, Batcher, PadTokens};
pub use instance::{Instance, PackedInstance};
pub use iter::SeqDataset;
