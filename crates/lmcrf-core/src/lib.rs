//! # LM-CRF Core
//!
//! Batching, CRF scoring and sparsity pruning for a sequence labeler fed by
//! character features and two pretrained language models. Instances are
//! packed once, drawn in shuffled batches, and laid out time-major with
//! flattened gather indices; a linear-chain CRF turns emission scores into a
//! training loss or a decoded label sequence.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::Device;
//! use lmcrf_core::dataset::{Batcher, Instance, PadTokens};
//!
//! let pads = PadTokens {
//!     flm_pad: 99,
//!     blm_pad: 99,
//!     word_pad: 99,
//!     char_separator: 0,
//!     char_pad: 1,
//!     label_start: 3,
//!     label_pad: 4,
//!     label_size: 5,
//! };
//! let instance = Instance {
//!     flm_words: vec![2, 3, 4],
//!     blm_words: vec![2, 3, 4],
//!     words: vec![2, 3, 4],
//!     chars: vec![vec![5, 6], vec![7], vec![5, 6, 7]],
//!     labels: vec![0, 2, 1],
//! }
//! .pack(pads.char_separator);
//!
//! let batcher = Batcher::new(pads, Device::Cpu)?;
//! let indices = batcher.assemble(&[&instance])?;
//! assert_eq!(&indices.fw_boundaries[..3], &[2, 4, 8]);
//! assert_eq!(&indices.transitions[..4], &[15, 2, 11, 9]);
//! # Ok::<(), lmcrf_core::LmCrfError>(())
//! ```
pub mod crf;
pub mod dataset;
pub mod error;
pub mod sparse;

// Re-export primary API
pub use crf::{Crf, CrfDecoder, CrfLoss, LabelSpace};
pub use dataset::{Batch, BatchIndices, Batcher, Instance, PackedInstance, PadTokens, SeqDataset};
pub use error::{LmCrfError, Result};
pub use sparse::{
    Direction, FeatureLayer, LmConfig, RecurrentUnit, SparseLm, SparseStack, SparsityPenalty,
};
