//! # LM-CRF
//!
//! Sequence labeling with character features, pretrained language models and
//! a linear-chain CRF. [`lmcrf_core`] holds batching, the CRF and the sparse
//! layer stacks; [`lmcrf_trainer`] holds data loading, the emission model and
//! training.

pub use lmcrf_core;
pub use lmcrf_trainer;

pub use lmcrf_core::{Batch, Batcher, Crf, LabelSpace, LmCrfError, SeqDataset, SparseLm};
pub use lmcrf_trainer::{Corpus, SeqLabeler, TrainConfig, Trainer};
