//! # LM-CRF Trainer
//!
//! CoNLL loading, vocabularies, the character/word/LM emission model and the
//! training loop with gate sparsity, early stopping and final pruning.

pub mod config;
pub mod data;
pub mod eval;
pub mod model;
pub mod trainer;

pub use config::{ModelConfig, OptimizerKind, TrainConfig};
pub use data::{load_conll, Corpus, Sentence, Vocab};
pub use eval::{ChunkScore, Metrics};
pub use model::SeqLabeler;
pub use trainer::{evaluate, run_training, DataPaths, TrainReport, Trainer};
