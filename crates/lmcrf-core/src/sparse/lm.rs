//! # Sparse Language Model
//!
//! A frozen word embedding followed by a [`SparseStack`] of recurrent units. The
//! backward model reads the reversed word sequence and realigns its states
//! to forward word order with the batch's remap index.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LmCrfError, Result};
use crate::sparse::layer::{FeatureLayer, RecurrentUnit};
use crate::sparse::stack::{SparseStack, SparsityPenalty};

/// Shape of one language-model feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Vocabulary size of the language model.
    pub vocab_size: usize,

    /// Word embedding width.
    pub word_dim: usize,

    /// Features added by each stacked layer.
    pub increment: usize,

    /// Number of stacked layers.
    pub num_layers: usize,

    /// Dropout on each layer's input during training.
    #[serde(default)]
    pub dropout: f32,

    /// Keep the gate vector fixed.
    #[serde(default)]
    pub frozen_gates: bool,
}

impl LmConfig {
    /// Reject zero-sized dimensions and out-of-range dropout.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.word_dim == 0 || self.increment == 0 {
            return Err(LmCrfError::InvalidConfig(format!(
                "language model dimensions must be positive: {self:?}"
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LmCrfError::InvalidConfig(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Output width before any pruning.
    pub fn output_dim(&self) -> usize {
        self.word_dim + self.num_layers * self.increment
    }
}

/// Reading direction of a language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Frozen embedding plus a gated layer stack.
#[derive(Debug)]
pub struct SparseLm {
    config: LmConfig,
    direction: Direction,
    embed: Embedding,
    stack: SparseStack,
}

impl SparseLm {
    /// Build from `word_embed.weight`, the LSTM tensors under `layers.{k}`
    /// and an optional `gates` vector under `vb`.
    pub fn new(config: LmConfig, direction: Direction, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let embed = candle_nn::embedding(config.vocab_size, config.word_dim, vb.pp("word_embed"))?;
        let embed = Embedding::new(embed.embeddings().detach(), config.word_dim);

        let mut layers: Vec<Box<dyn FeatureLayer>> = Vec::with_capacity(config.num_layers);
        let mut width = config.word_dim;
        for k in 0..config.num_layers {
            let layer = RecurrentUnit::new(
                k,
                width,
                config.increment,
                config.dropout,
                vb.pp(format!("layers.{k}")),
            )?;
            width = layer.output_dim();
            layers.push(Box::new(layer));
        }

        let gates = if config.num_layers > 0 && vb.contains_tensor("gates") {
            Some(vb.get(config.num_layers, "gates")?)
        } else {
            None
        };
        let stack = SparseStack::new(
            config.word_dim,
            layers,
            gates,
            config.frozen_gates,
            &device,
        )?;

        debug!(
            ?direction,
            layers = config.num_layers,
            output_dim = stack.output_dim(),
            "language model ready"
        );
        Ok(Self {
            config,
            direction,
            embed,
            stack,
        })
    }

    /// Load weights from a safetensors file, or initialize them randomly when
    /// no path is given.
    pub fn load(
        config: LmConfig,
        direction: Direction,
        path: Option<&Path>,
        device: &Device,
    ) -> Result<Self> {
        match path {
            Some(path) => {
                let tensors = candle_core::safetensors::load(path, device)?;
                Self::new(
                    config,
                    direction,
                    VarBuilder::from_tensors(tensors, DType::F32, device),
                )
            }
            None => {
                warn!(?direction, "no language model weights given, initializing randomly");
                let varmap = VarMap::new();
                Self::new(
                    config,
                    direction,
                    VarBuilder::from_varmap(&varmap, DType::F32, device),
                )
            }
        }
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current output width.
    pub fn output_dim(&self) -> usize {
        self.stack.output_dim()
    }

    pub fn stack(&self) -> &SparseStack {
        &self.stack
    }

    /// `[time, batch]` word ids to `[time, batch, output_dim]` features.
    ///
    /// The backward model needs the batch's flattened remap index, which puts
    /// its states back into forward word order.
    pub fn forward(&self, words: &Tensor, remap: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let embedded = self.embed.forward(words)?;
        let out = self.stack.forward(&embedded, train)?;

        match (self.direction, remap) {
            (Direction::Forward, _) => Ok(out),
            (Direction::Backward, Some(remap)) => {
                let (time, batch, width) = out.dims3()?;
                if remap.dims1()? != time * batch {
                    return Err(LmCrfError::ShapeMismatch {
                        context: "backward remap",
                        expected: time * batch,
                        actual: remap.dims1()?,
                    });
                }
                Ok(out
                    .reshape((time * batch, width))?
                    .index_select(remap, 0)?
                    .reshape((time, batch, width))?)
            }
            (Direction::Backward, None) => Err(LmCrfError::InvalidConfig(
                "backward language model needs a remap index".to_string(),
            )),
        }
    }

    pub fn regularizer(&self) -> Result<SparsityPenalty> {
        self.stack.regularizer()
    }

    pub fn prox(&self) -> Result<usize> {
        self.stack.prox()
    }

    /// Prune the layer stack; see [`SparseStack::prune`].
    pub fn prune(&mut self) -> Result<Vec<bool>> {
        self.stack.prune()
    }

    /// Embedding, layer and gate tensors under their checkpoint names.
    pub fn tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = vec![("word_embed.weight".to_string(), self.embed.embeddings().clone())];
        tensors.extend(self.stack.tensors());
        tensors
    }
}
