//! Emission model for LM-augmented CRF tagging.
//!
//! Character LSTMs read each sentence in both directions and are sampled at
//! word boundaries; together with word embeddings and the two sparse
//! language models they feed a hidden layer and a linear emission layer onto
//! the CRF label space.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{Embedding, Init, Linear, VarBuilder, VarMap};
use lmcrf_core::{Batch, Crf, SparseLm, SparsityPenalty};
use tracing::info;

use crate::config::ModelConfig;
use crate::data::Corpus;

/// Character, word and language-model features scored by a CRF.
pub struct SeqLabeler {
    config: ModelConfig,
    varmap: VarMap,
    char_embed: Embedding,
    char_fw: LSTM,
    char_bw: LSTM,
    char_proj: Linear,
    word_embed: Embedding,
    hidden: Linear,
    emission: Linear,
    flm: SparseLm,
    blm: SparseLm,
    crf: Crf,
    device: Device,
}

impl SeqLabeler {
    /// Randomly initialize every trainable layer around two language models.
    pub fn new(
        config: &ModelConfig,
        corpus: &Corpus,
        flm: SparseLm,
        blm: SparseLm,
        device: &Device,
    ) -> anyhow::Result<Self> {
        for (name, lm, vocab) in [("forward", &flm, &corpus.flm), ("backward", &blm, &corpus.blm)] {
            if lm.config().vocab_size != vocab.len() {
                bail!(
                    "{name} language model expects {} words, vocabulary has {}",
                    lm.config().vocab_size,
                    vocab.len()
                );
            }
        }

        let labels = corpus.label_space()?;
        let size = labels.tagset_size();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let char_embed = candle_nn::embedding(corpus.chars.len(), config.char_dim, vb.pp("char_embed"))?;
        let char_fw = lstm(
            config.char_dim,
            config.char_hidden,
            LSTMConfig::default(),
            vb.pp("char_fw"),
        )?;
        let char_bw = lstm(
            config.char_dim,
            config.char_hidden,
            LSTMConfig::default(),
            vb.pp("char_bw"),
        )?;
        let char_proj = candle_nn::linear(2 * config.char_hidden, config.char_hidden, vb.pp("char_proj"))?;
        let word_embed = candle_nn::embedding(corpus.words.len(), config.word_dim, vb.pp("word_embed"))?;

        let features = config.char_hidden + config.word_dim + flm.output_dim() + blm.output_dim();
        let hidden = candle_nn::linear(features, config.word_hidden, vb.pp("hidden"))?;
        let emission = candle_nn::linear(config.word_hidden, size, vb.pp("emission"))?;

        let transitions = vb
            .pp("crf")
            .get_with_hints((size, size), "transitions", Init::Const(0.0))?;
        let crf = Crf::from_transitions(labels, &transitions)?;

        info!(
            features,
            labels = labels.num_labels(),
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "built sequence labeler"
        );

        Ok(Self {
            config: config.clone(),
            varmap,
            char_embed,
            char_fw,
            char_bw,
            char_proj,
            word_embed,
            hidden,
            emission,
            flm,
            blm,
            crf,
            device: device.clone(),
        })
    }

    pub fn crf(&self) -> &Crf {
        &self.crf
    }

    pub fn flm(&self) -> &SparseLm {
        &self.flm
    }

    pub fn blm(&self) -> &SparseLm {
        &self.blm
    }

    /// Input width of the hidden layer.
    pub fn feature_dim(&self) -> usize {
        self.hidden.weight().dims().get(1).copied().unwrap_or(0)
    }

    fn dropout(&self, xs: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        if train && self.config.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(xs, self.config.dropout)?)
        } else {
            Ok(xs.clone())
        }
    }

    /// Run a character LSTM over `[char_rows, batch]` ids and pick the state
    /// at each word boundary: `[word_rows, batch, char_hidden]`.
    fn char_states(
        &self,
        rnn: &LSTM,
        chars: &Tensor,
        boundaries: &Tensor,
        word_rows: usize,
        train: bool,
    ) -> anyhow::Result<Tensor> {
        let embedded = self.dropout(&self.char_embed.forward(chars)?, train)?;
        let states = rnn.seq(&embedded.transpose(0, 1)?.contiguous()?)?;
        let states = rnn.states_to_tensor(&states)?.transpose(0, 1)?.contiguous()?;
        let (rows, batch, hidden) = states.dims3()?;
        Ok(states
            .reshape((rows * batch, hidden))?
            .index_select(boundaries, 0)?
            .reshape((word_rows, batch, hidden))?)
    }

    /// Emission scores `[word_rows, batch, L+2]`.
    pub fn emissions(&self, batch: &Batch, train: bool) -> anyhow::Result<Tensor> {
        let (word_rows, _) = batch.words.dims2()?;

        let fw = self.char_states(&self.char_fw, &batch.fw_chars, &batch.fw_boundaries, word_rows, train)?;
        let bw = self.char_states(&self.char_bw, &batch.bw_chars, &batch.bw_boundaries, word_rows, train)?;
        let chars = self.char_proj.forward(&Tensor::cat(&[&fw, &bw], 2)?)?;

        let words = self.word_embed.forward(&batch.words)?;
        let flm = self.flm.forward(&batch.flm_words, None, train)?;
        let blm = self.blm.forward(&batch.blm_words, Some(&batch.blm_remap), train)?;

        let features = self.dropout(&Tensor::cat(&[&chars, &words, &flm, &blm], 2)?, train)?;
        let hidden = self.dropout(&self.hidden.forward(&features)?.tanh()?, train)?;
        Ok(self.emission.forward(&hidden)?)
    }

    /// Batch-averaged CRF loss.
    pub fn loss(&self, batch: &Batch, train: bool) -> anyhow::Result<Tensor> {
        let emissions = self.emissions(batch, train)?;
        Ok(self.crf.loss(&emissions, &batch.transitions, &batch.mask)?)
    }

    /// Best label ids per instance.
    pub fn decode(&self, batch: &Batch) -> anyhow::Result<Vec<Vec<u32>>> {
        let emissions = self.emissions(batch, false)?;
        Ok(self.crf.decode(&emissions, &batch.mask)?)
    }

    /// Every parameter the optimizer should update.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.varmap.all_vars();
        vars.extend(self.flm.stack().trainable_gates().cloned());
        vars.extend(self.blm.stack().trainable_gates().cloned());
        vars
    }

    /// Sparsity terms of the language models whose gates are trainable.
    pub fn regularizers(&self) -> anyhow::Result<Vec<SparsityPenalty>> {
        let mut penalties = Vec::with_capacity(2);
        for lm in [&self.flm, &self.blm] {
            if lm.stack().trainable_gates().is_some() {
                penalties.push(lm.regularizer()?);
            }
        }
        Ok(penalties)
    }

    /// Clip both gate vectors; returns the non-zero counts.
    pub fn prox(&self) -> anyhow::Result<(usize, usize)> {
        Ok((self.flm.prox()?, self.blm.prox()?))
    }

    /// Prune both language models and drop the hidden-layer inputs that read
    /// removed features. Returns the forward and backward survival masks.
    pub fn prune_language_models(&mut self) -> anyhow::Result<(Vec<bool>, Vec<bool>)> {
        let fixed = self.config.char_hidden + self.config.word_dim;
        let flm_mask = self.flm.prune()?;
        let blm_mask = self.blm.prune()?;

        let keep: Vec<u32> = (0..fixed)
            .chain(
                flm_mask
                    .iter()
                    .chain(&blm_mask)
                    .enumerate()
                    .filter(|(_, alive)| **alive)
                    .map(|(position, _)| fixed + position),
            )
            .map(|position| position as u32)
            .collect();
        let len = keep.len();
        let keep = Tensor::from_vec(keep, len, &self.device)?;

        let weight = Var::from_tensor(&self.hidden.weight().index_select(&keep, 1)?.contiguous()?)?;
        self.varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?
            .insert("hidden.weight".to_string(), weight.clone());
        self.hidden = Linear::new(weight.as_tensor().clone(), self.hidden.bias().cloned());

        info!(
            flm_layers = self.flm.stack().num_layers(),
            blm_layers = self.blm.stack().num_layers(),
            features = self.feature_dim(),
            "pruned language models"
        );
        Ok((flm_mask, blm_mask))
    }

    /// Every trainable and language-model tensor under its checkpoint name.
    pub fn tensors(&self) -> anyhow::Result<HashMap<String, Tensor>> {
        let mut tensors: HashMap<String, Tensor> = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        for (prefix, lm) in [("flm", &self.flm), ("blm", &self.blm)] {
            for (name, tensor) in lm.tensors() {
                tensors.insert(format!("{prefix}.{name}"), tensor);
            }
        }
        Ok(tensors)
    }

    /// Load trainable weights and gate values back from a checkpoint written
    /// by [`save`](Self::save) before any pruning.
    pub fn restore<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;

        {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("parameter store lock poisoned"))?;
            for (name, var) in data.iter() {
                let saved = tensors
                    .get(name)
                    .with_context(|| format!("checkpoint {} is missing {name}", path.display()))?;
                var.set(saved)?;
            }
        }
        for (prefix, lm) in [("flm", &self.flm), ("blm", &self.blm)] {
            if let (Some(gates), Some(saved)) = (lm.stack().gates(), tensors.get(&format!("{prefix}.gates"))) {
                gates.set(saved)?;
            }
        }
        Ok(())
    }

    /// Write a safetensors checkpoint.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        candle_core::safetensors::save(&self.tensors()?, path.as_ref())?;
        Ok(())
    }
}
