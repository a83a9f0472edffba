//! Model and run configuration, persisted as JSON next to checkpoints.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context};
use lmcrf_core::LmConfig;
use serde::{Deserialize, Serialize};

/// Dimensions of the emission model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Character embedding width.
    pub char_dim: usize,

    /// Hidden size of each character LSTM.
    pub char_hidden: usize,

    /// Word embedding width.
    pub word_dim: usize,

    /// Width of the hidden layer before the emission layer.
    pub word_hidden: usize,

    /// Dropout inside the emission model.
    pub dropout: f32,

    /// Language-model word embedding width.
    pub lm_word_dim: usize,

    /// Features added by each language-model layer.
    pub lm_increment: usize,

    /// Stacked layers per language model.
    pub lm_layers: usize,

    /// Dropout on language-model layer inputs.
    pub lm_dropout: f32,

    /// Keep language-model gates fixed (no sparsity training).
    pub freeze_gates: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            char_dim: 30,
            char_hidden: 150,
            word_dim: 100,
            word_hidden: 300,
            dropout: 0.5,
            lm_word_dim: 300,
            lm_increment: 256,
            lm_layers: 4,
            lm_dropout: 0.5,
            freeze_gates: false,
        }
    }
}

impl ModelConfig {
    /// Language-model shape for a vocabulary of `vocab_size` entries.
    pub fn lm_config(&self, vocab_size: usize) -> LmConfig {
        LmConfig {
            vocab_size,
            word_dim: self.lm_word_dim,
            increment: self.lm_increment,
            num_layers: self.lm_layers,
            dropout: self.lm_dropout,
            frozen_gates: self.freeze_gates,
        }
    }
}

/// Parameter update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    /// Learning rate used when none is configured.
    pub fn default_lr(&self) -> f64 {
        match self {
            OptimizerKind::Sgd => 0.015,
            OptimizerKind::Adam => 0.001,
        }
    }
}

/// Everything a training run needs besides the data paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelConfig,

    pub optimizer: OptimizerKind,

    /// Learning rate; the optimizer default when `None`.
    pub lr: Option<f64>,

    /// SGD decay: `lr / (1 + (epoch + 1) * lr_decay)` after each epoch.
    pub lr_decay: f64,

    /// Global gradient-norm bound.
    pub clip: f64,

    pub batch_size: usize,

    pub epochs: usize,

    /// Epochs without dev improvement before stopping.
    pub patience: usize,

    /// Weight of the L1 gate term.
    pub lambda0: f64,

    /// Weight of the binary gate term.
    pub lambda1: f64,

    /// The L1 term applies only while more gates than this are non-zero.
    pub target_layers: usize,

    /// Prune the language models after training.
    pub prune: bool,

    /// Shuffle seed.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            optimizer: OptimizerKind::Adam,
            lr: None,
            lr_decay: 0.05,
            clip: 5.0,
            batch_size: 10,
            epochs: 200,
            patience: 15,
            lambda0: 0.05,
            lambda1: 2.0,
            target_layers: 2,
            prune: false,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Effective learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.lr.unwrap_or_else(|| self.optimizer.default_lr())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.learning_rate() <= 0.0 {
            bail!("learning rate must be positive, got {}", self.learning_rate());
        }
        if self.clip <= 0.0 {
            bail!("gradient clip must be positive, got {}", self.clip);
        }
        if self.lambda0 < 0.0 || self.lambda1 < 0.0 {
            bail!("sparsity weights must be non-negative");
        }
        for dropout in [self.model.dropout, self.model.lm_dropout] {
            if !(0.0..1.0).contains(&dropout) {
                bail!("dropout must lie in [0, 1), got {dropout}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"optimizer":"sgd","model":{"char_dim":8}}"#).unwrap();
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.learning_rate(), 0.015);
        assert_eq!(config.model.char_dim, 8);
        assert_eq!(config.model.word_dim, 100);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_save_and_load() {
        let config = TrainConfig {
            lr: Some(0.01),
            prune: true,
            ..TrainConfig::default()
        };
        let path = std::env::temp_dir().join(format!("lmcrf-config-{}.json", std::process::id()));
        config.save(&path).unwrap();
        let loaded = TrainConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation() {
        let mut config = TrainConfig::default();
        config.validate().unwrap();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let config = TrainConfig {
            lr: Some(-1.0),
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lm_config() {
        let lm = ModelConfig::default().lm_config(1000);
        assert_eq!(lm.vocab_size, 1000);
        assert_eq!(lm.output_dim(), 300 + 4 * 256);
        lm.validate().unwrap();
    }
}
