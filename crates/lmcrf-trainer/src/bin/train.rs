//! Train an LM-augmented CRF tagger on CoNLL data.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use lmcrf_trainer::{run_training, DataPaths, OptimizerKind, TrainConfig};
use tracing::info;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a sequence labeler with sparse language-model features")]
#[command(version)]
struct Cli {
    /// Training corpus (CoNLL)
    #[arg(long)]
    train: PathBuf,

    /// Development corpus
    #[arg(long)]
    dev: PathBuf,

    /// Test corpus
    #[arg(long)]
    test: PathBuf,

    /// Forward language model weights (safetensors)
    #[arg(long)]
    forward_lm: Option<PathBuf>,

    /// Backward language model weights (safetensors)
    #[arg(long)]
    backward_lm: Option<PathBuf>,

    /// Forward language model vocabulary (JSON list)
    #[arg(long)]
    forward_vocab: Option<PathBuf>,

    /// Backward language model vocabulary (JSON list)
    #[arg(long)]
    backward_vocab: Option<PathBuf>,

    /// JSON config; flags below override it
    #[arg(short, long, env = "LMCRF_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(short, long, env = "LMCRF_OUTPUT", default_value = "checkpoint")]
    output: PathBuf,

    #[arg(long, value_enum)]
    optimizer: Option<OptimizerKind>,

    #[arg(long)]
    lr: Option<f64>,

    /// SGD learning-rate decay per epoch
    #[arg(long)]
    lr_decay: Option<f64>,

    /// Global gradient-norm bound
    #[arg(long)]
    clip: Option<f64>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    patience: Option<usize>,

    #[arg(long)]
    char_dim: Option<usize>,

    #[arg(long)]
    char_hidden: Option<usize>,

    #[arg(long)]
    word_dim: Option<usize>,

    #[arg(long)]
    word_hidden: Option<usize>,

    /// Word embedding width of randomly initialized language models
    #[arg(long)]
    lm_word_dim: Option<usize>,

    /// Features each language-model layer adds
    #[arg(long)]
    lm_increment: Option<usize>,

    /// Layers per language model
    #[arg(long)]
    lm_layers: Option<usize>,

    /// Dropout inside the emission model
    #[arg(long)]
    dropout: Option<f32>,

    /// Dropout on language-model layer inputs
    #[arg(long)]
    lm_dropout: Option<f32>,

    /// Weight of the L1 gate term
    #[arg(long)]
    lambda0: Option<f64>,

    /// Weight of the binary gate term
    #[arg(long)]
    lambda1: Option<f64>,

    /// Stop the L1 term once this many layers remain
    #[arg(long)]
    target_layers: Option<usize>,

    /// Keep language-model gates fixed
    #[arg(long)]
    freeze_gates: bool,

    /// Prune the language models after training
    #[arg(long)]
    prune: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Train on CPU even when a GPU is available
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn train_config(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };

        if let Some(optimizer) = self.optimizer {
            if optimizer != config.optimizer && self.lr.is_none() {
                config.lr = None;
            }
            config.optimizer = optimizer;
        }
        if let Some(lr) = self.lr {
            config.lr = Some(lr);
        }
        if let Some(lr_decay) = self.lr_decay {
            config.lr_decay = lr_decay;
        }
        if let Some(clip) = self.clip {
            config.clip = clip;
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(patience) = self.patience {
            config.patience = patience;
        }
        if let Some(lambda0) = self.lambda0 {
            config.lambda0 = lambda0;
        }
        if let Some(lambda1) = self.lambda1 {
            config.lambda1 = lambda1;
        }
        if let Some(target_layers) = self.target_layers {
            config.target_layers = target_layers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        let model = &mut config.model;
        if let Some(char_dim) = self.char_dim {
            model.char_dim = char_dim;
        }
        if let Some(char_hidden) = self.char_hidden {
            model.char_hidden = char_hidden;
        }
        if let Some(word_dim) = self.word_dim {
            model.word_dim = word_dim;
        }
        if let Some(word_hidden) = self.word_hidden {
            model.word_hidden = word_hidden;
        }
        if let Some(lm_word_dim) = self.lm_word_dim {
            model.lm_word_dim = lm_word_dim;
        }
        if let Some(lm_increment) = self.lm_increment {
            model.lm_increment = lm_increment;
        }
        if let Some(lm_layers) = self.lm_layers {
            model.lm_layers = lm_layers;
        }
        if let Some(dropout) = self.dropout {
            model.dropout = dropout;
        }
        if let Some(lm_dropout) = self.lm_dropout {
            model.lm_dropout = lm_dropout;
        }
        model.freeze_gates |= self.freeze_gates;
        config.prune |= self.prune;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = cli.train_config()?;
    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0).context("selecting device")?
    };
    info!(?device, "using device");

    let paths = DataPaths {
        train: cli.train,
        dev: cli.dev,
        test: cli.test,
        forward_lm: cli.forward_lm,
        backward_lm: cli.backward_lm,
        forward_vocab: cli.forward_vocab,
        backward_vocab: cli.backward_vocab,
        output_dir: cli.output,
    };
    let output_dir = paths.output_dir.clone();

    let report = run_training(config, &paths, &device)?;
    let report_path = output_dir.join("report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("writing {}", report_path.display()))?;

    info!(
        "Done after {} epochs: dev F1 {:.2}%, test F1 {:.2}%",
        report.epochs,
        report.best_dev.f1 * 100.0,
        report.test.f1 * 100.0
    );
    Ok(())
}
