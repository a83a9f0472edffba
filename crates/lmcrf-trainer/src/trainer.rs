//! Training loop for the LM-augmented CRF tagger.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use lmcrf_core::{Batch, Batcher, Direction, SeqDataset, SparseLm};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{OptimizerKind, TrainConfig};
use crate::data::{load_conll, Corpus, Sentence, Vocab};
use crate::eval::{ChunkScore, Metrics};
use crate::model::SeqLabeler;

/// Checkpoint of the best dev-scoring model.
pub const BEST_CHECKPOINT: &str = "model.safetensors";
/// Checkpoint written after pruning.
pub const PRUNED_CHECKPOINT: &str = "model.pruned.safetensors";

/// Input files of a training run.
#[derive(Debug, Clone, Default)]
pub struct DataPaths {
    pub train: PathBuf,
    pub dev: PathBuf,
    pub test: PathBuf,
    pub forward_lm: Option<PathBuf>,
    pub backward_lm: Option<PathBuf>,
    pub forward_vocab: Option<PathBuf>,
    pub backward_vocab: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainReport {
    pub epochs: usize,
    pub best_dev: Metrics,
    pub test: Metrics,
    pub pruned_dev: Option<Metrics>,
    pub pruned_test: Option<Metrics>,
}

/// SGD or Adam behind one interface.
pub enum Updater {
    Sgd(SGD),
    Adam(AdamW),
}

impl Updater {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> anyhow::Result<Self> {
        Ok(match kind {
            OptimizerKind::Sgd => Updater::Sgd(SGD::new(vars, lr)?),
            OptimizerKind::Adam => Updater::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> anyhow::Result<()> {
        match self {
            Updater::Sgd(opt) => opt.step(grads)?,
            Updater::Adam(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Updater::Sgd(opt) => opt.learning_rate(),
            Updater::Adam(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Updater::Sgd(opt) => opt.set_learning_rate(lr),
            Updater::Adam(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Rescale the gradients of `vars` so their joint L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(var, scaled);
        }
    }
    Ok(norm)
}

/// Decode every batch of `data` and score it against the gold labels.
pub fn evaluate(model: &SeqLabeler, corpus: &Corpus, data: &mut SeqDataset) -> anyhow::Result<Metrics> {
    let mut score = ChunkScore::default();
    for batch in &mut *data {
        let batch = batch?;
        let predicted = model.decode(&batch)?;
        for (gold, predicted) in batch.labels.iter().zip(&predicted) {
            score.update(&corpus.label_names(gold), &corpus.label_names(predicted));
        }
    }
    Ok(score.metrics())
}

pub struct Trainer {
    config: TrainConfig,
    corpus: Corpus,
    model: SeqLabeler,
    updater: Updater,
    output_dir: PathBuf,
}

impl Trainer {
    /// Prepare a run writing into `output_dir`; the config and vocabularies
    /// are saved there immediately.
    pub fn new(
        config: TrainConfig,
        corpus: Corpus,
        model: SeqLabeler,
        output_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;
        config.save(output_dir.join("config.json"))?;
        corpus.save(output_dir.join("vocab.json"))?;

        let updater = Updater::new(config.optimizer, model.trainable_vars(), config.learning_rate())?;
        Ok(Self {
            config,
            corpus,
            model,
            updater,
            output_dir,
        })
    }

    pub fn model(&self) -> &SeqLabeler {
        &self.model
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// One optimizer step on `batch`; returns the CRF loss.
    fn step(&mut self, batch: &Batch) -> anyhow::Result<f32> {
        let loss = self.model.loss(batch, true)?;
        let mut objective = loss.clone();
        for penalty in self.model.regularizers()? {
            if self.config.lambda0 > 0.0 && penalty.nonzero > self.config.target_layers {
                objective = (objective + (penalty.l1 * self.config.lambda0)?)?;
            }
            if self.config.lambda1 > 0.0 {
                objective = (objective + (penalty.binary * self.config.lambda1)?)?;
            }
        }

        let vars = self.model.trainable_vars();
        let mut grads = objective.backward()?;
        let norm = clip_grad_norm(&vars, &mut grads, self.config.clip)?;
        self.updater.step(&grads)?;
        let (flm, blm) = self.model.prox()?;
        debug!(norm, flm, blm, "step");

        Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    fn train_epoch(&mut self, data: &mut SeqDataset) -> anyhow::Result<f64> {
        let mut total = 0f64;
        let mut steps = 0usize;
        for batch in &mut *data {
            let loss = self.step(&batch?)?;
            total += f64::from(loss);
            steps += 1;
        }
        Ok(if steps == 0 { 0.0 } else { total / steps as f64 })
    }

    fn gate_summary(&self) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
        Ok((
            self.model.flm().stack().gate_values()?,
            self.model.blm().stack().gate_values()?,
        ))
    }

    /// Train with early stopping on dev F1, checkpointing the best model.
    /// The best weights are loaded back once training stops; with pruning
    /// enabled they are then pruned, evaluated and saved too.
    pub fn fit(
        &mut self,
        train: &mut SeqDataset,
        dev: &mut SeqDataset,
        test: &mut SeqDataset,
    ) -> anyhow::Result<TrainReport> {
        info!(
            train = train.len(),
            dev = dev.len(),
            test = test.len(),
            optimizer = ?self.config.optimizer,
            lr = self.updater.learning_rate(),
            "starting training"
        );

        let base_lr = self.config.learning_rate();
        let mut report = TrainReport::default();
        let mut best_f1 = f64::NEG_INFINITY;
        let mut stale = 0usize;

        for epoch in 0..self.config.epochs {
            let loss = self.train_epoch(train)?;
            report.epochs = epoch + 1;

            if self.config.optimizer == OptimizerKind::Sgd {
                let lr = base_lr / (1.0 + (epoch + 1) as f64 * self.config.lr_decay);
                self.updater.set_learning_rate(lr);
            }

            let dev_metrics = evaluate(&self.model, &self.corpus, dev)?;
            let (flm_gates, blm_gates) = self.gate_summary()?;
            info!(
                "Epoch {}/{}, loss {:.4}, dev F1 {:.2}%, accuracy {:.2}%, gates {:?} / {:?}",
                epoch + 1,
                self.config.epochs,
                loss,
                dev_metrics.f1 * 100.0,
                dev_metrics.accuracy * 100.0,
                flm_gates,
                blm_gates
            );

            if dev_metrics.f1 > best_f1 {
                best_f1 = dev_metrics.f1;
                stale = 0;
                report.best_dev = dev_metrics;
                report.test = evaluate(&self.model, &self.corpus, test)?;
                self.model.save(self.output_dir.join(BEST_CHECKPOINT))?;
                info!(
                    "New best: dev F1 {:.2}%, test F1 {:.2}%",
                    dev_metrics.f1 * 100.0,
                    report.test.f1 * 100.0
                );
            } else {
                stale += 1;
                if stale >= self.config.patience {
                    info!(epoch = epoch + 1, "no dev improvement for {stale} epochs, stopping");
                    break;
                }
            }
        }

        if best_f1.is_finite() {
            self.model.restore(self.output_dir.join(BEST_CHECKPOINT))?;
            debug!(best_f1, "restored best checkpoint");
        }

        if self.config.prune {
            self.model.prune_language_models()?;
            let dev_metrics = evaluate(&self.model, &self.corpus, dev)?;
            let test_metrics = evaluate(&self.model, &self.corpus, test)?;
            self.model.save(self.output_dir.join(PRUNED_CHECKPOINT))?;
            info!(
                "Pruned model: {} forward / {} backward layers, dev F1 {:.2}%, test F1 {:.2}%",
                self.model.flm().stack().num_layers(),
                self.model.blm().stack().num_layers(),
                dev_metrics.f1 * 100.0,
                test_metrics.f1 * 100.0
            );
            report.pruned_dev = Some(dev_metrics);
            report.pruned_test = Some(test_metrics);
        }

        Ok(report)
    }
}

fn load_split(path: &Path, name: &str) -> anyhow::Result<Vec<Sentence>> {
    let sentences = load_conll(path)?;
    info!("Loaded {} {name} sentences", sentences.len());
    Ok(sentences)
}

/// Load data and language models, build the model and run [`Trainer::fit`].
pub fn run_training(config: TrainConfig, paths: &DataPaths, device: &Device) -> anyhow::Result<TrainReport> {
    config.validate()?;

    let train = load_split(&paths.train, "training")?;
    let dev = load_split(&paths.dev, "dev")?;
    let test = load_split(&paths.test, "test")?;

    let forward_vocab = paths.forward_vocab.as_ref().map(Vocab::load).transpose()?;
    let backward_vocab = paths.backward_vocab.as_ref().map(Vocab::load).transpose()?;
    let corpus = Corpus::build(&train, forward_vocab, backward_vocab)?;
    info!(
        words = corpus.words.len(),
        chars = corpus.chars.len(),
        labels = corpus.labels.len(),
        "built vocabularies"
    );

    let flm = SparseLm::load(
        config.model.lm_config(corpus.flm.len()),
        Direction::Forward,
        paths.forward_lm.as_deref(),
        device,
    )?;
    let blm = SparseLm::load(
        config.model.lm_config(corpus.blm.len()),
        Direction::Backward,
        paths.backward_lm.as_deref(),
        device,
    )?;
    let model = SeqLabeler::new(&config.model, &corpus, flm, blm, device)?;

    let batcher = Batcher::new(corpus.pads()?, device.clone())?;
    let dataset = |sentences: &[Sentence], seed: u64| -> anyhow::Result<SeqDataset> {
        Ok(SeqDataset::new(
            corpus.encode_all(sentences)?,
            batcher.clone(),
            config.batch_size,
            seed,
        )?)
    };
    let mut train = dataset(&train, config.seed)?;
    let mut dev = dataset(&dev, config.seed.wrapping_add(1))?;
    let mut test = dataset(&test, config.seed.wrapping_add(2))?;

    let output_dir = paths.output_dir.clone();
    let mut trainer = Trainer::new(config, corpus, model, output_dir)?;
    trainer.fit(&mut train, &mut dev, &mut test)
}
