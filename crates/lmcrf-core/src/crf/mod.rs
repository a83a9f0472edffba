//! # Linear-Chain CRF
//!
//! The CRF owns a trainable `(L+2) x (L+2)` transition table over the real
//! labels plus a dedicated start label (`L`) and pad/end label (`L+1`).
//! Emissions of shape `[time, batch, L+2]` are combined with the table into a
//! per-step lattice `lattice[t, b, i, j] = emission[t, b, j] + transition[i, j]`
//! that both [`CrfLoss`] and [`CrfDecoder`] consume.

pub mod loss;
pub mod viterbi;

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::dataset::PadTokens;
use crate::error::{LmCrfError, Result};

pub use loss::CrfLoss;
pub use viterbi::CrfDecoder;

/// Real labels plus the synthetic start and pad labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSpace {
    num_labels: usize,
}

impl LabelSpace {
    /// A label space with `num_labels` real labels.
    pub fn new(num_labels: usize) -> Result<Self> {
        if num_labels == 0 {
            return Err(LmCrfError::InvalidConfig(
                "label space needs at least one label".to_string(),
            ));
        }
        Ok(Self { num_labels })
    }

    /// Number of real labels.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Number of CRF tags, start and pad included.
    pub fn tagset_size(&self) -> usize {
        self.num_labels + 2
    }

    /// Index of the start label.
    pub fn start(&self) -> usize {
        self.num_labels
    }

    /// Index of the pad (end) label.
    pub fn pad(&self) -> usize {
        self.num_labels + 1
    }

    /// Check that the dataset's label constants address this label space.
    pub fn check_pads(&self, pads: &PadTokens) -> Result<()> {
        let expected = (self.start(), self.pad(), self.tagset_size());
        let actual = (
            pads.label_start as usize,
            pads.label_pad as usize,
            pads.label_size as usize,
        );
        if expected != actual {
            return Err(LmCrfError::InvalidConfig(format!(
                "label start/pad/size {actual:?} do not match the CRF label space {expected:?}"
            )));
        }
        Ok(())
    }
}

/// Transition table plus the loss and decoder that read it.
#[derive(Debug)]
pub struct Crf {
    labels: LabelSpace,
    transitions: Var,
    loss: CrfLoss,
    decoder: CrfDecoder,
}

impl Crf {
    /// A CRF with an all-zero transition table.
    pub fn new(labels: LabelSpace, device: &Device) -> Result<Self> {
        let size = labels.tagset_size();
        let transitions = Var::zeros((size, size), DType::F32, device)?;
        Ok(Self::with_var(labels, transitions))
    }

    /// A CRF initialized from an existing `(L+2) x (L+2)` table.
    pub fn from_transitions(labels: LabelSpace, transitions: &Tensor) -> Result<Self> {
        let size = labels.tagset_size();
        let (rows, cols) = transitions.dims2()?;
        for actual in [rows, cols] {
            if actual != size {
                return Err(LmCrfError::ShapeMismatch {
                    context: "transition table",
                    expected: size,
                    actual,
                });
            }
        }
        Ok(Self::with_var(labels, Var::from_tensor(transitions)?))
    }

    fn with_var(labels: LabelSpace, transitions: Var) -> Self {
        Self {
            labels,
            transitions,
            loss: CrfLoss::new(labels),
            decoder: CrfDecoder::new(labels),
        }
    }

    /// The label space.
    pub fn labels(&self) -> LabelSpace {
        self.labels
    }

    /// The trainable transition table.
    pub fn transitions(&self) -> &Var {
        &self.transitions
    }

    /// Combine `[time, batch, L+2]` emissions with the transition table into a
    /// `[time, batch, L+2, L+2]` lattice indexed `(prev, next)`.
    pub fn lattice(&self, emissions: &Tensor) -> Result<Tensor> {
        let size = self.labels.tagset_size();
        let (_, _, tags) = emissions.dims3()?;
        if tags != size {
            return Err(LmCrfError::ShapeMismatch {
                context: "emission labels",
                expected: size,
                actual: tags,
            });
        }

        let table = self
            .transitions
            .as_tensor()
            .to_dtype(emissions.dtype())?
            .reshape((1, 1, size, size))?;
        Ok(emissions.unsqueeze(2)?.broadcast_add(&table)?)
    }

    /// Batch-averaged negative log-likelihood of the gold transitions.
    pub fn loss(&self, emissions: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.loss.forward(&self.lattice(emissions)?, targets, mask)
    }

    /// Best label sequence per instance, each as long as its real length.
    pub fn decode(&self, emissions: &Tensor, mask: &Tensor) -> Result<Vec<Vec<u32>>> {
        self.decoder.decode(&self.lattice(emissions)?, mask)
    }
}

/// Numerically stable `log(sum(exp(xs)))` over `dim`, which is removed.
pub fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok((sum + max)?.squeeze(dim)?)
}
