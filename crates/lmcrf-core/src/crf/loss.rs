//! # CRF Loss
//!
//! Structured negative log-likelihood computed with the forward algorithm in
//! log space. Everything stays on tensors so gradients reach both the
//! emissions and the transition table.

use candle_core::{DType, IndexOp, Tensor};
use tracing::debug;

use crate::crf::{log_sum_exp, LabelSpace};
use crate::error::{LmCrfError, Result};

/// Forward-algorithm loss over a CRF lattice.
#[derive(Debug, Clone, Copy)]
pub struct CrfLoss {
    tagset: usize,
    start: usize,
    pad: usize,
}

impl CrfLoss {
    /// A loss for `labels`.
    pub fn new(labels: LabelSpace) -> Self {
        Self {
            tagset: labels.tagset_size(),
            start: labels.start(),
            pad: labels.pad(),
        }
    }

    /// Mean over the batch of `log Z - gold path score`.
    ///
    /// * `lattice` - `[time, batch, L+2, L+2]` scores indexed `(prev, next)`
    /// * `targets` - `[time, batch]` gold transitions `prev * (L+2) + next` (`u32`)
    /// * `mask` - `[time, batch]` validity mask (`u8`), one leading run of ones
    ///   per sequence covering every word plus the end transition
    pub fn forward(&self, lattice: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (seq_len, batch, rows, cols) = lattice.dims4()?;
        if seq_len == 0 || batch == 0 {
            return Err(LmCrfError::EmptyBatch);
        }
        for actual in [rows, cols] {
            if actual != self.tagset {
                return Err(LmCrfError::ShapeMismatch {
                    context: "lattice labels",
                    expected: self.tagset,
                    actual,
                });
            }
        }
        for (context, tensor) in [("targets", targets), ("mask", mask)] {
            let (t, b) = tensor.dims2()?;
            if (t, b) != (seq_len, batch) {
                return Err(LmCrfError::ShapeMismatch {
                    context,
                    expected: seq_len * batch,
                    actual: t * b,
                });
            }
        }

        // gold path: pick the target transition at every valid step
        let mask_f = mask.to_dtype(lattice.dtype())?;
        let flat = lattice.reshape((seq_len, batch, self.tagset * self.tagset))?;
        let gold = flat
            .gather(&targets.unsqueeze(2)?.contiguous()?, 2)?
            .squeeze(2)?;
        let gold = (gold * &mask_f)?.sum_all()?;

        // forward algorithm: the accumulator is frozen where the mask is off
        let mut partition = lattice.i(0)?.i((.., self.start))?;
        for t in 1..seq_len {
            let scores = lattice.i(t)?.broadcast_add(&partition.unsqueeze(2)?)?;
            let next = log_sum_exp(&scores, 1)?;
            let keep = mask
                .i(t)?
                .unsqueeze(1)?
                .broadcast_as((batch, self.tagset))?;
            partition = keep.where_cond(&next, &partition)?;
        }
        let log_z = partition.i((.., self.pad))?.sum_all()?;

        let loss = ((log_z - gold)? / batch as f64)?;
        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !value.is_finite() {
            return Err(LmCrfError::NumericalInstability("crf loss"));
        }
        debug!(loss = value, batch, seq_len, "crf loss");

        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Var};

    use super::*;
    use crate::crf::tests::noise;
    use crate::crf::Crf;

    /// Brute-force `log Z - gold` for one sequence of `words` real positions.
    fn brute_force(
        lattice: &[f32],
        batch: usize,
        b: usize,
        tagset: usize,
        gold: &[usize],
        labels: LabelSpace,
    ) -> f64 {
        let at = |t: usize, i: usize, j: usize| {
            lattice[((t * batch + b) * tagset + i) * tagset + j] as f64
        };
        let words = gold.len();
        let path_score = |path: &[usize]| {
            let mut score = at(0, labels.start(), path[0]);
            for t in 1..words {
                score += at(t, path[t - 1], path[t]);
            }
            score + at(words, path[words - 1], labels.pad())
        };

        let mut scores = Vec::new();
        let mut path = vec![0usize; words];
        loop {
            scores.push(path_score(&path));
            let mut k = 0;
            while k < words {
                path[k] += 1;
                if path[k] < tagset {
                    break;
                }
                path[k] = 0;
                k += 1;
            }
            if k == words {
                break;
            }
        }
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let log_z = max + scores.iter().map(|s| (s - max).exp()).sum::<f64>().ln();
        log_z - path_score(gold)
    }

    /// Flattened gold transitions and mask, time-major, for `gold` sequences.
    fn targets(gold: &[Vec<usize>], labels: LabelSpace, rows: usize) -> (Vec<u32>, Vec<u8>) {
        let size = labels.tagset_size();
        let batch = gold.len();
        let mut trans = vec![(labels.pad() * size + labels.pad()) as u32; rows * batch];
        let mut mask = vec![0u8; rows * batch];
        for (b, seq) in gold.iter().enumerate() {
            let mut prev = labels.start();
            for (t, &label) in seq.iter().chain([labels.pad()].iter()).enumerate() {
                trans[t * batch + b] = (prev * size + label) as u32;
                mask[t * batch + b] = 1;
                prev = label;
            }
        }
        (trans, mask)
    }

    fn random_crf(labels: LabelSpace, rng: &mut oorandom::Rand64) -> Crf {
        let size = labels.tagset_size();
        let table = Tensor::from_vec(noise(rng, size * size, 2.0), (size, size), &Device::Cpu)
            .unwrap();
        Crf::from_transitions(labels, &table).unwrap()
    }

    #[test]
    fn test_loss_matches_enumeration() {
        let labels = LabelSpace::new(2).unwrap();
        let size = labels.tagset_size();
        let mut rng = oorandom::Rand64::new(11);
        let crf = random_crf(labels, &mut rng);

        let gold = vec![vec![0usize, 1, 1]];
        let rows = 4;
        let emissions = Tensor::from_vec(noise(&mut rng, rows * size, 3.0), (rows, 1, size), &Device::Cpu)
            .unwrap();
        let (trans, mask) = targets(&gold, labels, rows);
        let trans = Tensor::from_vec(trans, (rows, 1), &Device::Cpu).unwrap();
        let mask = Tensor::from_vec(mask, (rows, 1), &Device::Cpu).unwrap();

        let loss = crf.loss(&emissions, &trans, &mask).unwrap();
        let loss = loss.to_scalar::<f32>().unwrap() as f64;

        let lattice = crf.lattice(&emissions).unwrap();
        let lattice = lattice.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = brute_force(&lattice, 1, 0, size, &gold[0], labels);
        assert!((loss - expected).abs() < 1e-3, "{loss} vs {expected}");
    }

    #[test]
    fn test_masked_batch_is_mean_of_sequences() {
        let labels = LabelSpace::new(3).unwrap();
        let size = labels.tagset_size();
        let mut rng = oorandom::Rand64::new(5);
        let crf = random_crf(labels, &mut rng);

        let gold = vec![vec![2usize, 0, 1], vec![1usize]];
        let rows = 4;
        let emissions = Tensor::from_vec(
            noise(&mut rng, rows * 2 * size, 3.0),
            (rows, 2, size),
            &Device::Cpu,
        )
        .unwrap();
        let (trans, mask) = targets(&gold, labels, rows);
        let trans = Tensor::from_vec(trans, (rows, 2), &Device::Cpu).unwrap();
        let mask = Tensor::from_vec(mask, (rows, 2), &Device::Cpu).unwrap();

        let loss = crf.loss(&emissions, &trans, &mask).unwrap();
        let loss = loss.to_scalar::<f32>().unwrap() as f64;

        let lattice = crf.lattice(&emissions).unwrap();
        let lattice = lattice.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = (brute_force(&lattice, 2, 0, size, &gold[0], labels)
            + brute_force(&lattice, 2, 1, size, &gold[1], labels))
            / 2.0;
        assert!((loss - expected).abs() < 1e-3, "{loss} vs {expected}");
    }

    #[test]
    fn test_loss_is_non_negative() {
        let labels = LabelSpace::new(4).unwrap();
        let size = labels.tagset_size();
        let mut rng = oorandom::Rand64::new(99);

        for _ in 0..20 {
            let crf = random_crf(labels, &mut rng);
            let batch = rng.rand_range(1..5) as usize;
            let gold: Vec<Vec<usize>> = (0..batch)
                .map(|_| {
                    let n = rng.rand_range(1..7) as usize;
                    (0..n).map(|_| rng.rand_range(0..4) as usize).collect()
                })
                .collect();
            let rows = gold.iter().map(Vec::len).max().unwrap() + 1;
            let emissions = Tensor::from_vec(
                noise(&mut rng, rows * batch * size, 5.0),
                (rows, batch, size),
                &Device::Cpu,
            )
            .unwrap();
            let (trans, mask) = targets(&gold, labels, rows);
            let trans = Tensor::from_vec(trans, (rows, batch), &Device::Cpu).unwrap();
            let mask = Tensor::from_vec(mask, (rows, batch), &Device::Cpu).unwrap();

            let loss = crf.loss(&emissions, &trans, &mask).unwrap();
            assert!(loss.to_scalar::<f32>().unwrap() >= -1e-4);
        }
    }

    #[test]
    fn test_gradients_reach_transitions_and_emissions() {
        let labels = LabelSpace::new(2).unwrap();
        let size = labels.tagset_size();
        let crf = Crf::new(labels, &Device::Cpu).unwrap();

        let emissions = Var::from_tensor(
            &Tensor::from_vec(vec![0.5f32; 3 * size], (3, 1, size), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let (trans, mask) = targets(&[vec![0, 1]], labels, 3);
        let trans = Tensor::from_vec(trans, (3, 1), &Device::Cpu).unwrap();
        let mask = Tensor::from_vec(mask, (3, 1), &Device::Cpu).unwrap();

        let loss = crf.loss(emissions.as_tensor(), &trans, &mask).unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(crf.transitions().as_tensor()).is_some());
        assert!(grads.get(emissions.as_tensor()).is_some());
    }

    #[test]
    fn test_non_finite_emissions_are_reported() {
        let labels = LabelSpace::new(2).unwrap();
        let size = labels.tagset_size();
        let crf = Crf::new(labels, &Device::Cpu).unwrap();

        let mut scores = vec![0.5f32; 3 * size];
        scores[size + 1] = f32::NAN;
        let emissions = Tensor::from_vec(scores, (3, 1, size), &Device::Cpu).unwrap();
        let (trans, mask) = targets(&[vec![0, 1]], labels, 3);
        let trans = Tensor::from_vec(trans, (3, 1), &Device::Cpu).unwrap();
        let mask = Tensor::from_vec(mask, (3, 1), &Device::Cpu).unwrap();

        assert!(matches!(
            crf.loss(&emissions, &trans, &mask),
            Err(LmCrfError::NumericalInstability("crf loss"))
        ));

        let overflow = Tensor::from_vec(vec![f32::MAX; 3 * size], (3, 1, size), &Device::Cpu).unwrap();
        assert!(matches!(
            crf.loss(&overflow, &trans, &mask),
            Err(LmCrfError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_targets() {
        let labels = LabelSpace::new(2).unwrap();
        let crf = Crf::new(labels, &Device::Cpu).unwrap();
        let emissions = Tensor::zeros((3, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let trans = Tensor::zeros((3, 1), DType::U32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((3, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            crf.loss(&emissions, &trans, &mask),
            Err(LmCrfError::ShapeMismatch { context: "targets", .. })
        ));
    }
}
