//! # Viterbi Decoding for CRF
//!
//! Finds the highest-scoring label sequence per instance over a CRF lattice.
//! Each path begins at the start label, ends at the pad label on the
//! instance's last valid step, and is recovered through backpointers.

use candle_core::{DType, Tensor};

use crate::crf::LabelSpace;
use crate::error::{LmCrfError, Result};

/// Viterbi decoder over `[time, batch, L+2, L+2]` lattices.
#[derive(Debug, Clone, Copy)]
pub struct CrfDecoder {
    tagset: usize,
    start: usize,
    pad: usize,
}

/// Path score and backpointer for one label at one step.
#[derive(Debug, Clone, Copy)]
struct PathState {
    score: f32,
    prev_tag: usize,
}

impl CrfDecoder {
    /// A decoder for `labels`.
    pub fn new(labels: LabelSpace) -> Self {
        Self {
            tagset: labels.tagset_size(),
            start: labels.start(),
            pad: labels.pad(),
        }
    }

    /// Decode every instance of a batch.
    ///
    /// # Arguments
    /// * `lattice` - `[time, batch, L+2, L+2]` scores indexed `(prev, next)`
    /// * `mask` - `[time, batch]` validity mask (`u8`)
    ///
    /// # Returns
    /// One label sequence per instance, one label fewer than its mask count.
    pub fn decode(&self, lattice: &Tensor, mask: &Tensor) -> Result<Vec<Vec<u32>>> {
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
        let mask = mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
        if mask.len() != seq_len || mask.iter().any(|row| row.len() != batch) {
            return Err(LmCrfError::ShapeMismatch {
                context: "mask",
                expected: seq_len * batch,
                actual: mask.iter().map(Vec::len).sum(),
            });
        }

        let scores = lattice
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let step = self.tagset * self.tagset;

        (0..batch)
            .map(|b| {
                let steps = mask.iter().take_while(|row| row[b] != 0).count();
                if steps < 2 {
                    return Err(LmCrfError::EmptySequence(b));
                }
                let rows: Vec<&[f32]> = (0..steps)
                    .map(|t| {
                        let offset = (t * batch + b) * step;
                        &scores[offset..offset + step]
                    })
                    .collect();
                self.decode_instance(&rows)
            })
            .collect()
    }

    /// Decode one instance from its valid lattice steps, each a row-major
    /// `(L+2) x (L+2)` slice. The last step must be the end transition.
    pub fn decode_instance(&self, steps: &[&[f32]]) -> Result<Vec<u32>> {
        let Some((first, rest)) = steps.split_first() else {
            return Err(LmCrfError::EmptySequence(0));
        };
        if steps.iter().any(|s| s.iter().any(|v| !v.is_finite())) {
            return Err(LmCrfError::NumericalInstability("viterbi lattice"));
        }

        let row = self.start * self.tagset;
        let mut current: Vec<f32> = first[row..row + self.tagset].to_vec();
        let mut backptr: Vec<Vec<usize>> = Vec::with_capacity(rest.len());

        for lattice in rest {
            let mut next = vec![
                PathState {
                    score: f32::NEG_INFINITY,
                    prev_tag: 0,
                };
                self.tagset
            ];
            for (prev_tag, &prev_score) in current.iter().enumerate() {
                let row = &lattice[prev_tag * self.tagset..(prev_tag + 1) * self.tagset];
                for (state, &transition) in next.iter_mut().zip(row) {
                    let score = prev_score + transition;
                    // strict comparison keeps the first maximum
                    if score > state.score {
                        *state = PathState { score, prev_tag };
                    }
                }
            }
            current = next.iter().map(|state| state.score).collect();
            backptr.push(next.into_iter().map(|state| state.prev_tag).collect());
        }

        if !current[self.pad].is_finite() {
            return Err(LmCrfError::NumericalInstability("viterbi path score"));
        }

        // backtrack from the forced end at pad
        let mut path = Vec::with_capacity(backptr.len());
        let mut curr_tag = self.pad;
        for pointers in backptr.iter().rev() {
            curr_tag = pointers[curr_tag];
            path.push(curr_tag as u32);
        }
        path.reverse();
        Ok(path)
    }
}
