//! # Batch Assembly
//!
//! Packs a list of variable-length instances into padded, time-major tensors
//! plus flattened gather indices that realign character-level, word-level and
//! language-model-level representations.
//!
//! Every flattened index follows the `position * batch_size + instance`
//! convention, so it addresses a `(time, batch)` tensor viewed as one column
//! of `time * batch_size` rows.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::instance::PackedInstance;
use crate::error::{LmCrfError, Result};

/// Padding and special token ids supplied by the dataset collaborator.
///
/// Pad values must be reserved ids that never occur in real data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadTokens {
    /// Pad id of the forward language-model vocabulary.
    pub flm_pad: u32,

    /// Pad id of the backward language-model vocabulary.
    pub blm_pad: u32,

    /// Pad id of the generic word vocabulary.
    pub word_pad: u32,

    /// Character id inserted after every word.
    pub char_separator: u32,

    /// Pad id of the character vocabulary.
    pub char_pad: u32,

    /// Synthetic start label.
    pub label_start: u32,

    /// Pad (end) label.
    pub label_pad: u32,

    /// Size of the label space, start and pad included.
    pub label_size: u32,
}

impl PadTokens {
    /// The start and pad labels must be the last two entries of the label space.
    pub fn validate(&self) -> Result<()> {
        if self.label_size < 3
            || self.label_start != self.label_size - 2
            || self.label_pad != self.label_size - 1
        {
            return Err(LmCrfError::InvalidConfig(format!(
                "label start/pad must be {}/{} for a label space of {}, got {}/{}",
                self.label_size.saturating_sub(2),
                self.label_size.saturating_sub(1),
                self.label_size,
                self.label_start,
                self.label_pad
            )));
        }
        Ok(())
    }

    fn transition(&self, prev: u32, next: u32) -> u32 {
        prev * self.label_size + next
    }
}

/// Host-side batch layout, every 2-D array stored time-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchIndices {
    /// Number of instances in the batch.
    pub batch_size: usize,

    /// Rows of the character arrays (`max chars + 1`).
    pub char_rows: usize,

    /// Rows of the word-level arrays (`max words + 1`).
    pub word_rows: usize,

    /// Forward characters, `char_rows * batch_size`.
    pub fw_chars: Vec<u32>,

    /// Index of each word's last forward character state, `word_rows * batch_size`.
    pub fw_boundaries: Vec<u32>,

    /// Reversed characters behind one leading pad, `char_rows * batch_size`.
    pub bw_chars: Vec<u32>,

    /// Index of each word's last backward character state, `word_rows * batch_size`.
    pub bw_boundaries: Vec<u32>,

    /// Forward language-model words, `word_rows * batch_size`.
    pub flm_words: Vec<u32>,

    /// Reversed backward language-model words behind one leading pad.
    pub blm_words: Vec<u32>,

    /// Maps backward language-model states back into forward word order.
    pub blm_remap: Vec<u32>,

    /// Generic words, `word_rows * batch_size`.
    pub words: Vec<u32>,

    /// Gold transitions `prev * label_size + next`, `word_rows * batch_size`.
    pub transitions: Vec<u32>,

    /// 1 for every real label position plus the end position, else 0.
    pub mask: Vec<u8>,

    /// Unpadded gold labels per instance.
    pub labels: Vec<Vec<u32>>,
}

/// A batch on the compute device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Forward characters: `[char_rows, batch]`.
    pub fw_chars: Tensor,

    /// Forward boundary gather index: `[word_rows * batch]`.
    pub fw_boundaries: Tensor,

    /// Backward characters: `[char_rows, batch]`.
    pub bw_chars: Tensor,

    /// Backward boundary gather index: `[word_rows * batch]`.
    pub bw_boundaries: Tensor,

    /// Forward language-model words: `[word_rows, batch]`.
    pub flm_words: Tensor,

    /// Backward language-model words: `[word_rows, batch]`.
    pub blm_words: Tensor,

    /// Backward language-model remap index: `[word_rows * batch]`.
    pub blm_remap: Tensor,

    /// Generic words: `[word_rows, batch]`.
    pub words: Tensor,

    /// Gold flattened transitions: `[word_rows, batch]`.
    pub transitions: Tensor,

    /// Validity mask (`u8`): `[word_rows, batch]`.
    pub mask: Tensor,

    /// Unpadded gold labels per instance.
    pub labels: Vec<Vec<u32>>,
}

impl Batch {
    /// Number of instances in the batch.
    pub fn batch_size(&self) -> usize {
        self.labels.len()
    }
}

impl BatchIndices {
    /// Move every array onto `device` as `u32` (mask as `u8`) tensors.
    pub fn to_tensors(self, device: &Device) -> Result<Batch> {
        let b = self.batch_size;
        let chars = (self.char_rows, b);
        let words = (self.word_rows, b);
        let flat = self.word_rows * b;

        Ok(Batch {
            fw_chars: Tensor::from_vec(self.fw_chars, chars, device)?,
            fw_boundaries: Tensor::from_vec(self.fw_boundaries, flat, device)?,
            bw_chars: Tensor::from_vec(self.bw_chars, chars, device)?,
            bw_boundaries: Tensor::from_vec(self.bw_boundaries, flat, device)?,
            flm_words: Tensor::from_vec(self.flm_words, words, device)?,
            blm_words: Tensor::from_vec(self.blm_words, words, device)?,
            blm_remap: Tensor::from_vec(self.blm_remap, flat, device)?,
            words: Tensor::from_vec(self.words, words, device)?,
            transitions: Tensor::from_vec(self.transitions, words, device)?,
            mask: Tensor::from_vec(self.mask, words, device)?,
            labels: self.labels,
        })
    }
}

/// Assembles batches from packed instances.
#[derive(Debug, Clone)]
pub struct Batcher {
    pads: PadTokens,
    device: Device,
}

impl Batcher {
    /// Create a batcher producing tensors on `device`.
    pub fn new(pads: PadTokens, device: Device) -> Result<Self> {
        pads.validate()?;
        Ok(Self { pads, device })
    }

    /// The padding configuration.
    pub fn pads(&self) -> &PadTokens {
        &self.pads
    }

    /// The target device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Assemble a device batch.
    pub fn batch(&self, instances: &[&PackedInstance]) -> Result<Batch> {
        self.assemble(instances)?.to_tensors(&self.device)
    }

    /// Build the host-side layout for `instances`.
    pub fn assemble(&self, instances: &[&PackedInstance]) -> Result<BatchIndices> {
        if instances.is_empty() {
            return Err(LmCrfError::EmptyBatch);
        }
        for (position, instance) in instances.iter().enumerate() {
            instance.validate(position)?;
        }

        let pads = &self.pads;
        let batch_size = instances.len();
        let char_padded = instances.iter().map(|i| i.chars.len()).max().unwrap_or(0);
        let word_padded = instances.iter().map(|i| i.len()).max().unwrap_or(0);
        let char_rows = char_padded + 1;
        let word_rows = word_padded + 1;
        let char_bound = char_rows * batch_size;
        let word_bound = word_rows * batch_size;

        let mut rows = Rows::new(batch_size);

        for (offset, instance) in instances.iter().enumerate() {
            let n = instance.len();
            let word_deficit = word_padded - n;

            // characters
            let mut fw = instance.chars.clone();
            fw.resize(char_rows, pads.char_pad);
            rows.fw_chars.push(fw);

            let mut bw = Vec::with_capacity(char_rows);
            bw.push(pads.char_pad);
            bw.extend(instance.chars.iter().rev());
            bw.resize(char_rows, pads.char_pad);
            rows.bw_chars.push(bw);

            // forward boundaries: running sum of (len + 1), the end slot and
            // the padded tail all point at the trailing character pad
            let mut fw_bound = Vec::with_capacity(word_rows);
            let mut acc = 0usize;
            for step in instance.char_lens.iter().copied().chain([1]) {
                acc += step;
                fw_bound.push(flat_index(acc - 1, batch_size, offset, char_bound, "forward boundary")?);
            }
            for _ in 0..word_deficit {
                fw_bound.push(flat_index(acc - 1, batch_size, offset, char_bound, "forward boundary")?);
            }
            rows.fw_boundaries.push(fw_bound);

            // backward boundaries: running sum over the reversed lengths behind
            // the leading pad, read back in forward word order
            let mut acc = 1usize;
            let mut bw_sums = Vec::with_capacity(n + 1);
            bw_sums.push(acc);
            for step in instance.char_lens.iter().rev() {
                acc += step;
                bw_sums.push(acc);
            }
            let mut bw_bound = Vec::with_capacity(word_rows);
            for sum in bw_sums.into_iter().rev() {
                bw_bound.push(flat_index(sum - 1, batch_size, offset, char_bound, "backward boundary")?);
            }
            for _ in 0..word_deficit {
                bw_bound.push(flat_index(0, batch_size, offset, char_bound, "backward boundary")?);
            }
            rows.bw_boundaries.push(bw_bound);

            // language-model and generic words
            let mut flm = instance.flm_words.clone();
            flm.resize(word_rows, pads.flm_pad);
            rows.flm_words.push(flm);

            let mut blm = Vec::with_capacity(word_rows);
            blm.push(pads.blm_pad);
            blm.extend(instance.blm_words.iter().rev());
            blm.resize(word_rows, pads.blm_pad);
            rows.blm_words.push(blm);

            let mut remap = Vec::with_capacity(word_rows);
            for position in (0..=n).rev().chain(n + 1..word_rows) {
                remap.push(flat_index(position, batch_size, offset, word_bound, "backward lm remap")?);
            }
            rows.blm_remap.push(remap);

            let mut words = instance.words.clone();
            words.resize(word_rows, pads.word_pad);
            rows.words.push(words);

            // gold transitions and mask
            let labels = &instance.labels;
            let mut transitions = Vec::with_capacity(word_rows);
            transitions.push(pads.transition(pads.label_start, labels[0]));
            transitions.extend(labels.windows(2).map(|pair| pads.transition(pair[0], pair[1])));
            transitions.push(pads.transition(labels[n - 1], pads.label_pad));
            transitions.resize(word_rows, pads.transition(pads.label_pad, pads.label_pad));
            rows.transitions.push(transitions);

            let mut mask = vec![1u8; n + 1];
            mask.resize(word_rows, 0);
            rows.mask.push(mask);

            rows.labels.push(labels.clone());
        }

        debug!(batch_size, char_rows, word_rows, "assembled batch");

        Ok(BatchIndices {
            batch_size,
            char_rows,
            word_rows,
            fw_chars: time_major(&rows.fw_chars),
            fw_boundaries: time_major(&rows.fw_boundaries),
            bw_chars: time_major(&rows.bw_chars),
            bw_boundaries: time_major(&rows.bw_boundaries),
            flm_words: time_major(&rows.flm_words),
            blm_words: time_major(&rows.blm_words),
            blm_remap: time_major(&rows.blm_remap),
            words: time_major(&rows.words),
            transitions: time_major(&rows.transitions),
            mask: time_major(&rows.mask),
            labels: rows.labels,
        })
    }
}

/// Per-instance rows, transposed once the batch is complete.
struct Rows {
    fw_chars: Vec<Vec<u32>>,
    fw_boundaries: Vec<Vec<u32>>,
    bw_chars: Vec<Vec<u32>>,
    bw_boundaries: Vec<Vec<u32>>,
    flm_words: Vec<Vec<u32>>,
    blm_words: Vec<Vec<u32>>,
    blm_remap: Vec<Vec<u32>>,
    words: Vec<Vec<u32>>,
    transitions: Vec<Vec<u32>>,
    mask: Vec<Vec<u8>>,
    labels: Vec<Vec<u32>>,
}

impl Rows {
    fn new(capacity: usize) -> Self {
        Self {
            fw_chars: Vec::with_capacity(capacity),
            fw_boundaries: Vec::with_capacity(capacity),
            bw_chars: Vec::with_capacity(capacity),
            bw_boundaries: Vec::with_capacity(capacity),
            flm_words: Vec::with_capacity(capacity),
            blm_words: Vec::with_capacity(capacity),
            blm_remap: Vec::with_capacity(capacity),
            words: Vec::with_capacity(capacity),
            transitions: Vec::with_capacity(capacity),
            mask: Vec::with_capacity(capacity),
            labels: Vec::with_capacity(capacity),
        }
    }
}

/// `position * batch_size + offset`, bounds-checked against `bound` rows.
fn flat_index(
    position: usize,
    batch_size: usize,
    offset: usize,
    bound: usize,
    context: &'static str,
) -> Result<u32> {
    let index = position * batch_size + offset;
    if index >= bound {
        return Err(LmCrfError::IndexOutOfRange {
            context,
            index,
            bound,
        });
    }
    u32::try_from(index).map_err(|_| LmCrfError::IndexOutOfRange {
        context,
        index,
        bound: u32::MAX as usize,
    })
}

/// Transpose equal-length rows into one time-major buffer.
fn time_major<T: Copy>(rows: &[Vec<T>]) -> Vec<T> {
    let batch = rows.len();
    let len = rows.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(batch * len);
    for t in 0..len {
        for row in rows {
            out.push(row[t]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::instance::Instance;

    const SEP: u32 = 0;
    const CHAR_PAD: u32 = 1;

    fn pads(label_size: u32) -> PadTokens {
        PadTokens {
            flm_pad: 900,
            blm_pad: 901,
            word_pad: 902,
            char_separator: SEP,
            char_pad: CHAR_PAD,
            label_start: label_size - 2,
            label_pad: label_size - 1,
            label_size,
        }
    }

    fn batcher(label_size: u32) -> Batcher {
        Batcher::new(pads(label_size), Device::Cpu).unwrap()
    }

    /// Characters are numbered from 10 upwards so every id is unique.
    fn packed(word_lens: &[usize], labels: &[u32]) -> PackedInstance {
        let mut next = 10u32;
        let chars = word_lens
            .iter()
            .map(|&len| {
                (0..len)
                    .map(|_| {
                        next += 1;
                        next
                    })
                    .collect()
            })
            .collect();
        let n = word_lens.len() as u32;
        Instance {
            flm_words: (100..100 + n).collect(),
            blm_words: (200..200 + n).collect(),
            words: (300..300 + n).collect(),
            chars,
            labels: labels.to_vec(),
        }
        .pack(SEP)
    }

    fn column(data: &[u32], rows: usize, batch: usize, b: usize) -> Vec<u32> {
        (0..rows).map(|t| data[t * batch + b]).collect()
    }

    #[test]
    fn test_single_instance_boundaries() {
        let inst = packed(&[2, 1, 3], &[0, 2, 1]);
        let idx = batcher(5).assemble(&[&inst]).unwrap();

        assert_eq!(idx.char_rows, 10);
        assert_eq!(idx.word_rows, 4);
        assert_eq!(&idx.fw_boundaries[..3], &[2, 4, 8]);
        assert_eq!(idx.fw_boundaries[3], 9);

        // each forward boundary lands on the separator after its word
        for &p in &idx.fw_boundaries[..3] {
            assert_eq!(idx.fw_chars[p as usize], SEP);
        }

        // each backward boundary lands on the first character of its word
        assert_eq!(idx.bw_boundaries, vec![9, 6, 4, 0]);
        assert_eq!(idx.bw_chars[9], inst.chars[0]);
        assert_eq!(idx.bw_chars[6], inst.chars[3]);
        assert_eq!(idx.bw_chars[4], inst.chars[5]);
        assert_eq!(idx.bw_chars[0], CHAR_PAD);
    }

    #[test]
    fn test_transitions_and_mask() {
        let short = packed(&[1, 1, 1], &[0, 2, 1]);
        let long = packed(&[1, 1, 1, 1, 1], &[1, 1, 1, 1, 1]);
        let idx = batcher(5).assemble(&[&short, &long]).unwrap();

        assert_eq!(idx.word_rows, 6);
        assert_eq!(
            column(&idx.transitions, 6, 2, 0),
            vec![3 * 5, 2, 2 * 5 + 1, 5 + 4, 4 * 5 + 4, 4 * 5 + 4]
        );
        assert_eq!(
            column(&idx.transitions, 6, 2, 1),
            vec![3 * 5 + 1, 6, 6, 6, 6, 5 + 4]
        );

        let mask: Vec<u8> = (0..6).map(|t| idx.mask[t * 2]).collect();
        assert_eq!(mask, vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(idx.labels, vec![vec![0, 2, 1], vec![1; 5]]);
    }

    #[test]
    fn test_padding_and_reversal() {
        let a = packed(&[2], &[0]);
        let b = packed(&[1, 2, 1], &[0, 1, 0]);
        let idx = batcher(4).assemble(&[&a, &b]).unwrap();
        let (cr, wr) = (idx.char_rows, idx.word_rows);

        assert_eq!(cr, 8);
        assert_eq!(wr, 4);

        let fw_a = column(&idx.fw_chars, cr, 2, 0);
        assert_eq!(fw_a, vec![11, 12, SEP, CHAR_PAD, CHAR_PAD, CHAR_PAD, CHAR_PAD, CHAR_PAD]);
        let bw_a = column(&idx.bw_chars, cr, 2, 0);
        assert_eq!(bw_a, vec![CHAR_PAD, SEP, 12, 11, CHAR_PAD, CHAR_PAD, CHAR_PAD, CHAR_PAD]);

        assert_eq!(column(&idx.flm_words, wr, 2, 0), vec![100, 900, 900, 900]);
        assert_eq!(column(&idx.blm_words, wr, 2, 1), vec![901, 202, 201, 200]);
        assert_eq!(column(&idx.words, wr, 2, 0), vec![300, 902, 902, 902]);

        // remap for instance a (n = 1): positions [1, 0, 2, 3]
        assert_eq!(column(&idx.blm_remap, wr, 2, 0), vec![2, 0, 4, 6]);
        // remap for instance b (n = 3): positions [3, 2, 1, 0]
        assert_eq!(column(&idx.blm_remap, wr, 2, 1), vec![7, 5, 3, 1]);
    }

    #[test]
    fn test_remap_recovers_forward_order() {
        let a = packed(&[1, 1], &[0, 0]);
        let b = packed(&[1, 1, 1, 1], &[0, 0, 0, 0]);
        let idx = batcher(4).assemble(&[&a, &b]).unwrap();

        // gathering the backward word column through the remap yields each
        // instance's words in forward order at the real positions
        for (offset, inst) in [&a, &b].into_iter().enumerate() {
            for (k, word) in inst.blm_words.iter().enumerate() {
                let src = idx.blm_remap[k * 2 + offset] as usize;
                assert_eq!(idx.blm_words[src], *word);
            }
        }
    }

    #[test]
    fn test_gather_indices_in_bounds() {
        let mut rng = oorandom::Rand64::new(7);
        let batcher = batcher(6);

        for _ in 0..50 {
            let batch_size = rng.rand_range(1..9) as usize;
            let instances: Vec<PackedInstance> = (0..batch_size)
                .map(|_| {
                    let n = rng.rand_range(1..12) as usize;
                    let lens: Vec<usize> = (0..n).map(|_| rng.rand_range(0..7) as usize).collect();
                    let labels: Vec<u32> = (0..n).map(|_| rng.rand_range(0..4) as u32).collect();
                    packed(&lens, &labels)
                })
                .collect();
            let refs: Vec<&PackedInstance> = instances.iter().collect();
            let idx = batcher.assemble(&refs).unwrap();

            let char_bound = (idx.char_rows * batch_size) as u32;
            let word_bound = (idx.word_rows * batch_size) as u32;
            assert!(idx.fw_boundaries.iter().all(|&i| i < char_bound));
            assert!(idx.bw_boundaries.iter().all(|&i| i < char_bound));
            assert!(idx.blm_remap.iter().all(|&i| i < word_bound));
            assert_eq!(idx.fw_boundaries.len(), idx.word_rows * batch_size);
            assert_eq!(idx.fw_chars.len(), idx.char_rows * batch_size);

            // every index stays in its own instance's column
            for (i, &p) in idx.fw_boundaries.iter().enumerate() {
                assert_eq!(p as usize % batch_size, i % batch_size);
            }
        }
    }

    #[test]
    fn test_rejects_empty_and_mismatched() {
        let batcher = batcher(4);
        assert!(matches!(batcher.assemble(&[]), Err(LmCrfError::EmptyBatch)));

        let mut bad = packed(&[1, 2], &[0, 1]);
        bad.blm_words.push(7);
        assert!(matches!(
            batcher.assemble(&[&bad]),
            Err(LmCrfError::ShapeMismatch { context: "backward lm words", .. })
        ));

        let empty = packed(&[], &[]);
        let ok = packed(&[1], &[0]);
        assert!(matches!(
            batcher.assemble(&[&ok, &empty]),
            Err(LmCrfError::EmptySequence(1))
        ));
    }

    #[test]
    fn test_pad_tokens_validation() {
        let mut bad = pads(5);
        bad.label_start = 0;
        assert!(matches!(bad.validate(), Err(LmCrfError::InvalidConfig(_))));
        assert!(Batcher::new(bad, Device::Cpu).is_err());
    }

    #[test]
    fn test_to_tensors_shapes() {
        let a = packed(&[3, 1], &[0, 1]);
        let b = packed(&[2], &[1]);
        let batch = batcher(4).batch(&[&a, &b]).unwrap();

        assert_eq!(batch.fw_chars.dims(), &[7, 2]);
        assert_eq!(batch.bw_chars.dims(), &[7, 2]);
        assert_eq!(batch.fw_boundaries.dims(), &[6]);
        assert_eq!(batch.blm_remap.dims(), &[6]);
        assert_eq!(batch.transitions.dims(), &[3, 2]);
        assert_eq!(batch.mask.dtype(), candle_core::DType::U8);
        assert_eq!(batch.batch_size(), 2);

        let mask = batch.mask.to_vec2::<u8>().unwrap();
        assert_eq!(mask, vec![vec![1, 1], vec![1, 1], vec![1, 0]]);
    }
}
