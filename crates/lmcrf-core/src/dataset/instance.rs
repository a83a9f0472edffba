//! # Labeled Instances
//!
//! Raw training instances and their packed form. Packing runs once per
//! instance at dataset load and flattens the per-word character groups into a
//! single character stream with a separator after every word.

use serde::{Deserialize, Serialize};

use crate::error::{LmCrfError, Result};

/// One labeled sequence as supplied by the dataset collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Word ids in the forward language-model vocabulary.
    pub flm_words: Vec<u32>,

    /// Word ids in the backward language-model vocabulary, in reading order.
    pub blm_words: Vec<u32>,

    /// Word ids in the generic word vocabulary.
    pub words: Vec<u32>,

    /// Character ids, one group per word.
    pub chars: Vec<Vec<u32>>,

    /// Gold label ids, one per word.
    pub labels: Vec<u32>,
}

/// An instance after index packing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedInstance {
    /// Word ids in the forward language-model vocabulary.
    pub flm_words: Vec<u32>,

    /// Word ids in the backward language-model vocabulary.
    pub blm_words: Vec<u32>,

    /// Word ids in the generic word vocabulary.
    pub words: Vec<u32>,

    /// Flattened characters, each word followed by one separator id.
    pub chars: Vec<u32>,

    /// Per-word character count plus one for the separator.
    pub char_lens: Vec<usize>,

    /// Gold label ids, one per word.
    pub labels: Vec<u32>,
}

impl Instance {
    /// Number of words in the instance.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the instance has no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Pack the character groups, appending `separator` after every word.
    ///
    /// An empty word list yields empty outputs; an empty character group
    /// contributes only its separator.
    pub fn pack(self, separator: u32) -> PackedInstance {
        let char_lens: Vec<usize> = self.chars.iter().map(|word| word.len() + 1).collect();

        let mut chars = Vec::with_capacity(char_lens.iter().sum());
        for word in &self.chars {
            chars.extend_from_slice(word);
            chars.push(separator);
        }

        PackedInstance {
            flm_words: self.flm_words,
            blm_words: self.blm_words,
            words: self.words,
            chars,
            char_lens,
            labels: self.labels,
        }
    }
}

impl PackedInstance {
    /// Number of words in the instance.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the instance has no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Check that every per-word array agrees on the word count and that the
    /// character lengths cover the flattened character stream exactly.
    ///
    /// `position` identifies the instance in error messages.
    pub fn validate(&self, position: usize) -> Result<()> {
        let words = self.words.len();
        if words == 0 {
            return Err(LmCrfError::EmptySequence(position));
        }

        let checks = [
            ("forward lm words", self.flm_words.len()),
            ("backward lm words", self.blm_words.len()),
            ("character groups", self.char_lens.len()),
            ("labels", self.labels.len()),
        ];
        for (context, actual) in checks {
            if actual != words {
                return Err(LmCrfError::ShapeMismatch {
                    context,
                    expected: words,
                    actual,
                });
            }
        }

        let declared: usize = self.char_lens.iter().sum();
        if declared != self.chars.len() || self.char_lens.contains(&0) {
            return Err(LmCrfError::ShapeMismatch {
                context: "flattened characters",
                expected: declared,
                actual: self.chars.len(),
            });
        }

        Ok(())
    }
}
