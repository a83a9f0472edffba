//! Data loading for CoNLL-style labeled corpora.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context};
use lmcrf_core::{Instance, LabelSpace, PadTokens};
use serde::{Deserialize, Serialize};

/// Pad token of both language-model vocabularies.
pub const LM_PAD: &str = "\n";
/// Pad token of the word vocabulary.
pub const WORD_PAD: &str = "<\n>";
/// Character appended after every word.
pub const CHAR_SEPARATOR: char = ' ';
/// Pad token of the character vocabulary.
pub const CHAR_PAD: char = '\n';
/// Synthetic start label.
pub const LABEL_START: &str = "<s>";
/// Pad (end) label.
pub const LABEL_PAD: &str = "<eof>";
/// Out-of-vocabulary entry.
pub const UNK: &str = "<unk>";

/// A single training example: tokens with one label each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub tokens: Vec<String>,
    pub labels: Vec<String>,
}

/// Load a CoNLL file: token in the first column, label in the last, blank
/// lines between sentences.
pub fn load_conll<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Sentence>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening corpus {}", path.display()))?;
    parse_conll(BufReader::new(file)).with_context(|| format!("reading corpus {}", path.display()))
}

/// Parse CoNLL lines from any reader.
pub fn parse_conll<R: BufRead>(reader: R) -> anyhow::Result<Vec<Sentence>> {
    let mut sentences = Vec::new();
    let mut tokens = Vec::new();
    let mut labels = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() {
            if !tokens.is_empty() {
                sentences.push(Sentence {
                    tokens: std::mem::take(&mut tokens),
                    labels: std::mem::take(&mut labels),
                });
            }
            continue;
        }

        if line.starts_with('#') || line.starts_with("-DOCSTART-") {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 2 {
            bail!("line {}: expected a token and a label, got {line:?}", number + 1);
        }
        tokens.push(columns[0].to_string());
        labels.push(columns[columns.len() - 1].to_string());
    }

    // Don't forget the last sentence
    if !tokens.is_empty() {
        sentences.push(Sentence { tokens, labels });
    }

    Ok(sentences)
}

/// A string-to-id mapping, serialized as its ordered entry list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
}

impl From<Vec<String>> for Vocab {
    fn from(itos: Vec<String>) -> Self {
        let mut vocab = Vocab::default();
        for entry in itos {
            vocab.insert(&entry);
        }
        vocab
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.itos
    }
}

impl Vocab {
    /// A vocabulary seeded with `specials`, in order.
    pub fn with_specials(specials: &[&str]) -> Self {
        let mut vocab = Vocab::default();
        for special in specials {
            vocab.insert(special);
        }
        vocab
    }

    /// Load a JSON list of entries.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening vocabulary {}", path.display()))?;
        let vocab = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing vocabulary {}", path.display()))?;
        Ok(vocab)
    }

    /// Id of `entry`, adding it if new.
    pub fn insert(&mut self, entry: &str) -> u32 {
        if let Some(&id) = self.stoi.get(entry) {
            return id;
        }
        let id = self.itos.len() as u32;
        self.itos.push(entry.to_string());
        self.stoi.insert(entry.to_string(), id);
        id
    }

    pub fn get(&self, entry: &str) -> Option<u32> {
        self.stoi.get(entry).copied()
    }

    /// Id of `entry`, falling back to `<unk>`.
    pub fn encode(&self, entry: &str) -> anyhow::Result<u32> {
        self.get(entry)
            .or_else(|| self.get(UNK))
            .with_context(|| format!("{entry:?} is not in a vocabulary without {UNK}"))
    }

    /// Entry with id `id`.
    pub fn name(&self, id: u32) -> Option<&str> {
        self.itos.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    fn require(&self, entry: &str) -> anyhow::Result<u32> {
        self.get(entry)
            .with_context(|| format!("vocabulary is missing the special entry {entry:?}"))
    }
}

/// The vocabularies of one labeling task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corpus {
    pub flm: Vocab,
    pub blm: Vocab,
    pub words: Vocab,
    pub chars: Vocab,
    pub labels: Vocab,
}

impl Corpus {
    /// Build vocabularies from training sentences.
    ///
    /// Language-model vocabularies come from their pretrained models when
    /// given; otherwise they are built from the training tokens. Labels are
    /// numbered in order of appearance, followed by the start and pad labels.
    pub fn build(train: &[Sentence], flm: Option<Vocab>, blm: Option<Vocab>) -> anyhow::Result<Self> {
        let mut words = Vocab::with_specials(&[UNK, WORD_PAD]);
        let mut chars = Vocab::with_specials(&[
            UNK,
            &CHAR_SEPARATOR.to_string(),
            &CHAR_PAD.to_string(),
        ]);
        let mut lm = Vocab::with_specials(&[UNK, LM_PAD]);
        let mut labels = Vocab::default();

        for sentence in train {
            for token in &sentence.tokens {
                words.insert(&token.to_lowercase());
                lm.insert(token);
                let mut buf = [0u8; 4];
                for c in token.chars() {
                    chars.insert(c.encode_utf8(&mut buf));
                }
            }
            for label in &sentence.labels {
                labels.insert(label);
            }
        }
        if labels.is_empty() {
            bail!("training data has no labels");
        }
        for special in [LABEL_START, LABEL_PAD] {
            if labels.get(special).is_some() {
                bail!("{special:?} is reserved and cannot be a gold label");
            }
            labels.insert(special);
        }

        let corpus = Self {
            flm: flm.unwrap_or_else(|| lm.clone()),
            blm: blm.unwrap_or(lm),
            words,
            chars,
            labels,
        };
        corpus.pads()?;
        Ok(corpus)
    }

    /// Load vocabularies saved with [`Corpus::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let corpus: Self = serde_json::from_reader(BufReader::new(file))?;
        corpus.pads()?;
        Ok(corpus)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Pad and special ids for batch assembly.
    pub fn pads(&self) -> anyhow::Result<PadTokens> {
        let pads = PadTokens {
            flm_pad: self.flm.require(LM_PAD)?,
            blm_pad: self.blm.require(LM_PAD)?,
            word_pad: self.words.require(WORD_PAD)?,
            char_separator: self.chars.require(&CHAR_SEPARATOR.to_string())?,
            char_pad: self.chars.require(&CHAR_PAD.to_string())?,
            label_start: self.labels.require(LABEL_START)?,
            label_pad: self.labels.require(LABEL_PAD)?,
            label_size: self.labels.len() as u32,
        };
        pads.validate()?;
        Ok(pads)
    }

    /// The CRF label space: every label but start and pad.
    pub fn label_space(&self) -> anyhow::Result<LabelSpace> {
        Ok(LabelSpace::new(self.labels.len().saturating_sub(2))?)
    }

    /// Encode a sentence. Unknown labels are an error, unknown tokens map to `<unk>`.
    pub fn encode(&self, sentence: &Sentence) -> anyhow::Result<Instance> {
        if sentence.tokens.len() != sentence.labels.len() {
            bail!(
                "sentence has {} tokens but {} labels",
                sentence.tokens.len(),
                sentence.labels.len()
            );
        }

        let tokens = &sentence.tokens;
        let lm_ids = |vocab: &Vocab| -> anyhow::Result<Vec<u32>> {
            tokens.iter().map(|token| vocab.encode(token)).collect()
        };
        let chars = tokens
            .iter()
            .map(|token| {
                let mut buf = [0u8; 4];
                token
                    .chars()
                    .map(|c| self.chars.encode(c.encode_utf8(&mut buf)))
                    .collect()
            })
            .collect::<anyhow::Result<Vec<Vec<u32>>>>()?;
        let labels = sentence
            .labels
            .iter()
            .map(|label| {
                self.labels
                    .get(label)
                    .with_context(|| format!("unknown label {label:?}"))
            })
            .collect::<anyhow::Result<Vec<u32>>>()?;

        Ok(Instance {
            flm_words: lm_ids(&self.flm)?,
            blm_words: lm_ids(&self.blm)?,
            words: tokens
                .iter()
                .map(|token| self.words.encode(&token.to_lowercase()))
                .collect::<anyhow::Result<_>>()?,
            chars,
            labels,
        })
    }

    /// Encode every sentence.
    pub fn encode_all(&self, sentences: &[Sentence]) -> anyhow::Result<Vec<Instance>> {
        sentences.iter().map(|sentence| self.encode(sentence)).collect()
    }

    /// Names of decoded label ids.
    pub fn label_names(&self, ids: &[u32]) -> Vec<&str> {
        ids.iter()
            .map(|&id| self.labels.name(id).unwrap_or(UNK))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "-DOCSTART- -X- O O\n\
                          \n\
                          EU NNP B-ORG\n\
                          rejects VBZ O\n\
                          German JJ B-MISC\n\
                          \n\
                          \n\
                          # comment\n\
                          Peter NNP B-PER\n\
                          Blackburn NNP I-PER\n";

    fn sample() -> Vec<Sentence> {
        parse_conll(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_conll() {
        let sentences = sample();
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].tokens, vec!["EU", "rejects", "German"]);
        assert_eq!(sentences[0].labels, vec!["B-ORG", "O", "B-MISC"]);
        assert_eq!(sentences[1].labels, vec!["B-PER", "I-PER"]);

        assert!(parse_conll("lonely\n".as_bytes()).is_err());
    }

    #[test]
    fn test_labels_end_with_start_and_pad() {
        let corpus = Corpus::build(&sample(), None, None).unwrap();
        let pads = corpus.pads().unwrap();
        assert_eq!(corpus.labels.len(), 7);
        assert_eq!(pads.label_start, 5);
        assert_eq!(pads.label_pad, 6);
        assert_eq!(corpus.label_space().unwrap().num_labels(), 5);
        corpus.label_space().unwrap().check_pads(&pads).unwrap();
    }

    #[test]
    fn test_encode_sentence() {
        let sentences = sample();
        let corpus = Corpus::build(&sentences, None, None).unwrap();
        let instance = corpus.encode(&sentences[1]).unwrap();

        assert_eq!(instance.words.len(), 2);
        assert_eq!(instance.chars[0].len(), "Peter".len());
        assert_eq!(instance.flm_words, instance.blm_words);
        assert_eq!(corpus.label_names(&instance.labels), vec!["B-PER", "I-PER"]);

        let unseen = Sentence {
            tokens: vec!["Zürich".to_string()],
            labels: vec!["O".to_string()],
        };
        let encoded = corpus.encode(&unseen).unwrap();
        assert_eq!(encoded.words, vec![corpus.words.get(UNK).unwrap()]);

        let bad = Sentence {
            tokens: vec!["x".to_string()],
            labels: vec!["B-LOC".to_string()],
        };
        assert!(corpus.encode(&bad).is_err());
    }

    #[test]
    fn test_pretrained_lm_vocab_needs_pad() {
        let flm = Vocab::from(vec![UNK.to_string(), "EU".to_string()]);
        let result = Corpus::build(&sample(), Some(flm), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_vocab_json_roundtrip() {
        let corpus = Corpus::build(&sample(), None, None).unwrap();
        let json = serde_json::to_string(&corpus.labels).unwrap();
        assert!(json.starts_with("[\"B-ORG\""));
        let labels: Vocab = serde_json::from_str(&json).unwrap();
        assert_eq!(labels, corpus.labels);
    }
}
