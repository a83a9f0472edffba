//! Chunk-level evaluation for BIO and BIOES label sequences.

use std::collections::HashSet;

use serde::Serialize;

/// Position of a token inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkTag {
    Begin,
    Inside,
    End,
    Single,
    Outside,
}

impl ChunkTag {
    /// Split a label such as `B-PER` into its tag and entity type.
    ///
    /// Labels without a recognized prefix are treated as `Inside` tokens of
    /// their own type, so runs of the same bare label form one chunk.
    pub fn parse(label: &str) -> (Self, &str) {
        if label == "O" {
            return (ChunkTag::Outside, "");
        }
        match label.split_once('-') {
            Some(("B", kind)) => (ChunkTag::Begin, kind),
            Some(("I", kind)) => (ChunkTag::Inside, kind),
            Some(("E", kind)) => (ChunkTag::End, kind),
            Some(("S", kind)) => (ChunkTag::Single, kind),
            _ => (ChunkTag::Inside, label),
        }
    }
}

/// An extracted chunk spanning tokens `start..end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub kind: String,
    pub start: usize,
    pub end: usize,
}

fn ends_chunk(prev: (ChunkTag, &str), next: (ChunkTag, &str)) -> bool {
    use ChunkTag::*;
    match (prev.0, next.0) {
        (Outside, _) => false,
        (End | Single, _) => true,
        (Begin | Inside, Begin | Single | Outside) => true,
        _ => prev.1 != next.1,
    }
}

fn starts_chunk(prev: (ChunkTag, &str), next: (ChunkTag, &str)) -> bool {
    use ChunkTag::*;
    match (prev.0, next.0) {
        (_, Outside) => false,
        (_, Begin | Single) => true,
        (End | Single | Outside, Inside | End) => true,
        _ => prev.1 != next.1,
    }
}

/// Extract every chunk from a label sequence.
pub fn chunks<S: AsRef<str>>(labels: &[S]) -> Vec<Chunk> {
    let mut found = Vec::new();
    let mut prev = (ChunkTag::Outside, "");
    let mut start = None;

    for (position, label) in labels.iter().enumerate() {
        let current = ChunkTag::parse(label.as_ref());
        if let Some(begin) = start {
            if ends_chunk(prev, current) {
                found.push(Chunk {
                    kind: prev.1.to_string(),
                    start: begin,
                    end: position,
                });
                start = None;
            }
        }
        if starts_chunk(prev, current) {
            start = Some(position);
        }
        prev = current;
    }
    if let Some(begin) = start {
        found.push(Chunk {
            kind: prev.1.to_string(),
            start: begin,
            end: labels.len(),
        });
    }

    found
}

/// Running chunk and token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkScore {
    pub correct_chunks: usize,
    pub predicted_chunks: usize,
    pub gold_chunks: usize,
    pub correct_tokens: usize,
    pub total_tokens: usize,
}

/// Final evaluation figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
}

impl ChunkScore {
    /// Add one sentence.
    pub fn update<S: AsRef<str>, T: AsRef<str>>(&mut self, gold: &[S], predicted: &[T]) {
        let gold_chunks: HashSet<Chunk> = chunks(gold).into_iter().collect();
        let predicted_chunks = chunks(predicted);

        self.correct_chunks += predicted_chunks
            .iter()
            .filter(|chunk| gold_chunks.contains(chunk))
            .count();
        self.predicted_chunks += predicted_chunks.len();
        self.gold_chunks += gold_chunks.len();

        self.correct_tokens += gold
            .iter()
            .zip(predicted)
            .filter(|(g, p)| g.as_ref() == p.as_ref())
            .count();
        self.total_tokens += gold.len();
    }

    pub fn metrics(&self) -> Metrics {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(self.correct_chunks, self.predicted_chunks);
        let recall = ratio(self.correct_chunks, self.gold_chunks);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Metrics {
            f1,
            precision,
            recall,
            accuracy: ratio(self.correct_tokens, self.total_tokens),
        }
    }
}
