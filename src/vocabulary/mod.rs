//! Visual vocabulary for bag-of-words place recognition.
//!
//! A [`Vocabulary`] turns a set of binary descriptors into a sparse
//! [`BowVector`]. The keyframe database indexes those vectors and ranks
//! relocalization candidates with [`l1_score`].
//!
//! [`OrbVocabulary`] reads the DBoW2 text format: a hierarchical k-means tree
//! whose leaves are the visual words. A descriptor is quantized by descending
//! from the root to the closest child at every level.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Result, SlamError};
use crate::frame::{hamming_distance, Descriptor};

/// Bag-of-Words vector: word_id -> weight, L1-normalized.
pub type BowVector = HashMap<u32, f64>;

/// Similarity `1 - 0.5 * |a - b|_1`, in [0, 1] for normalized vectors.
pub fn l1_score(a: &BowVector, b: &BowVector) -> f64 {
    let mut diff_sum = 0.0;
    for (word, wa) in a {
        let wb = b.get(word).copied().unwrap_or(0.0);
        diff_sum += (wa - wb).abs();
    }
    for (word, wb) in b {
        if !a.contains_key(word) {
            diff_sum += wb.abs();
        }
    }
    1.0 - 0.5 * diff_sum
}

/// Quantizes descriptors into visual words.
pub trait Vocabulary: Send + Sync {
    fn summarize(&self, descriptors: &[Descriptor]) -> BowVector;

    fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        l1_score(a, b)
    }
}

#[derive(Debug, Clone)]
struct VocabNode {
    parent: Option<usize>,
    children: Vec<usize>,
    descriptor: Descriptor,
    /// IDF weight, only meaningful for leaves.
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn root() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            descriptor: [0; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// DBoW2-style vocabulary tree.
#[derive(Debug, Clone)]
pub struct OrbVocabulary {
    /// nodes[0] is the root.
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load from the DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] ... desc[31] weight
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            SlamError::Vocabulary(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        let vocab = Self::from_reader(BufReader::new(file))?;
        tracing::info!(
            "[Vocabulary] Loaded k={}, L={}, {} nodes, {} words",
            vocab.k,
            vocab.l,
            vocab.nodes.len(),
            vocab.num_words
        );
        Ok(vocab)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| SlamError::Vocabulary("empty vocabulary file".to_string()))??;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(SlamError::Vocabulary(
                "invalid header, expected: k L [scoring weighting]".to_string(),
            ));
        }
        let k: usize = header_parts[0]
            .parse()
            .map_err(|_| SlamError::Vocabulary("invalid k value".to_string()))?;
        let l: usize = header_parts[1]
            .parse()
            .map_err(|_| SlamError::Vocabulary("invalid L value".to_string()))?;

        let mut nodes = vec![VocabNode::root()];
        let mut num_words = 0u32;

        for (i, line) in lines.enumerate() {
            let line = line?;
            let line_no = i + 2;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if parts.len() < 35 {
                return Err(SlamError::Vocabulary(format!(
                    "line {}: expected 35 fields, found {}",
                    line_no,
                    parts.len()
                )));
            }

            let parent: usize = parts[0]
                .parse()
                .map_err(|_| SlamError::Vocabulary(format!("line {}: invalid parent id", line_no)))?;
            if parent >= nodes.len() {
                return Err(SlamError::Vocabulary(format!(
                    "line {}: parent {} not defined yet",
                    line_no, parent
                )));
            }
            let is_leaf = parts[1] == "1";

            let mut descriptor = [0u8; 32];
            for (byte, text) in descriptor.iter_mut().zip(&parts[2..34]) {
                *byte = text.parse().map_err(|_| {
                    SlamError::Vocabulary(format!("line {}: invalid descriptor byte", line_no))
                })?;
            }
            let weight: f64 = parts[34]
                .parse()
                .map_err(|_| SlamError::Vocabulary(format!("line {}: invalid weight", line_no)))?;

            let node_id = nodes.len();
            let word_id = if is_leaf {
                num_words += 1;
                Some(num_words - 1)
            } else {
                None
            };
            nodes[parent].children.push(node_id);
            nodes.push(VocabNode {
                parent: Some(parent),
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
        }

        if num_words == 0 {
            return Err(SlamError::Vocabulary("vocabulary has no words".to_string()));
        }

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        })
    }

    /// Single-level vocabulary: every descriptor is one word of weight 1.
    pub fn from_words(words: Vec<Descriptor>) -> Self {
        let mut nodes = vec![VocabNode::root()];
        for (i, descriptor) in words.iter().enumerate() {
            nodes[0].children.push(i + 1);
            nodes.push(VocabNode {
                parent: Some(0),
                children: Vec::new(),
                descriptor: *descriptor,
                weight: 1.0,
                word_id: Some(i as u32),
            });
        }
        Self {
            nodes,
            num_words: words.len(),
            k: words.len(),
            l: 1,
        }
    }

    /// `(k, L)`: branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend to the closest leaf. Returns `(word_id, leaf node)`.
    fn quantize(&self, descriptor: &Descriptor) -> Option<(u32, usize)> {
        let mut node_id = 0usize;
        while let Some(&first) = self.nodes[node_id].children.first() {
            let mut best = first;
            let mut best_dist = hamming_distance(descriptor, &self.nodes[first].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = hamming_distance(descriptor, &self.nodes[child].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best = child;
                }
            }
            node_id = best;
        }
        self.nodes[node_id].word_id.map(|w| (w, node_id))
    }

    /// Ancestor `levels_up` levels above `node_id`, stopping at the root.
    pub fn ancestor(&self, node_id: usize, levels_up: usize) -> usize {
        let mut current = node_id;
        for _ in 0..levels_up {
            match self.nodes.get(current).and_then(|n| n.parent) {
                Some(p) => current = p,
                None => break,
            }
        }
        current
    }
}

impl Vocabulary for OrbVocabulary {
    fn summarize(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for descriptor in descriptors {
            if let Some((word, leaf)) = self.quantize(descriptor) {
                *bow.entry(word).or_insert(0.0) += self.nodes[leaf].weight;
            }
        }

        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }
        bow
    }
}
