//! KeyFrameDatabase - inverted index for relocalization.
//!
//! Maps every visual word to the keyframes containing it. A query first
//! collects keyframes sharing words with the query vector, keeps those sharing
//! at least `min_overlap` of the query's words, then ranks them by L1
//! bag-of-words similarity.

use std::collections::{HashMap, HashSet};

use crate::vocabulary::{l1_score, BowVector};

use super::types::KeyFrameId;

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    /// Fraction of the query's words present in the keyframe.
    pub overlap: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KeyFrameDatabase {
    entries: HashMap<KeyFrameId, BowVector>,
    inverted: HashMap<u32, HashSet<KeyFrameId>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector) {
        self.erase(kf_id);
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().insert(kf_id);
        }
        self.entries.insert(kf_id, bow);
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        if let Some(bow) = self.entries.remove(&kf_id) {
            for word in bow.keys() {
                if let Some(set) = self.inverted.get_mut(word) {
                    set.remove(&kf_id);
                    if set.is_empty() {
                        self.inverted.remove(word);
                    }
                }
            }
        }
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keyframes referenced anywhere in the inverted index.
    pub fn indexed_keyframes(&self) -> HashSet<KeyFrameId> {
        self.inverted.values().flatten().copied().collect()
    }

    /// Ranked candidates (best first; ties to the smaller id).
    pub fn query(&self, bow: &BowVector, min_overlap: f64, max_results: usize) -> Vec<Candidate> {
        if bow.is_empty() {
            return Vec::new();
        }

        let mut shared: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in bow.keys() {
            if let Some(kfs) = self.inverted.get(word) {
                for kf_id in kfs {
                    *shared.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }

        let n_words = bow.len() as f64;
        let mut candidates: Vec<Candidate> = shared
            .into_iter()
            .filter_map(|(kf_id, common)| {
                let overlap = common as f64 / n_words;
                if overlap < min_overlap {
                    return None;
                }
                let entry = self.entries.get(&kf_id)?;
                Some(Candidate {
                    keyframe_id: kf_id,
                    overlap,
                    score: l1_score(bow, entry),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        candidates.truncate(max_results);
        candidates
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.inverted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[u32]) -> BowVector {
        let w = 1.0 / words.len() as f64;
        words.iter().map(|&id| (id, w)).collect()
    }

    #[test]
    fn test_query_ranks_by_score() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2, 3, 4]));
        db.add(KeyFrameId::new(2), bow(&[1, 2, 7, 8]));
        db.add(KeyFrameId::new(3), bow(&[9, 10]));

        let result = db.query(&bow(&[1, 2, 3, 4]), 0.3, 10);
        let ids: Vec<_> = result.iter().map(|c| c.keyframe_id).collect();
        assert_eq!(ids, vec![KeyFrameId::new(1), KeyFrameId::new(2)]);
        assert!((result[0].score - 1.0).abs() < 1e-12);
        assert!((result[1].overlap - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_query_min_overlap() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 5, 6, 7]));

        assert!(db.query(&bow(&[1, 2, 3, 4]), 0.5, 10).is_empty());
        assert_eq!(db.query(&bow(&[1, 2, 3, 4]), 0.25, 10).len(), 1);
    }

    #[test]
    fn test_erase_cleans_inverted_index() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2]));
        db.add(KeyFrameId::new(2), bow(&[2, 3]));

        db.erase(KeyFrameId::new(1));
        assert!(!db.contains(KeyFrameId::new(1)));
        assert!(!db.indexed_keyframes().contains(&KeyFrameId::new(1)));
        assert_eq!(db.query(&bow(&[1]), 0.0, 10).len(), 0);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_empty_query() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2]));
        assert!(db.query(&BowVector::new(), 0.0, 10).is_empty());
    }
}
