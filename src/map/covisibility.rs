//! Covisibility graph over keyframes.
//!
//! Undirected, weighted by the number of map points two keyframes both
//! observe. Edges below `min_weight` are not stored. Each node keeps its
//! neighbors pre-sorted (weight descending, then smaller id first), rebuilt on
//! every change so queries never see a stale or half-built ordering.

use std::collections::HashMap;

use super::types::KeyFrameId;

#[derive(Debug, Clone, Default)]
struct CovisibilityNode {
    weights: HashMap<KeyFrameId, usize>,
    ordered: Vec<(KeyFrameId, usize)>,
}

impl CovisibilityNode {
    fn reorder(&mut self) {
        self.ordered = self.weights.iter().map(|(id, w)| (*id, *w)).collect();
        self.ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }
}

#[derive(Debug, Clone)]
pub struct CovisibilityGraph {
    nodes: HashMap<KeyFrameId, CovisibilityNode>,
    min_weight: usize,
}

impl CovisibilityGraph {
    pub fn new(min_weight: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            min_weight: min_weight.max(1),
        }
    }

    pub fn min_weight(&self) -> usize {
        self.min_weight
    }

    pub fn add_node(&mut self, kf_id: KeyFrameId) {
        self.nodes.entry(kf_id).or_default();
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.nodes.contains_key(&kf_id)
    }

    /// Remove a node and every edge touching it. Returns its former neighbors.
    pub fn remove_node(&mut self, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        let node = match self.nodes.remove(&kf_id) {
            Some(n) => n,
            None => return Vec::new(),
        };
        let neighbors: Vec<KeyFrameId> = node.ordered.iter().map(|(id, _)| *id).collect();
        for other in &neighbors {
            if let Some(n) = self.nodes.get_mut(other) {
                if n.weights.remove(&kf_id).is_some() {
                    n.reorder();
                }
            }
        }
        neighbors
    }

    /// Replace all edges of `kf_id` with `weights`, updating both endpoints.
    ///
    /// Self-edges, unknown neighbors and weights below the minimum are dropped.
    pub fn set_connections(&mut self, kf_id: KeyFrameId, weights: &HashMap<KeyFrameId, usize>) {
        if !self.nodes.contains_key(&kf_id) {
            return;
        }

        let kept: HashMap<KeyFrameId, usize> = weights
            .iter()
            .filter(|(id, w)| **id != kf_id && **w >= self.min_weight && self.nodes.contains_key(id))
            .map(|(id, w)| (*id, *w))
            .collect();

        let old: Vec<KeyFrameId> = self.nodes[&kf_id].weights.keys().copied().collect();
        for other in old {
            if !kept.contains_key(&other) {
                if let Some(n) = self.nodes.get_mut(&other) {
                    n.weights.remove(&kf_id);
                    n.reorder();
                }
            }
        }

        for (other, w) in &kept {
            if let Some(n) = self.nodes.get_mut(other) {
                n.weights.insert(kf_id, *w);
                n.reorder();
            }
        }

        if let Some(node) = self.nodes.get_mut(&kf_id) {
            node.weights = kept;
            node.reorder();
        }
    }

    /// Edge weight, 0 when not connected.
    pub fn weight(&self, a: KeyFrameId, b: KeyFrameId) -> usize {
        self.nodes
            .get(&a)
            .and_then(|n| n.weights.get(&b))
            .copied()
            .unwrap_or(0)
    }

    /// All neighbors, best first.
    pub fn neighbors(&self, kf_id: KeyFrameId) -> &[(KeyFrameId, usize)] {
        self.nodes.get(&kf_id).map(|n| n.ordered.as_slice()).unwrap_or(&[])
    }

    /// The `n` strongest neighbors; ties go to the smaller id.
    pub fn best_neighbors(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.neighbors(kf_id).iter().take(n).map(|(id, _)| *id).collect()
    }

    pub fn neighbors_above(&self, kf_id: KeyFrameId, min_weight: usize) -> Vec<KeyFrameId> {
        self.neighbors(kf_id)
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Each undirected edge once, as `(smaller id, larger id, weight)`.
    pub fn edges(&self) -> Vec<(KeyFrameId, KeyFrameId, usize)> {
        let mut edges: Vec<_> = self
            .nodes
            .iter()
            .flat_map(|(a, n)| {
                n.weights
                    .iter()
                    .filter(move |(b, _)| *a < **b)
                    .map(move |(b, w)| (*a, *b, *w))
            })
            .collect();
        edges.sort();
        edges
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.values().map(|n| n.weights.len()).sum::<usize>() / 2
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
