//! Map - the authoritative container of keyframes and map points.
//!
//! The map forms a bipartite graph stored as an id-addressed arena:
//! - KeyFrames observe MapPoints (feature `map_point` fields)
//! - MapPoints track their observers (`observations`)
//!
//! Every mutation keeps both directions in step. Removal cascades: erasing a
//! keyframe unlinks it from every point, the covisibility graph and the
//! keyframe database, and purges points left without observations.
//!
//! Covisibility weights are *not* refreshed by [`Map::associate`]; callers
//! finish a batch of associations with [`Map::update_connections`]. Within
//! the shared state the whole batch happens under one write lock, so readers
//! never observe a half-updated graph.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::config::{ScalePyramid, SlamConfig};
use crate::error::{Result, SlamError};
use crate::frame::Descriptor;
use crate::geometry::SE3;
use crate::vocabulary::BowVector;

use super::covisibility::CovisibilityGraph;
use super::keyframe::KeyFrame;
use super::keyframe_db::KeyFrameDatabase;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Copy of a keyframe's externally relevant state.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFrameView {
    pub id: KeyFrameId,
    pub pose: SE3,
    pub num_map_points: usize,
}

/// Copy of a map point's externally relevant state.
#[derive(Debug, Clone, PartialEq)]
pub struct PointView {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    pub reference_kf: KeyFrameId,
    pub num_observations: usize,
}

/// Detached copy of the map, safe to hand to other threads.
#[derive(Debug, Clone, Default)]
pub struct MapSnapshot {
    /// Sorted by id.
    pub keyframes: Vec<KeyFrameView>,
    /// Sorted by id.
    pub points: Vec<PointView>,
    pub covisibility_edges: Vec<(KeyFrameId, KeyFrameId, usize)>,
}

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    covisibility: CovisibilityGraph,
    keyframe_db: KeyFrameDatabase,
    pyramid: ScalePyramid,
    next_map_point_id: u64,
    first_keyframe: Option<KeyFrameId>,
    /// Keyframes inserted since the last clear; ages map points.
    keyframes_inserted: u64,
}

impl Map {
    pub fn new(pyramid: ScalePyramid, min_covisibility_weight: usize) -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            covisibility: CovisibilityGraph::new(min_covisibility_weight),
            keyframe_db: KeyFrameDatabase::new(),
            pyramid,
            next_map_point_id: 0,
            first_keyframe: None,
            keyframes_inserted: 0,
        }
    }

    pub fn from_config(config: &SlamConfig) -> Self {
        Self::new(config.pyramid(), config.min_covisibility_weight)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────────

    /// Take ownership of a keyframe and link the associations it arrived with.
    ///
    /// Associations to points that no longer exist, or that would give a point
    /// two observations from this keyframe, are dropped. Returns the number of
    /// features linked. Covisibility is left for [`Map::update_connections`].
    pub fn insert_keyframe(&mut self, mut kf: KeyFrame) -> Result<usize> {
        let kf_id = kf.id;
        if self.keyframes.contains_key(&kf_id) {
            return Err(SlamError::DuplicateKeyFrame(kf_id));
        }

        let pending: Vec<(usize, MapPointId)> = kf
            .features
            .iter_mut()
            .enumerate()
            .filter_map(|(i, f)| f.map_point.take().map(|mp| (i, mp)))
            .collect();

        if let Some(bow) = &kf.bow {
            self.keyframe_db.add(kf_id, bow.clone());
        }
        self.keyframes.insert(kf_id, kf);
        self.covisibility.add_node(kf_id);
        if self.first_keyframe.is_none() {
            self.first_keyframe = Some(kf_id);
        }
        self.keyframes_inserted += 1;

        let linked = pending
            .into_iter()
            .filter(|&(idx, mp_id)| self.associate(kf_id, idx, mp_id))
            .count();
        Ok(linked)
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    /// All keyframe ids in ascending order.
    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<_> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn first_keyframe(&self) -> Option<KeyFrameId> {
        self.first_keyframe
    }

    pub fn keyframes_inserted(&self) -> u64 {
        self.keyframes_inserted
    }

    pub fn set_keyframe_pose(&mut self, id: KeyFrameId, pose: SE3) -> bool {
        match self.keyframes.get_mut(&id) {
            Some(kf) => {
                kf.pose = pose;
                true
            }
            None => false,
        }
    }

    /// Store a keyframe's bag-of-words vector and index it for relocalization.
    pub fn set_keyframe_bow(&mut self, id: KeyFrameId, bow: BowVector) -> bool {
        match self.keyframes.get_mut(&id) {
            Some(kf) => {
                kf.bow = Some(bow.clone());
                self.keyframe_db.add(id, bow);
                true
            }
            None => false,
        }
    }

    /// Remove a keyframe and every reference to it.
    ///
    /// Points it was the last observer of are purged; the rest get their
    /// geometry refreshed (and a new reference keyframe if needed).
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) -> Option<KeyFrame> {
        let kf = self.keyframes.remove(&kf_id)?;

        let associated: Vec<MapPointId> = kf.map_point_indices().map(|(_, mp)| mp).collect();
        for mp_id in associated {
            self.detach_observation(mp_id, kf_id);
        }

        self.covisibility.remove_node(kf_id);
        self.keyframe_db.erase(kf_id);

        if self.first_keyframe == Some(kf_id) {
            self.first_keyframe = self.keyframes.keys().min().copied();
        }

        Some(kf)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an unobserved point. Link it with [`Map::associate`] right away:
    /// points without observations are purged by the next cascade.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_map_point_id);
        self.next_map_point_id += 1;
        let mp = MapPoint::new(id, position, descriptor, reference_kf, self.keyframes_inserted);
        self.map_points.insert(id, mp);
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    pub fn set_map_point_position(&mut self, id: MapPointId, position: Vector3<f64>) -> bool {
        match self.map_points.get_mut(&id) {
            Some(mp) => {
                mp.position = position;
                true
            }
            None => false,
        }
    }

    /// Remove a point, clear every feature referencing it and refresh the
    /// connections of its former observers.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) -> bool {
        let mp = match self.map_points.remove(&mp_id) {
            Some(mp) => mp,
            None => return false,
        };

        let observers: Vec<KeyFrameId> = mp.observations.keys().copied().collect();
        for (kf_id, idx) in &mp.observations {
            if let Some(kf) = self.keyframes.get_mut(kf_id) {
                if kf.get_map_point(*idx) == Some(mp_id) {
                    kf.erase_map_point(*idx);
                }
            }
        }
        for kf_id in observers {
            self.update_connections(kf_id);
        }
        true
    }

    /// Union of the points observed by `kf_ids`, ascending.
    pub fn map_points_of(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let set: HashSet<MapPointId> = kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.map_point_indices().map(|(_, mp)| mp))
            .collect();
        let mut ids: Vec<_> = set.into_iter().collect();
        ids.sort();
        ids
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Link feature `feature_idx` of `kf_id` with `mp_id` in both directions.
    ///
    /// Fails if either side is missing or the point is already observed by this
    /// keyframe through another feature. A different point previously attached
    /// to the feature is unlinked first.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let current = match self.keyframes.get(&kf_id) {
            Some(kf) if feature_idx < kf.num_features() => kf.get_map_point(feature_idx),
            _ => return false,
        };
        let mp = match self.map_points.get(&mp_id) {
            Some(mp) => mp,
            None => return false,
        };

        if let Some(&existing) = mp.observations.get(&kf_id) {
            return existing == feature_idx && current == Some(mp_id);
        }

        if current.is_some() {
            self.unlink(kf_id, feature_idx);
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        true
    }

    /// Unlink one feature and refresh the keyframe's connections.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.unlink(kf_id, feature_idx)?;
        self.update_connections(kf_id);
        Some(mp_id)
    }

    /// Both sides of one association, without touching covisibility.
    fn unlink(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        self.detach_observation(mp_id, kf_id);
        Some(mp_id)
    }

    /// Drop `kf_id` from a point's observers; purge or refresh the point.
    fn detach_observation(&mut self, mp_id: MapPointId, kf_id: KeyFrameId) {
        let (remaining, was_reference) = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                (mp.num_observations(), mp.reference_kf == kf_id)
            }
            None => return,
        };

        if remaining == 0 {
            self.map_points.remove(&mp_id);
            return;
        }

        if was_reference {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                if let Some(new_ref) = mp.observations.keys().min().copied() {
                    mp.reference_kf = new_ref;
                }
            }
        }
        self.update_map_point_geometry(mp_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Derived state
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute covisibility weights of `kf_id` against every keyframe sharing a point.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let kf = match self.keyframes.get(&kf_id) {
            Some(kf) => kf,
            None => return,
        };

        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.map_point_indices() {
            if let Some(mp) = self.map_points.get(&mp_id) {
                for other in mp.observations.keys() {
                    if *other != kf_id {
                        *counts.entry(*other).or_insert(0) += 1;
                    }
                }
            }
        }

        self.covisibility.set_connections(kf_id, &counts);
    }

    /// Refresh normal, distance range and representative descriptor of a point.
    pub fn update_map_point_geometry(&mut self, mp_id: MapPointId) {
        let mp = match self.map_points.get(&mp_id) {
            Some(mp) => mp,
            None => return,
        };

        let mut centers = Vec::with_capacity(mp.observations.len());
        let mut descriptors = Vec::with_capacity(mp.observations.len());
        let mut reference: Option<(Vector3<f64>, usize)> = None;

        let mut observers: Vec<(&KeyFrameId, &usize)> = mp.observations.iter().collect();
        observers.sort();
        for (kf_id, idx) in observers {
            let kf = match self.keyframes.get(kf_id) {
                Some(kf) => kf,
                None => continue,
            };
            let feature = match kf.features.get(*idx) {
                Some(f) => f,
                None => continue,
            };
            centers.push(kf.camera_center());
            descriptors.push(feature.descriptor);
            if *kf_id == mp.reference_kf || reference.is_none() {
                reference = Some((kf.camera_center(), feature.level));
            }
        }

        let (ref_center, ref_level) = match reference {
            Some(r) => r,
            None => return,
        };

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.into_iter(), &ref_center, ref_level, &self.pyramid);
            mp.update_descriptor(&descriptors);
        }
    }

    pub fn covisibility(&self) -> &CovisibilityGraph {
        &self.covisibility
    }

    pub fn best_covisibles(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.covisibility.best_neighbors(kf_id, n)
    }

    pub fn keyframe_db(&self) -> &KeyFrameDatabase {
        &self.keyframe_db
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    /// Median depth of the keyframe's points in its camera frame.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let t_cw = kf.pose_cw();
        let mut depths: Vec<f64> = kf
            .map_point_indices()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .map(|mp| t_cw.transform_point(&mp.position).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(depths[(depths.len() - 1) / 2])
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Whole-map operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MapSnapshot {
        let mut keyframes: Vec<KeyFrameView> = self
            .keyframes
            .values()
            .map(|kf| KeyFrameView {
                id: kf.id,
                pose: kf.pose,
                num_map_points: kf.num_map_points(),
            })
            .collect();
        keyframes.sort_by_key(|k| k.id);

        let mut points: Vec<PointView> = self
            .map_points
            .values()
            .map(|mp| PointView {
                id: mp.id,
                position: mp.position,
                reference_kf: mp.reference_kf,
                num_observations: mp.num_observations(),
            })
            .collect();
        points.sort_by_key(|p| p.id);

        MapSnapshot {
            keyframes,
            points,
            covisibility_edges: self.covisibility.edges(),
        }
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.covisibility.clear();
        self.keyframe_db.clear();
        self.first_keyframe = None;
        self.keyframes_inserted = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty() && self.map_points.is_empty()
    }

    /// Every broken cross-reference, described. Empty for a consistent map.
    pub fn integrity_violations(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for kf in self.keyframes.values() {
            for (idx, mp_id) in kf.map_point_indices() {
                match self.map_points.get(&mp_id) {
                    None => issues.push(format!("{} feature {} references missing {}", kf.id, idx, mp_id)),
                    Some(mp) => {
                        if mp.observations.get(&kf.id) != Some(&idx) {
                            issues.push(format!("{} does not list {} at feature {}", mp_id, kf.id, idx));
                        }
                    }
                }
            }
        }

        let mut shared: HashMap<(KeyFrameId, KeyFrameId), usize> = HashMap::new();
        for mp in self.map_points.values() {
            if mp.observations.is_empty() {
                issues.push(format!("{} has no observations", mp.id));
            }
            for (kf_id, idx) in &mp.observations {
                match self.keyframes.get(kf_id) {
                    None => issues.push(format!("{} observed by missing {}", mp.id, kf_id)),
                    Some(kf) => {
                        if kf.get_map_point(*idx) != Some(mp.id) {
                            issues.push(format!("{} feature {} does not reference {}", kf_id, idx, mp.id));
                        }
                    }
                }
            }
            let mut observers: Vec<KeyFrameId> = mp.observations.keys().copied().collect();
            observers.sort();
            for (i, a) in observers.iter().enumerate() {
                for b in &observers[i + 1..] {
                    *shared.entry((*a, *b)).or_insert(0) += 1;
                }
            }
        }

        let min_weight = self.covisibility.min_weight();
        let mut expected: Vec<(KeyFrameId, KeyFrameId, usize)> = shared
            .into_iter()
            .filter(|(_, w)| *w >= min_weight)
            .map(|((a, b), w)| (a, b, w))
            .collect();
        expected.sort();
        let actual = self.covisibility.edges();
        if expected != actual {
            issues.push(format!(
                "covisibility graph out of date: expected {:?}, found {:?}",
                expected, actual
            ));
        }

        for kf_id in self.keyframes.keys() {
            if !self.covisibility.contains(*kf_id) {
                issues.push(format!("{} missing from covisibility graph", kf_id));
            }
        }
        if self.covisibility.num_nodes() != self.keyframes.len() {
            issues.push("covisibility graph has nodes for removed keyframes".to_string());
        }

        for kf_id in self.keyframe_db.indexed_keyframes() {
            if !self.keyframes.contains_key(&kf_id) {
                issues.push(format!("keyframe database references missing {}", kf_id));
            }
        }

        issues
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .field("covisibility_edges", &self.covisibility.num_edges())
            .field("indexed", &self.keyframe_db.len())
            .finish()
    }
}
