//! Track Local Map: the keyframes and points around the current frame.
//!
//! The local keyframe set is K1 (keyframes observing points already matched
//! in the frame) plus K2 (the best covisible neighbors of every K1 member).
//! Points of that set that pass the frustum test are projected into the
//! frame and handed to the matcher.
//!
//! Tracking never matches against the live map. The fields it needs are
//! copied into a [`PointCache`] inside a short read lock; projection,
//! matching and refinement then run on the copy with the lock released.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::camera::Camera;
use crate::config::{ScalePyramid, SlamConfig};
use crate::frame::{Descriptor, Frame};
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPoint, MapPointId};
use crate::matcher::ProjectedPoint;

/// Slack applied to a point's valid distance range.
const MIN_DISTANCE_SLACK: f64 = 0.8;
const MAX_DISTANCE_SLACK: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct LocalMapParams {
    pub radius: f64,
    pub min_view_cos: f64,
    pub neighbors: usize,
}

impl LocalMapParams {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            radius: config.local_map_radius_px,
            min_view_cos: config.min_view_cos,
            neighbors: config.local_map_neighbors,
        }
    }
}

/// The map point fields Tracking reads.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSnapshot {
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
    pub normal: Vector3<f64>,
    pub min_distance: f64,
    pub max_distance: f64,
    pub num_observations: usize,
}

impl From<&MapPoint> for PointSnapshot {
    fn from(mp: &MapPoint) -> Self {
        Self {
            position: mp.position,
            descriptor: mp.descriptor,
            normal: mp.normal,
            min_distance: mp.min_distance,
            max_distance: mp.max_distance,
            num_observations: mp.num_observations(),
        }
    }
}

/// Copies of map points, keyed by id. Erased points are simply absent.
#[derive(Debug, Clone, Default)]
pub struct PointCache {
    points: HashMap<MapPointId, PointSnapshot>,
}

impl PointCache {
    /// Copy every live point of `ids` not cached yet. Call inside `read_map`.
    pub fn capture(&mut self, map: &Map, ids: impl IntoIterator<Item = MapPointId>) {
        for id in ids {
            if self.points.contains_key(&id) {
                continue;
            }
            if let Some(mp) = map.get_map_point(id) {
                self.points.insert(id, PointSnapshot::from(mp));
            }
        }
    }

    pub fn get(&self, id: MapPointId) -> Option<&PointSnapshot> {
        self.points.get(&id)
    }

    pub fn contains(&self, id: MapPointId) -> bool {
        self.points.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `(id, descriptor)` of the cached points among `ids`, in order.
    pub fn descriptors(&self, ids: &[MapPointId]) -> Vec<(MapPointId, Descriptor)> {
        ids.iter()
            .filter_map(|id| self.points.get(id).map(|p| (*id, p.descriptor)))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    /// K1 first (by vote), then K2.
    pub keyframes: Vec<KeyFrameId>,
    /// K1 member sharing the most points with the frame, and its point count.
    pub reference: Option<(KeyFrameId, usize)>,
    pub points: Vec<MapPointId>,
}

/// Collect the local keyframe set and its points for `frame`.
pub fn build_local_map(map: &Map, frame: &Frame, neighbors: usize) -> LocalMap {
    let mut votes: HashMap<KeyFrameId, usize> = HashMap::new();
    for (_, mp_id) in frame.tracked_map_points() {
        if let Some(mp) = map.get_map_point(mp_id) {
            for kf_id in mp.observations.keys() {
                *votes.entry(*kf_id).or_insert(0) += 1;
            }
        }
    }

    let mut k1: Vec<(KeyFrameId, usize)> = votes.into_iter().collect();
    k1.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let reference = k1
        .first()
        .and_then(|(id, _)| map.get_keyframe(*id).map(|kf| (*id, kf.num_map_points())));

    let mut seen: HashSet<KeyFrameId> = k1.iter().map(|(id, _)| *id).collect();
    let mut keyframes: Vec<KeyFrameId> = k1.iter().map(|(id, _)| *id).collect();
    for (kf_id, _) in &k1 {
        for neighbor in map.best_covisibles(*kf_id, neighbors) {
            if seen.insert(neighbor) {
                keyframes.push(neighbor);
            }
        }
    }

    let points = map.map_points_of(&keyframes);
    LocalMap {
        keyframes,
        reference,
        points,
    }
}

/// Frustum-test the cached `points` against `pose_cw` and project the survivors.
///
/// Points already associated with a feature of `frame`, or missing from the
/// cache, are skipped.
pub fn project_candidates(
    cache: &PointCache,
    frame: &Frame,
    pose_cw: &SE3,
    points: &[MapPointId],
    camera: &Camera,
    pyramid: &ScalePyramid,
    params: &LocalMapParams,
) -> Vec<ProjectedPoint> {
    let matched: HashSet<MapPointId> = frame.tracked_map_points().map(|(_, id)| id).collect();
    let center = pose_cw.inverse().translation;

    points
        .iter()
        .filter(|id| !matched.contains(id))
        .filter_map(|&mp_id| {
            let mp = cache.get(mp_id)?;
            let p_cam = pose_cw.transform_point(&mp.position);
            if p_cam.z <= 0.0 {
                return None;
            }
            let pixel = camera.project(&p_cam)?;
            if !camera.is_in_image(&pixel) {
                return None;
            }

            let ray = mp.position - center;
            let dist = ray.norm();
            if dist < MIN_DISTANCE_SLACK * mp.min_distance || dist > MAX_DISTANCE_SLACK * mp.max_distance {
                return None;
            }
            if mp.normal.norm_squared() > 0.0 && ray.dot(&mp.normal) / dist < params.min_view_cos {
                return None;
            }

            Some(ProjectedPoint {
                map_point: mp_id,
                pixel,
                descriptor: mp.descriptor,
                predicted_level: pyramid.predict_level(dist, mp.max_distance),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    use crate::map::KeyFrame;
    use crate::test_support::{create_test_camera, create_test_pose, SyntheticScene};

    fn insert_keyframe(map: &mut Map, scene: &SyntheticScene, id: u64, pose: &SE3) -> (KeyFrameId, Vec<usize>) {
        let (mut frame, landmark_of) = scene.frame(id, pose);
        frame.promote_to_keyframe();
        let kf = KeyFrame::from_frame(frame).unwrap();
        let kf_id = kf.id;
        map.insert_keyframe(kf).unwrap();
        (kf_id, landmark_of)
    }

    #[test]
    fn test_local_map_collects_covisible_keyframes() {
        let scene = SyntheticScene::new(60, 31);
        let mut map = Map::from_config(&SlamConfig::default());
        let (kf0, lm0) = insert_keyframe(&mut map, &scene, 0, &SE3::identity());
        let (kf1, lm1) = insert_keyframe(&mut map, &scene, 1, &create_test_pose(0.3, 0.0, 0.0));

        let mut point_of = HashMap::new();
        for (idx, lm) in lm0.iter().enumerate() {
            let mp = map.create_map_point(scene.landmarks[*lm], scene.descriptors[*lm], kf0);
            map.associate(kf0, idx, mp);
            point_of.insert(*lm, mp);
        }
        for (idx, lm) in lm1.iter().enumerate() {
            if let Some(mp) = point_of.get(lm) {
                map.associate(kf1, idx, *mp);
            }
        }
        map.update_connections(kf0);
        map.update_connections(kf1);

        // One matched point is enough to pull in both keyframes.
        let (mut frame, landmark_of) = scene.frame(2, &create_test_pose(0.5, 0.0, 0.0));
        let (idx, lm) = landmark_of
            .iter()
            .enumerate()
            .find(|(_, lm)| point_of.contains_key(*lm))
            .unwrap();
        frame.set_map_point(idx, point_of[lm]);

        let local = build_local_map(&map, &frame, 10);
        assert_eq!(local.keyframes.len(), 2);
        let (_, reference_points) = local.reference.unwrap();
        assert_eq!(reference_points, map.get_keyframe(local.reference.unwrap().0).unwrap().num_map_points());
        assert_eq!(local.points.len(), map.num_map_points());
    }

    #[test]
    fn test_frustum_rejects_points_behind_and_outside() {
        let camera = create_test_camera();
        let mut map = Map::from_config(&SlamConfig::default());
        let kf = KeyFrameId::new(0);
        let ahead = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [1; 32], kf);
        let behind = map.create_map_point(Vector3::new(0.0, 0.0, -5.0), [2; 32], kf);
        let outside = map.create_map_point(Vector3::new(50.0, 0.0, 5.0), [3; 32], kf);

        let frame = Frame::from_features(crate::map::FrameId::new(0), None, Vec::new());
        let params = LocalMapParams::from_config(&SlamConfig::default());
        let mut cache = PointCache::default();
        cache.capture(&map, [ahead, behind, outside]);
        let ids = [ahead, behind, outside];
        let projected = project_candidates(&cache, &frame, &SE3::identity(), &ids, &camera, map.pyramid(), &params);

        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].map_point, ahead);
    }

    #[test]
    fn test_point_cache_is_detached_from_map() {
        let mut map = Map::from_config(&SlamConfig::default());
        let kf = KeyFrameId::new(0);
        let kept = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [1; 32], kf);
        let erased = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), [2; 32], kf);
        map.erase_map_point(erased);

        let mut cache = PointCache::default();
        cache.capture(&map, [kept, erased]);
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(erased));

        // Later map edits do not reach the copy.
        map.set_map_point_position(kept, Vector3::new(0.0, 0.0, 9.0));
        assert_eq!(cache.get(kept).unwrap().position, Vector3::new(0.0, 0.0, 5.0));
        assert_eq!(cache.descriptors(&[erased, kept]), vec![(kept, [1; 32])]);
    }
}
