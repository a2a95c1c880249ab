//! Frame - one processed image.
//!
//! Regular frames are owned by Tracking and only the current and previous one
//! are kept. A frame promoted by the keyframe policy is converted into a
//! [`KeyFrame`](crate::map::KeyFrame) and handed to LocalMapping.

use nalgebra::Vector3;

use crate::camera::Camera;
use crate::geometry::SE3;
use crate::map::{FrameId, MapPointId};
use crate::vocabulary::BowVector;

use super::feature::{Descriptor, ExtractedFeature, Feature};

#[derive(Clone)]
pub struct Frame {
    pub id: FrameId,

    /// Seconds, if the image source provides them.
    pub timestamp: Option<f64>,

    /// Camera to world (T_wc).
    pub pose: SE3,

    /// Fixed after construction; only the map point associations change.
    pub features: Vec<Feature>,

    /// Bag-of-words summary, computed on promotion or for relocalization.
    pub bow: Option<BowVector>,

    is_keyframe: bool,
}

impl Frame {
    /// Build a frame from extractor output, undistorting every keypoint.
    pub fn new(
        id: FrameId,
        timestamp: Option<f64>,
        extracted: Vec<ExtractedFeature>,
        camera: &Camera,
    ) -> Self {
        let features = extracted
            .into_iter()
            .map(|f| Feature::new(id, camera.undistort_pixel(&f.keypoint), f.level, f.descriptor))
            .collect();
        Self::from_features(id, timestamp, features)
    }

    /// Build a frame from already undistorted features.
    pub fn from_features(id: FrameId, timestamp: Option<f64>, features: Vec<Feature>) -> Self {
        Self {
            id,
            timestamp,
            pose: SE3::identity(),
            features,
            bow: None,
            is_keyframe: false,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    pub fn promote_to_keyframe(&mut self) {
        self.is_keyframe = true;
    }

    /// World to camera (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.features.iter().map(|f| f.descriptor).collect()
    }

    pub fn map_point(&self, idx: usize) -> Option<MapPointId> {
        self.features.get(idx).and_then(|f| f.map_point)
    }

    pub fn set_map_point(&mut self, idx: usize, mp_id: MapPointId) {
        if let Some(f) = self.features.get_mut(idx) {
            f.map_point = Some(mp_id);
        }
    }

    pub fn clear_map_point(&mut self, idx: usize) {
        if let Some(f) = self.features.get_mut(idx) {
            f.map_point = None;
        }
    }

    pub fn clear_map_points(&mut self) {
        for f in &mut self.features {
            f.map_point = None;
        }
    }

    /// `(feature index, map point)` for every associated feature.
    pub fn tracked_map_points(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.features
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.map_point.map(|mp| (i, mp)))
    }

    pub fn num_tracked(&self) -> usize {
        self.features.iter().filter(|f| f.map_point.is_some()).count()
    }

    /// Indices of features within `radius` of `(u, v)`, optionally level-bounded (inclusive).
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        features_in_area(&self.features, u, v, radius, min_level, max_level)
    }
}

/// Shared by frames and keyframes.
pub(crate) fn features_in_area(
    features: &[Feature],
    u: f64,
    v: f64,
    radius: f64,
    min_level: Option<usize>,
    max_level: Option<usize>,
) -> Vec<usize> {
    let radius_sq = radius * radius;
    features
        .iter()
        .enumerate()
        .filter(|(_, f)| min_level.map_or(true, |min| f.level >= min))
        .filter(|(_, f)| max_level.map_or(true, |max| f.level <= max))
        .filter(|(_, f)| {
            let du = f.pixel.x - u;
            let dv = f.pixel.y - v;
            du * du + dv * dv <= radius_sq
        })
        .map(|(i, _)| i)
        .collect()
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.features.len())
            .field("num_tracked", &self.num_tracked())
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}
