//! KeyFrame - a frame permanently retained in the map.
//!
//! A KeyFrame is built from a promoted [`Frame`] and owned by the [`Map`](super::Map)
//! once inserted. Its features keep their order from the frame; each may
//! reference one [`MapPoint`](super::MapPoint) by id. Covisibility edges are
//! not stored here but in the [`CovisibilityGraph`](super::CovisibilityGraph).

use nalgebra::Vector3;

use crate::error::{Result, SlamError};
use crate::frame::{Descriptor, Feature, Frame};
use crate::geometry::SE3;
use crate::vocabulary::BowVector;

use super::types::{FrameId, KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Frame this keyframe was promoted from.
    pub frame_id: FrameId,

    /// Seconds, when known.
    pub timestamp: Option<f64>,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    /// Features in frame order, with their map point associations.
    pub features: Vec<Feature>,

    /// Bag-of-words summary used by the keyframe database.
    pub bow: Option<BowVector>,
}

impl KeyFrame {
    /// Convert a promoted frame. Frames that were never promoted are rejected.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        if !frame.is_keyframe() {
            return Err(SlamError::NotAKeyframe(frame.id));
        }
        Ok(Self {
            id: KeyFrameId::from(frame.id),
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pose: frame.pose,
            features: frame.features,
            bow: frame.bow,
        })
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World to camera (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.features.iter().map(|f| f.descriptor).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.features.get(feature_idx).and_then(|f| f.map_point)
    }

    /// Set the association of a feature, returning the previous one.
    pub(crate) fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        self.features
            .get_mut(feature_idx)
            .and_then(|f| f.map_point.replace(mp_id))
    }

    pub(crate) fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.features.get_mut(feature_idx).and_then(|f| f.map_point.take())
    }

    /// `(feature index, map point)` for every associated feature.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.features
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.map_point.map(|mp| (i, mp)))
    }

    pub fn num_map_points(&self) -> usize {
        self.features.iter().filter(|f| f.map_point.is_some()).count()
    }

    /// Indices of features within `radius` of `(u, v)`, optionally level-bounded.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        crate::frame::frame::features_in_area(&self.features, u, v, radius, min_level, max_level)
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("has_bow", &self.bow.is_some())
            .finish()
    }
}
