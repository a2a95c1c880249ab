//! Landmarks: world points triangulated by LocalMapping or the bootstrap.
//!
//! A point lists its observing keyframes by id together with the feature
//! index inside each one. Derived from those observations and kept current
//! by the map:
//! - representative descriptor (the observation closest to all others)
//! - mean viewing direction
//! - distance range in which the point is expected to be detectable

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::config::ScalePyramid;
use crate::frame::{hamming_distance, Descriptor};

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// World coordinates.
    pub position: Vector3<f64>,

    /// Representative descriptor.
    pub descriptor: Descriptor,

    /// Observer keyframe -> feature index. One entry per keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Unit mean of the rays from every observer to the point.
    pub normal: Vector3<f64>,

    /// Scale-invariance band: the point is searched for only between these
    /// camera distances.
    pub min_distance: f64,
    pub max_distance: f64,

    /// KeyFrame whose triangulation created the point.
    pub reference_kf: KeyFrameId,

    /// Map keyframe-insertion count at creation.
    pub created_at: u64,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            reference_kf,
            created_at,
        }
    }

    /// Record an observation. Returns false if `kf_id` already observes this point.
    pub(crate) fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> bool {
        if self.observations.contains_key(&kf_id) {
            return false;
        }
        self.observations.insert(kf_id, feature_idx);
        true
    }

    /// Returns the feature index the observation pointed to, if it existed.
    pub(crate) fn erase_observation(&mut self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.remove(&kf_id)
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// Refresh `normal` from the observer centers, and the distance band from
    /// the reference keyframe's center and the level it saw the point at.
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        reference_center: &Vector3<f64>,
        reference_level: usize,
        pyramid: &ScalePyramid,
    ) {
        let ray_sum: Vector3<f64> = observer_centers
            .map(|center| self.position - center)
            .filter_map(|ray| ray.try_normalize(1e-10))
            .sum();
        if let Some(normal) = ray_sum.try_normalize(1e-10) {
            self.normal = normal;
        }

        let dist = (self.position - reference_center).norm();
        self.max_distance = dist * pyramid.scale(reference_level);
        self.min_distance = self.max_distance / pyramid.max_scale();
    }

    /// Pick the descriptor with the smallest summed distance to all others.
    pub fn update_descriptor(&mut self, descriptors: &[Descriptor]) {
        if descriptors.is_empty() {
            return;
        }

        let best = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let total: u32 = descriptors
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| hamming_distance(d, other))
                    .sum();
                (total, i)
            })
            .min()
            .map(|(_, i)| i)
            .unwrap_or(0);

        self.descriptor = descriptors[best];
    }

    /// `distance` lies inside the scale-invariance band.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Pyramid level at which the point should appear from `distance`.
    pub fn predict_level(&self, distance: f64, pyramid: &ScalePyramid) -> usize {
        pyramid.predict_level(distance, self.max_distance)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("reference_kf", &self.reference_kf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            [0; 32],
            KeyFrameId::new(0),
            0,
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = create_test_mappoint();

        assert!(mp.add_observation(KeyFrameId::new(1), 5));
        assert!(mp.add_observation(KeyFrameId::new(2), 10));
        // Second observation from the same keyframe is refused.
        assert!(!mp.add_observation(KeyFrameId::new(1), 6));

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));

        assert_eq!(mp.erase_observation(KeyFrameId::new(1)), Some(5));
        assert_eq!(mp.erase_observation(KeyFrameId::new(1)), None);
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_update_normal_and_depth() {
        let mut mp = create_test_mappoint();
        let pyramid = ScalePyramid::from_factors(&[1.0, 1.2, 1.44]);
        let centers = [Vector3::new(-1.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];

        mp.update_normal_and_depth(centers.iter().copied(), &Vector3::zeros(), 1, &pyramid);

        assert_relative_eq!(mp.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(mp.max_distance, 4.0 * 1.2, epsilon = 1e-12);
        assert_relative_eq!(mp.min_distance, 4.0 * 1.2 / 1.44, epsilon = 1e-12);
        assert!(mp.is_in_distance_range(4.0));
        assert!(!mp.is_in_distance_range(2.0));
    }

    #[test]
    fn test_update_descriptor_picks_median() {
        let mut mp = create_test_mappoint();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let mut c = [0u8; 32];
        a[0] = 0b0000_0001;
        b[0] = 0b0000_0011;
        c[0] = 0b0000_0111;

        mp.update_descriptor(&[a, c, b]);
        assert_eq!(mp.descriptor, b);
    }

    #[test]
    fn test_distance_range() {
        let mut mp = create_test_mappoint();
        mp.min_distance = 0.5;
        mp.max_distance = 10.0;

        assert!(mp.is_in_distance_range(1.0));
        assert!(!mp.is_in_distance_range(0.3));
        assert!(!mp.is_in_distance_range(15.0));
    }
}
