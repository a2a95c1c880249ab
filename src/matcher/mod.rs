//! Descriptor correspondence search.
//!
//! [`Matcher`] is the seam Tracking and LocalMapping use to find feature
//! correspondences. [`OrbMatcher`] is a brute-force Hamming implementation
//! gated by search windows, pyramid levels, the nearest-neighbor ratio test
//! and, for triangulation, the epipolar constraint.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use nalgebra::{Vector2, Vector3};

use crate::camera::Camera;
use crate::config::ScalePyramid;
use crate::frame::{hamming_distance, Descriptor, Feature, Frame};
use crate::geometry::so3::skew;
use crate::map::{KeyFrame, MapPointId};

/// Max descriptor distance for a match.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold used where wrong matches are expensive.
pub const TH_LOW: u32 = 50;
/// Best/second-best ratio test.
pub const NN_RATIO: f64 = 0.75;

/// A map point projected into a frame, ready for a windowed search.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedPoint {
    pub map_point: MapPointId,
    pub pixel: Vector2<f64>,
    pub descriptor: Descriptor,
    /// Level the point is expected to appear at.
    pub predicted_level: usize,
}

pub trait Matcher: Send + Sync {
    /// Features within `radius` of `pixel` whose level lies in `levels`.
    fn search_by_radius(
        &self,
        features: &[Feature],
        pixel: &Vector2<f64>,
        radius: f64,
        levels: RangeInclusive<usize>,
    ) -> Vec<usize>;

    /// Unassociated features of `kf1` matched to unassociated features of `kf2`
    /// under the epipolar constraint. Indexed by `kf1` feature; `None` = unmatched.
    fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        camera: &Camera,
        pyramid: &ScalePyramid,
    ) -> Vec<Option<usize>>;

    /// Reference feature -> current feature, searched in a pixel window.
    fn search_for_initialization(&self, reference: &Frame, current: &Frame, window: f64) -> Vec<Option<usize>>;

    /// `(feature index, map point)` pairs for projected points. Features that
    /// already carry a map point are skipped.
    fn search_by_projection(
        &self,
        frame: &Frame,
        candidates: &[ProjectedPoint],
        radius: f64,
        pyramid: &ScalePyramid,
    ) -> Vec<(usize, MapPointId)>;

    /// Window-free descriptor search, used when no pose prior exists.
    fn search_by_descriptors(&self, frame: &Frame, points: &[(MapPointId, Descriptor)]) -> Vec<(usize, MapPointId)>;
}

#[derive(Debug, Clone)]
pub struct OrbMatcher {
    pub th_low: u32,
    pub th_high: u32,
    pub nn_ratio: f64,
}

impl Default for OrbMatcher {
    fn default() -> Self {
        Self {
            th_low: TH_LOW,
            th_high: TH_HIGH,
            nn_ratio: NN_RATIO,
        }
    }
}

/// Best and second-best distance with the best index.
#[derive(Debug, Clone, Copy)]
struct BestTwo {
    best: u32,
    second: u32,
    idx: Option<usize>,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best: u32::MAX,
            second: u32::MAX,
            idx: None,
        }
    }

    fn offer(&mut self, dist: u32, idx: usize) {
        if dist < self.best {
            self.second = self.best;
            self.best = dist;
            self.idx = Some(idx);
        } else if dist < self.second {
            self.second = dist;
        }
    }

    /// Index of the best candidate if it passes the threshold and ratio test.
    fn accept(&self, threshold: u32, nn_ratio: f64) -> Option<usize> {
        if self.best > threshold {
            return None;
        }
        if self.second != u32::MAX && (self.best as f64) > nn_ratio * self.second as f64 {
            return None;
        }
        self.idx
    }
}

/// Keep one claimant per target, the one with the smallest distance.
fn resolve_one_to_one(claims: Vec<(usize, usize, u32)>) -> HashMap<usize, (usize, u32)> {
    let mut winners: HashMap<usize, (usize, u32)> = HashMap::new();
    for (source, target, dist) in claims {
        match winners.get(&target) {
            Some(&(prev, d)) if d < dist || (d == dist && prev < source) => {}
            _ => {
                winners.insert(target, (source, dist));
            }
        }
    }
    winners
}

impl OrbMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Squared distance of `p2` to the epipolar line of `x1`, in pixels².
    fn epipolar_distance_sq(
        f21: &nalgebra::Matrix3<f64>,
        p1: &Vector2<f64>,
        p2: &Vector2<f64>,
    ) -> Option<f64> {
        let l2 = f21 * Vector3::new(p1.x, p1.y, 1.0);
        let den = l2.x * l2.x + l2.y * l2.y;
        if den < 1e-20 {
            return None;
        }
        let num = l2.dot(&Vector3::new(p2.x, p2.y, 1.0));
        Some(num * num / den)
    }
}

impl Matcher for OrbMatcher {
    fn search_by_radius(
        &self,
        features: &[Feature],
        pixel: &Vector2<f64>,
        radius: f64,
        levels: RangeInclusive<usize>,
    ) -> Vec<usize> {
        crate::frame::frame::features_in_area(
            features,
            pixel.x,
            pixel.y,
            radius,
            Some(*levels.start()),
            Some(*levels.end()),
        )
    }

    fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        camera: &Camera,
        pyramid: &ScalePyramid,
    ) -> Vec<Option<usize>> {
        let mut result = vec![None; kf1.num_features()];

        // T_21 = T_2w * T_w1
        let t21 = kf2.pose_cw().compose(&kf1.pose);
        let k_inv = match camera.k_matrix().try_inverse() {
            Some(k) => k,
            None => return result,
        };
        let essential = skew(&t21.translation) * t21.rotation_matrix();
        let f21 = k_inv.transpose() * essential * k_inv;

        // Points close to the epipole have no parallax.
        let epipole = camera.project(&kf2.pose_cw().transform_point(&kf1.camera_center()));

        let mut claims = Vec::new();
        for (idx1, f1) in kf1.features.iter().enumerate() {
            if f1.map_point.is_some() {
                continue;
            }

            let mut best = BestTwo::new();
            for (idx2, f2) in kf2.features.iter().enumerate() {
                if f2.map_point.is_some() {
                    continue;
                }

                let dist = hamming_distance(&f1.descriptor, &f2.descriptor);
                if dist > self.th_low || dist >= best.best {
                    continue;
                }

                let scale2 = pyramid.scale(f2.level);
                if let Some(e) = &epipole {
                    if (e - f2.pixel).norm_squared() < 100.0 * scale2 * scale2 {
                        continue;
                    }
                }

                match Self::epipolar_distance_sq(&f21, &f1.pixel, &f2.pixel) {
                    Some(d2) if d2 < 3.84 * pyramid.sigma2(f2.level) => best.offer(dist, idx2),
                    _ => {}
                }
            }

            if let Some(idx2) = best.idx.filter(|_| best.best <= self.th_low) {
                claims.push((idx1, idx2, best.best));
            }
        }

        for (idx2, (idx1, _)) in resolve_one_to_one(claims) {
            result[idx1] = Some(idx2);
        }
        result
    }

    fn search_for_initialization(&self, reference: &Frame, current: &Frame, window: f64) -> Vec<Option<usize>> {
        let mut result = vec![None; reference.num_features()];
        let max_level = current.features.iter().map(|f| f.level).max().unwrap_or(0);

        let mut claims = Vec::new();
        for (idx1, f1) in reference.features.iter().enumerate() {
            let mut best = BestTwo::new();
            for idx2 in self.search_by_radius(&current.features, &f1.pixel, window, f1.level..=max_level.max(f1.level)) {
                let f2 = &current.features[idx2];
                if f2.level != f1.level {
                    continue;
                }
                best.offer(hamming_distance(&f1.descriptor, &f2.descriptor), idx2);
            }
            if let Some(idx2) = best.accept(self.th_low, self.nn_ratio) {
                claims.push((idx1, idx2, best.best));
            }
        }

        for (idx2, (idx1, _)) in resolve_one_to_one(claims) {
            result[idx1] = Some(idx2);
        }
        result
    }

    fn search_by_projection(
        &self,
        frame: &Frame,
        candidates: &[ProjectedPoint],
        radius: f64,
        pyramid: &ScalePyramid,
    ) -> Vec<(usize, MapPointId)> {
        let mut claims = Vec::new();
        let top = pyramid.n_levels().saturating_sub(1);

        for (ci, candidate) in candidates.iter().enumerate() {
            let level = candidate.predicted_level;
            let r = radius * pyramid.scale(level);
            let levels = level.saturating_sub(1)..=(level + 1).min(top);

            let mut best = BestTwo::new();
            for idx in self.search_by_radius(&frame.features, &candidate.pixel, r, levels) {
                if frame.features[idx].map_point.is_some() {
                    continue;
                }
                best.offer(hamming_distance(&candidate.descriptor, &frame.features[idx].descriptor), idx);
            }
            if let Some(idx) = best.accept(self.th_high, self.nn_ratio) {
                claims.push((ci, idx, best.best));
            }
        }

        let mut matches: Vec<(usize, MapPointId)> = resolve_one_to_one(claims)
            .into_iter()
            .map(|(idx, (ci, _))| (idx, candidates[ci].map_point))
            .collect();
        matches.sort();
        matches
    }

    fn search_by_descriptors(&self, frame: &Frame, points: &[(MapPointId, Descriptor)]) -> Vec<(usize, MapPointId)> {
        let mut claims = Vec::new();
        for (pi, (_, descriptor)) in points.iter().enumerate() {
            let mut best = BestTwo::new();
            for (idx, f) in frame.features.iter().enumerate() {
                if f.map_point.is_some() {
                    continue;
                }
                best.offer(hamming_distance(descriptor, &f.descriptor), idx);
            }
            if let Some(idx) = best.accept(self.th_low, self.nn_ratio) {
                claims.push((pi, idx, best.best));
            }
        }

        let mut matches: Vec<(usize, MapPointId)> = resolve_one_to_one(claims)
            .into_iter()
            .map(|(idx, (pi, _))| (idx, points[pi].0))
            .collect();
        matches.sort();
        matches
    }
}
