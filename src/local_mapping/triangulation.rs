//! New map points from the current keyframe and its covisible neighbors.
//!
//! For every neighbor with enough baseline, unassociated features are matched
//! under the epipolar constraint and each correspondence must pass, in order:
//! 1. parallax between the two viewing rays above the minimum
//! 2. finite DLT triangulation
//! 3. positive depth in both cameras
//! 4. reprojection error within `chi2 * sigma²(level)` in both views
//! 5. scale consistency: `(scale2 / scale1) / (dist2 / dist1)` inside the band

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::camera::Camera;
use crate::config::{ScalePyramid, SlamConfig};
use crate::geometry::{reprojection_error_sq, triangulate_dlt, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matcher::Matcher;

#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    pub num_neighbors: usize,
    /// Neighbor pairs with fewer putative matches are skipped.
    pub min_matches: usize,
    pub min_baseline_ratio: f64,
    pub min_parallax_cos: f64,
    pub chi2_threshold: f64,
    pub min_scale_ratio: f64,
    pub max_scale_ratio: f64,
}

impl TriangulationConfig {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            num_neighbors: config.num_triangulation_neighbors,
            min_matches: config.tri_min_matches,
            min_baseline_ratio: config.min_baseline_ratio,
            min_parallax_cos: config.min_parallax_cos(),
            chi2_threshold: config.chi2_threshold,
            min_scale_ratio: config.min_scale_ratio,
            max_scale_ratio: config.max_scale_ratio,
        }
    }
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self::from_config(&SlamConfig::default())
    }
}

/// Why a correspondence did not become a map point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Parallax,
    Degenerate,
    Depth,
    Reprojection,
    ScaleConsistency,
}

/// One side of a correspondence.
#[derive(Debug, Clone, Copy)]
pub struct View {
    /// Camera to world.
    pub pose: SE3,
    pub pixel: Vector2<f64>,
    pub level: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriangulationResult {
    /// Points created, in creation order.
    pub created: Vec<MapPointId>,
    pub num_pairs_checked: usize,
    pub num_pairs_skipped: usize,
    pub num_matches_found: usize,
    pub num_rejected: usize,
}

impl TriangulationResult {
    pub fn num_new_points(&self) -> usize {
        self.created.len()
    }
}

/// Baseline over the neighbor's median scene depth clears the minimum.
pub fn has_enough_baseline(baseline: f64, median_depth: f64, min_ratio: f64) -> bool {
    median_depth > 0.0 && baseline / median_depth >= min_ratio
}

/// `(scale2 / scale1) / (dist2 / dist1)`, or `None` for a point on a camera center.
pub fn scale_consistency_ratio(scale1: f64, scale2: f64, dist1: f64, dist2: f64) -> Option<f64> {
    if dist1 <= 0.0 || dist2 <= 0.0 {
        return None;
    }
    Some((scale2 / scale1) / (dist2 / dist1))
}

/// Run every gate on one correspondence.
pub fn triangulate_views(
    camera: &Camera,
    pyramid: &ScalePyramid,
    v1: &View,
    v2: &View,
    config: &TriangulationConfig,
) -> Result<Vector3<f64>, Rejection> {
    let ray1 = camera.unproject(&v1.pixel);
    let ray2 = camera.unproject(&v2.pixel);

    let world_ray1 = v1.pose.rotation * ray1;
    let world_ray2 = v2.pose.rotation * ray2;
    let cos_parallax = world_ray1.dot(&world_ray2) / (world_ray1.norm() * world_ray2.norm());
    if cos_parallax >= config.min_parallax_cos {
        return Err(Rejection::Parallax);
    }

    let t1_cw = v1.pose.inverse();
    let t2_cw = v2.pose.inverse();
    let point = triangulate_dlt(&ray1, &ray2, &t1_cw, &t2_cw).ok_or(Rejection::Degenerate)?;

    if t1_cw.transform_point(&point).z <= 0.0 || t2_cw.transform_point(&point).z <= 0.0 {
        return Err(Rejection::Depth);
    }

    for (t_cw, view) in [(&t1_cw, v1), (&t2_cw, v2)] {
        let err2 = reprojection_error_sq(camera, t_cw, &point, &view.pixel).ok_or(Rejection::Depth)?;
        if err2 > config.chi2_threshold * pyramid.sigma2(view.level) {
            return Err(Rejection::Reprojection);
        }
    }

    let dist1 = (point - v1.pose.translation).norm();
    let dist2 = (point - v2.pose.translation).norm();
    let ratio = scale_consistency_ratio(pyramid.scale(v1.level), pyramid.scale(v2.level), dist1, dist2)
        .ok_or(Rejection::ScaleConsistency)?;
    if ratio < config.min_scale_ratio || ratio > config.max_scale_ratio {
        return Err(Rejection::ScaleConsistency);
    }

    Ok(point)
}

/// Triangulate new points between `kf_id` and its best covisible neighbors,
/// linking each to both contributing features.
pub fn triangulate_new_points(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &Camera,
    matcher: &dyn Matcher,
    config: &TriangulationConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();
    let neighbors = map.best_covisibles(kf_id, config.num_neighbors);
    let mut touched = Vec::new();

    for nb_id in neighbors {
        let accepted = {
            let (current, neighbor) = match (map.get_keyframe(kf_id), map.get_keyframe(nb_id)) {
                (Some(c), Some(n)) => (c, n),
                _ => continue,
            };

            let baseline = (neighbor.camera_center() - current.camera_center()).norm();
            let median_depth = map.scene_median_depth(nb_id).unwrap_or(0.0);
            if !has_enough_baseline(baseline, median_depth, config.min_baseline_ratio) {
                result.num_pairs_skipped += 1;
                continue;
            }

            let matches = matcher.search_for_triangulation(neighbor, current, camera, map.pyramid());
            let pairs: Vec<(usize, usize)> = matches
                .iter()
                .enumerate()
                .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
                .collect();
            result.num_pairs_checked += 1;
            result.num_matches_found += pairs.len();
            if pairs.len() < config.min_matches {
                continue;
            }

            let mut accepted = Vec::new();
            let mut used = HashSet::new();
            for (i1, i2) in pairs {
                if !used.insert(i2) {
                    continue;
                }
                let f1 = &neighbor.features[i1];
                let f2 = &current.features[i2];
                let v1 = View {
                    pose: neighbor.pose,
                    pixel: f1.pixel,
                    level: f1.level,
                };
                let v2 = View {
                    pose: current.pose,
                    pixel: f2.pixel,
                    level: f2.level,
                };
                match triangulate_views(camera, map.pyramid(), &v1, &v2, config) {
                    Ok(point) => accepted.push((i1, i2, point, f2.descriptor)),
                    Err(_) => result.num_rejected += 1,
                }
            }
            accepted
        };

        for (i1, i2, point, descriptor) in accepted {
            let mp_id = map.create_map_point(point, descriptor, kf_id);
            let linked = map.associate(kf_id, i2, mp_id) && map.associate(nb_id, i1, mp_id);
            if !linked {
                map.erase_map_point(mp_id);
                continue;
            }
            map.update_map_point_geometry(mp_id);
            result.created.push(mp_id);
        }
        touched.push(nb_id);
    }

    if !result.created.is_empty() {
        map.update_connections(kf_id);
        for nb_id in touched {
            map.update_connections(nb_id);
        }
    }

    debug!(
        "[Triangulation] {}: {} new points from {} pairs ({} skipped, {} matches, {} rejected)",
        kf_id,
        result.created.len(),
        result.num_pairs_checked,
        result.num_pairs_skipped,
        result.num_matches_found,
        result.num_rejected
    );
    result
}
