//! Local Bundle Adjustment over the covisibility neighborhood of a keyframe.
//!
//! Runs in three phases so the map lock is never held while solving:
//!
//! 1. [`collect_local_ba`] - read lock: snapshot poses, points, observations
//! 2. [`solve_local_ba`] - no lock: Levenberg-Marquardt with a Schur
//!    complement over the point blocks
//! 3. [`apply_local_ba`] - write lock: write back poses and points, unlink
//!    observations that ended up as outliers
//!
//! Optimized: the current keyframe and its best covisible neighbors. Fixed:
//! the map's first keyframe and every other keyframe observing a local point.
//!
//! Pose updates are left perturbations of `T_cw` (see [`SE3::retract`]),
//! point updates are additive.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::camera::Camera;
use crate::config::SlamConfig;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};

use super::pose_only::{pose_jacobian, reprojection_residual};
use super::robust::{huber_cost, huber_weight};

#[derive(Debug, Clone)]
pub struct LocalBAConfig {
    pub num_neighbors: usize,
    pub max_points: usize,
    pub max_iterations: usize,
    pub huber_delta: f64,
    pub chi2_threshold: f64,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 10,
            max_points: 2000,
            max_iterations: 10,
            huber_delta: 5.991_f64.sqrt(),
            chi2_threshold: 5.991,
        }
    }
}

impl LocalBAConfig {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            num_neighbors: config.local_map_neighbors,
            max_points: config.local_ba_max_points,
            max_iterations: config.local_ba_iterations,
            huber_delta: config.huber_delta,
            chi2_threshold: config.chi2_threshold,
        }
    }
}

/// One keyframe-to-point measurement.
#[derive(Debug, Clone)]
pub struct BAObservation {
    pub kf_id: KeyFrameId,
    pub feature_idx: usize,
    pub mp_id: MapPointId,
    pub pixel: Vector2<f64>,
    pub inv_sigma2: f64,
}

/// Snapshot of everything the solver needs.
#[derive(Debug, Clone)]
pub struct LocalBAProblem {
    pub current_kf: KeyFrameId,
    /// Keyframes whose poses are optimized.
    pub optimized_kf_ids: Vec<KeyFrameId>,
    /// T_cw for every keyframe referenced by an observation.
    pub poses_cw: HashMap<KeyFrameId, SE3>,
    pub mp_ids: Vec<MapPointId>,
    pub positions: HashMap<MapPointId, Vector3<f64>>,
    pub observations: Vec<BAObservation>,
}

#[derive(Debug, Clone)]
pub struct LocalBAResult {
    /// Refined T_cw of the optimized keyframes.
    pub poses_cw: HashMap<KeyFrameId, SE3>,
    pub positions: HashMap<MapPointId, Vector3<f64>>,
    /// `(keyframe, feature, point)` observations rejected after solving.
    pub outliers: Vec<(KeyFrameId, usize, MapPointId)>,
    pub iterations: usize,
    /// Robust cost before and after.
    pub initial_cost: f64,
    pub final_cost: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 1: collect
// ─────────────────────────────────────────────────────────────────────────────

pub fn collect_local_ba(map: &Map, current_kf: KeyFrameId, config: &LocalBAConfig) -> Option<LocalBAProblem> {
    map.get_keyframe(current_kf)?;

    let mut local_kfs = vec![current_kf];
    local_kfs.extend(map.best_covisibles(current_kf, config.num_neighbors));
    let local_set: HashSet<KeyFrameId> = local_kfs.iter().copied().collect();

    let mut mp_ids = map.map_points_of(&local_kfs);
    if mp_ids.is_empty() {
        return None;
    }
    if mp_ids.len() > config.max_points {
        // Keep the newest points.
        mp_ids = mp_ids.split_off(mp_ids.len() - config.max_points);
    }

    let anchor = map.first_keyframe();
    let optimized_kf_ids: Vec<KeyFrameId> = local_kfs
        .iter()
        .copied()
        .filter(|id| Some(*id) != anchor)
        .collect();

    let pyramid = map.pyramid();
    let mut positions = HashMap::with_capacity(mp_ids.len());
    let mut poses_cw = HashMap::new();
    let mut observations = Vec::new();

    for &mp_id in &mp_ids {
        let mp = map.get_map_point(mp_id)?;
        positions.insert(mp_id, mp.position);

        let mut observers: Vec<(&KeyFrameId, &usize)> = mp.observations.iter().collect();
        observers.sort();
        for (kf_id, &feature_idx) in observers {
            let kf = match map.get_keyframe(*kf_id) {
                Some(kf) => kf,
                None => continue,
            };
            let feature = match kf.features.get(feature_idx) {
                Some(f) => f,
                None => continue,
            };
            poses_cw.entry(*kf_id).or_insert_with(|| kf.pose_cw());
            observations.push(BAObservation {
                kf_id: *kf_id,
                feature_idx,
                mp_id,
                pixel: feature.pixel,
                inv_sigma2: pyramid.inv_sigma2(feature.level),
            });
        }
    }

    if observations.is_empty() {
        return None;
    }

    let num_fixed = poses_cw.keys().filter(|id| !local_set.contains(id) || Some(**id) == anchor).count();
    debug!(
        "[LocalBA] Collected {} optimized KFs, {} fixed KFs, {} points, {} observations",
        optimized_kf_ids.len(),
        num_fixed,
        mp_ids.len(),
        observations.len()
    );

    Some(LocalBAProblem {
        current_kf,
        optimized_kf_ids,
        poses_cw,
        mp_ids,
        positions,
        observations,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 2: solve
// ─────────────────────────────────────────────────────────────────────────────

struct SolverState {
    poses: Vec<SE3>,
    points: Vec<Vector3<f64>>,
}

/// Observation with resolved parameter indices.
struct Edge {
    /// Index into `LocalBAProblem::observations`.
    obs_idx: usize,
    pose_idx: Option<usize>,
    fixed_pose: Option<SE3>,
    point_idx: usize,
    pixel: Vector2<f64>,
    inv_sigma2: f64,
}

impl Edge {
    fn pose(&self, state: &SolverState) -> Option<SE3> {
        match self.pose_idx {
            Some(i) => state.poses.get(i).copied(),
            None => self.fixed_pose,
        }
    }

    fn chi2(&self, camera: &Camera, state: &SolverState) -> Option<f64> {
        let pose = self.pose(state)?;
        let (e, _) = reprojection_residual(camera, &pose, &state.points[self.point_idx], &self.pixel)?;
        Some(e.norm_squared() * self.inv_sigma2)
    }
}

/// Points behind a camera contribute this chi² so the step is rejected.
const BEHIND_CAMERA_CHI2: f64 = 1e6;

fn total_cost(edges: &[Edge], camera: &Camera, state: &SolverState, delta: f64) -> f64 {
    edges
        .iter()
        .map(|e| huber_cost(e.chi2(camera, state).unwrap_or(BEHIND_CAMERA_CHI2), delta))
        .sum()
}

/// Jacobian of the reprojection error w.r.t. the world point.
fn point_jacobian(camera: &Camera, t_cw: &SE3, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
    let invz = 1.0 / p_cam.z;
    let tmp = Matrix2x3::new(
        camera.fx,
        0.0,
        -camera.fx * p_cam.x * invz,
        0.0,
        camera.fy,
        -camera.fy * p_cam.y * invz,
    );
    (-invz) * tmp * t_cw.rotation_matrix()
}

/// One damped Gauss-Newton step via the Schur complement.
///
/// Returns the pose and point increments, or `None` if the reduced system is singular.
fn damped_step(
    edges: &[Edge],
    camera: &Camera,
    state: &SolverState,
    lambda: f64,
    delta: f64,
) -> Option<(Vec<Vector6<f64>>, Vec<Vector3<f64>>)> {
    let n_poses = state.poses.len();
    let n_points = state.points.len();

    let mut h_pp = DMatrix::<f64>::zeros(6 * n_poses, 6 * n_poses);
    let mut b_p = DVector::<f64>::zeros(6 * n_poses);
    let mut h_ll = vec![Matrix3::<f64>::zeros(); n_points];
    let mut b_l = vec![Vector3::<f64>::zeros(); n_points];
    // (pose, point) -> H_pl block
    let mut h_pl: HashMap<(usize, usize), Matrix6x3<f64>> = HashMap::new();

    for edge in edges {
        let pose = match edge.pose(state) {
            Some(p) => p,
            None => continue,
        };
        let point = &state.points[edge.point_idx];
        let (e, p_cam) = match reprojection_residual(camera, &pose, point, &edge.pixel) {
            Some(r) => r,
            None => continue,
        };
        let chi2 = e.norm_squared() * edge.inv_sigma2;
        let w = huber_weight(chi2, delta) * edge.inv_sigma2;

        let j_l = point_jacobian(camera, &pose, &p_cam);
        h_ll[edge.point_idx] += j_l.transpose() * j_l * w;
        b_l[edge.point_idx] -= j_l.transpose() * e * w;

        if let Some(pi) = edge.pose_idx {
            let j_p = pose_jacobian(camera, &p_cam);
            let block = j_p.transpose() * j_p * w;
            let mut view = h_pp.fixed_view_mut::<6, 6>(6 * pi, 6 * pi);
            view += block;
            let g = j_p.transpose() * e * w;
            let mut b_view = b_p.fixed_view_mut::<6, 1>(6 * pi, 0);
            b_view -= g;
            *h_pl.entry((pi, edge.point_idx)).or_insert_with(Matrix6x3::zeros) += j_p.transpose() * j_l * w;
        }
    }

    for i in 0..6 * n_poses {
        h_pp[(i, i)] += lambda * h_pp[(i, i)].max(1e-6);
    }
    let mut h_ll_inv = Vec::with_capacity(n_points);
    for h in h_ll.iter_mut() {
        for k in 0..3 {
            h[(k, k)] += lambda * h[(k, k)].max(1e-6);
        }
        h_ll_inv.push(h.try_inverse().unwrap_or_else(Matrix3::zeros));
    }

    // Blocks grouped per point for the reduction.
    let mut per_point: Vec<Vec<(usize, Matrix6x3<f64>)>> = vec![Vec::new(); n_points];
    for ((pi, li), block) in &h_pl {
        per_point[*li].push((*pi, *block));
    }

    let mut schur = h_pp;
    let mut rhs = b_p;
    for (li, blocks) in per_point.iter().enumerate() {
        let inv = &h_ll_inv[li];
        for (pi, w_i) in blocks {
            let w_inv = w_i * inv;
            let mut r = rhs.fixed_view_mut::<6, 1>(6 * pi, 0);
            r -= w_inv * b_l[li];
            for (pk, w_k) in blocks {
                let mut s = schur.fixed_view_mut::<6, 6>(6 * pi, 6 * pk);
                s -= w_inv * w_k.transpose();
            }
        }
    }

    let dp = if n_poses > 0 {
        schur.lu().solve(&rhs)?
    } else {
        DVector::zeros(0)
    };
    let pose_steps: Vec<Vector6<f64>> = (0..n_poses)
        .map(|i| Vector6::from_iterator(dp.rows(6 * i, 6).iter().copied()))
        .collect();

    let point_steps: Vec<Vector3<f64>> = (0..n_points)
        .map(|li| {
            let mut rhs_l = b_l[li];
            for (pi, w_i) in &per_point[li] {
                rhs_l -= w_i.transpose() * pose_steps[*pi];
            }
            h_ll_inv[li] * rhs_l
        })
        .collect();

    Some((pose_steps, point_steps))
}

/// Run LM on a collected problem. `should_stop` is polled between iterations.
pub fn solve_local_ba(
    problem: &LocalBAProblem,
    camera: &Camera,
    config: &LocalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<LocalBAResult> {
    let pose_index: HashMap<KeyFrameId, usize> = problem
        .optimized_kf_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let point_index: HashMap<MapPointId, usize> =
        problem.mp_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut state = SolverState {
        poses: problem
            .optimized_kf_ids
            .iter()
            .map(|id| problem.poses_cw.get(id).copied())
            .collect::<Option<Vec<_>>>()?,
        points: problem
            .mp_ids
            .iter()
            .map(|id| problem.positions.get(id).copied())
            .collect::<Option<Vec<_>>>()?,
    };

    let edges: Vec<Edge> = problem
        .observations
        .iter()
        .enumerate()
        .filter_map(|(obs_idx, obs)| {
            let point_idx = *point_index.get(&obs.mp_id)?;
            let pose_idx = pose_index.get(&obs.kf_id).copied();
            let fixed_pose = match pose_idx {
                Some(_) => None,
                None => Some(*problem.poses_cw.get(&obs.kf_id)?),
            };
            Some(Edge {
                obs_idx,
                pose_idx,
                fixed_pose,
                point_idx,
                pixel: obs.pixel,
                inv_sigma2: obs.inv_sigma2,
            })
        })
        .collect();
    if edges.is_empty() {
        return None;
    }

    let delta = config.huber_delta;
    let initial_cost = total_cost(&edges, camera, &state, delta);
    let mut cost = initial_cost;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        if should_stop() {
            debug!("[LocalBA] Aborted after {} iterations", iterations);
            break;
        }
        iterations += 1;

        let (pose_steps, point_steps) = match damped_step(&edges, camera, &state, lambda, delta) {
            Some(s) => s,
            None => break,
        };

        let trial = SolverState {
            poses: state
                .poses
                .iter()
                .zip(&pose_steps)
                .map(|(p, d)| p.retract(d))
                .collect(),
            points: state.points.iter().zip(&point_steps).map(|(p, d)| p + d).collect(),
        };
        let trial_cost = total_cost(&edges, camera, &trial, delta);

        if trial_cost < cost {
            let improvement = cost - trial_cost;
            state = trial;
            cost = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
            if improvement < 1e-9 * cost.max(1.0) {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    let mut outliers = Vec::new();
    for edge in &edges {
        let obs = &problem.observations[edge.obs_idx];
        let bad = match edge.chi2(camera, &state) {
            Some(chi2) => chi2 > config.chi2_threshold,
            None => true,
        };
        if bad {
            outliers.push((obs.kf_id, obs.feature_idx, obs.mp_id));
        }
    }

    Some(LocalBAResult {
        poses_cw: problem.optimized_kf_ids.iter().copied().zip(state.poses).collect(),
        positions: problem.mp_ids.iter().copied().zip(state.points).collect(),
        outliers,
        iterations,
        initial_cost,
        final_cost: cost,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 3: apply
// ─────────────────────────────────────────────────────────────────────────────

/// Write a solution back into the map. Returns the number of outlier
/// observations removed.
///
/// Entities removed while solving are skipped; outliers are only unlinked if
/// the feature still references the same point.
pub fn apply_local_ba(map: &mut Map, result: &LocalBAResult) -> usize {
    for (kf_id, pose_cw) in &result.poses_cw {
        map.set_keyframe_pose(*kf_id, pose_cw.inverse());
    }
    for (mp_id, position) in &result.positions {
        map.set_map_point_position(*mp_id, *position);
    }

    let mut removed = 0;
    for &(kf_id, feature_idx, mp_id) in &result.outliers {
        let still_linked = map
            .get_keyframe(kf_id)
            .map_or(false, |kf| kf.get_map_point(feature_idx) == Some(mp_id));
        if still_linked && map.disassociate(kf_id, feature_idx).is_some() {
            removed += 1;
        }
    }

    let mut touched: Vec<MapPointId> = result.positions.keys().copied().collect();
    touched.sort();
    for mp_id in touched {
        map.update_map_point_geometry(mp_id);
    }

    if removed > 0 {
        debug!("[LocalBA] Removed {} outlier observations", removed);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalePyramid;
    use crate::frame::{Feature, Frame};
    use crate::map::{FrameId, KeyFrame};
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn create_test_camera() -> Camera {
        Camera::new(458.0, 457.0, 367.0, 248.0, 752, 480)
    }

    /// Three keyframes along x observing the same 40 points.
    fn create_test_map() -> (Map, Vec<SE3>, Vec<Vector3<f64>>) {
        let camera = create_test_camera();
        let mut rng = StdRng::seed_from_u64(5);
        let points: Vec<Vector3<f64>> = (0..40)
            .map(|_| Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(4.0..7.0)))
            .collect();
        let poses: Vec<SE3> = (0..3)
            .map(|i| {
                SE3::new(
                    UnitQuaternion::from_euler_angles(0.0, 0.02 * i as f64, 0.0),
                    Vector3::new(0.25 * i as f64, 0.0, 0.0),
                )
            })
            .collect();

        let mut map = Map::new(ScalePyramid::from_factors(&[1.0, 1.2]), 1);
        for (i, pose) in poses.iter().enumerate() {
            let fid = FrameId::new(i as u64);
            let t_cw = pose.inverse();
            let features = points
                .iter()
                .map(|p| {
                    let px = camera.project(&t_cw.transform_point(p)).unwrap();
                    Feature::new(fid, px, 0, [0; 32])
                })
                .collect();
            let mut frame = Frame::from_features(fid, None, features);
            frame.pose = *pose;
            frame.promote_to_keyframe();
            map.insert_keyframe(KeyFrame::from_frame(frame).unwrap()).unwrap();
        }
        for (j, p) in points.iter().enumerate() {
            let mp = map.create_map_point(*p, [0; 32], KeyFrameId::new(0));
            for i in 0..3 {
                assert!(map.associate(KeyFrameId::new(i), j, mp));
            }
        }
        for i in 0..3 {
            map.update_connections(KeyFrameId::new(i));
        }
        (map, poses, points)
    }

    #[test]
    fn test_collect_fixes_first_keyframe() {
        let (map, _, _) = create_test_map();
        let problem = collect_local_ba(&map, KeyFrameId::new(2), &LocalBAConfig::default()).unwrap();

        assert_eq!(problem.optimized_kf_ids, vec![KeyFrameId::new(2), KeyFrameId::new(1)]);
        assert_eq!(problem.poses_cw.len(), 3);
        assert_eq!(problem.mp_ids.len(), 40);
        assert_eq!(problem.observations.len(), 120);
    }

    #[test]
    fn test_collect_caps_points() {
        let (map, _, _) = create_test_map();
        let config = LocalBAConfig {
            max_points: 10,
            ..Default::default()
        };
        let problem = collect_local_ba(&map, KeyFrameId::new(2), &config).unwrap();
        assert_eq!(problem.mp_ids.len(), 10);
        assert_eq!(problem.observations.len(), 30);
    }

    #[test]
    fn test_solve_reduces_error_and_keeps_anchor() {
        let (mut map, poses, _) = create_test_map();
        let camera = create_test_camera();

        // Perturb the last keyframe and every point.
        let noisy = poses[2].retract(&Vector6::new(0.005, -0.004, 0.003, 0.02, -0.01, 0.015));
        map.set_keyframe_pose(KeyFrameId::new(2), noisy);
        let ids: Vec<MapPointId> = map.map_points().map(|mp| mp.id).collect();
        for (k, id) in ids.iter().enumerate() {
            let p = map.get_map_point(*id).unwrap().position;
            let offset = if k % 2 == 0 { 0.01 } else { -0.01 };
            map.set_map_point_position(*id, p + Vector3::new(offset, -offset, offset));
        }

        let config = LocalBAConfig {
            max_iterations: 20,
            ..Default::default()
        };
        let problem = collect_local_ba(&map, KeyFrameId::new(2), &config).unwrap();
        let result = solve_local_ba(&problem, &camera, &config, &|| false).unwrap();

        assert!(result.final_cost < 0.01 * result.initial_cost);
        assert!(!result.poses_cw.contains_key(&KeyFrameId::new(0)));
        assert!(result.outliers.is_empty());

        apply_local_ba(&mut map, &result);
        assert_eq!(map.get_keyframe(KeyFrameId::new(0)).unwrap().pose, poses[0]);
        assert!(map.integrity_violations().is_empty());
    }

    #[test]
    fn test_solve_honors_stop_flag() {
        let (map, _, _) = create_test_map();
        let camera = create_test_camera();
        let config = LocalBAConfig::default();
        let problem = collect_local_ba(&map, KeyFrameId::new(2), &config).unwrap();

        let result = solve_local_ba(&problem, &camera, &config, &|| true).unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.initial_cost, result.final_cost);
    }

    #[test]
    fn test_apply_unlinks_outliers() {
        let (mut map, _, _) = create_test_map();
        let mp = map.get_keyframe(KeyFrameId::new(1)).unwrap().get_map_point(3).unwrap();
        let result = LocalBAResult {
            poses_cw: HashMap::new(),
            positions: HashMap::new(),
            outliers: vec![(KeyFrameId::new(1), 3, mp), (KeyFrameId::new(1), 4, mp)],
            iterations: 0,
            initial_cost: 0.0,
            final_cost: 0.0,
        };

        // The second entry no longer matches what the feature references.
        assert_eq!(apply_local_ba(&mut map, &result), 1);
        assert!(!map.get_map_point(mp).unwrap().is_observed_by(KeyFrameId::new(1)));
        assert!(map.integrity_violations().is_empty());
    }
}
