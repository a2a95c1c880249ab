//! Pose-only optimization: refine one camera pose against fixed map points.
//!
//! The problem is parameterized as a 6-vector perturbation `δ = (ω, v)` about
//! a base pose (see [`SE3::retract`]) and minimized with the
//! `levenberg-marquardt` solver. Optimization runs in rounds; after each round
//! every observation is re-classified as inlier or outlier by its chi² and
//! the next round starts from the refined pose using only the inliers.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, Matrix2x6, OMatrix, Owned, Vector2, Vector3, Vector6, U6};

use crate::camera::Camera;
use crate::geometry::SE3;

use super::robust::huber_weight;

/// A 2D measurement of a fixed 3D point.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseObservation {
    /// World coordinates.
    pub point: Vector3<f64>,
    /// Undistorted pixel.
    pub pixel: Vector2<f64>,
    /// Inverse measurement variance for the feature's pyramid level.
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct PoseRefinement {
    /// Refined world-to-camera pose (T_cw).
    pub pose: SE3,
    /// One flag per input observation.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Settings for [`refine_pose`].
#[derive(Debug, Clone)]
pub struct PoseOnlyConfig {
    pub rounds: usize,
    pub chi2_threshold: f64,
    pub huber_delta: f64,
    pub max_evaluations: usize,
}

impl Default for PoseOnlyConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            chi2_threshold: 5.991,
            huber_delta: 5.991_f64.sqrt(),
            max_evaluations: 100,
        }
    }
}

/// `observed - projected` and its jacobian w.r.t. a left perturbation of T_cw.
///
/// Returns `None` for points at or behind the camera.
pub(crate) fn reprojection_residual(
    camera: &Camera,
    t_cw: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Option<(Vector2<f64>, Vector3<f64>)> {
    let p_cam = t_cw.transform_point(point);
    if p_cam.z <= 1e-6 {
        return None;
    }
    let projected = camera.project(&p_cam)?;
    Some((observed - projected, p_cam))
}

/// Jacobian of `observed - π(T_cw p)` w.r.t. `δ = (ω, v)`.
pub(crate) fn pose_jacobian(camera: &Camera, p_cam: &Vector3<f64>) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

struct PoseProblem<'a> {
    camera: &'a Camera,
    observations: &'a [PoseObservation],
    active: &'a [bool],
    base: SE3,
    delta: Vector6<f64>,
    huber_delta: f64,
}

impl PoseProblem<'_> {
    fn pose(&self) -> SE3 {
        self.base.retract(&self.delta)
    }

    /// Whitened, Huber-weighted scale for one residual.
    fn scale(&self, obs: &PoseObservation, error: &Vector2<f64>) -> f64 {
        let chi2 = error.norm_squared() * obs.inv_sigma2;
        (huber_weight(chi2, self.huber_delta) * obs.inv_sigma2).sqrt()
    }
}

impl LeastSquaresProblem<f64, Dyn, U6> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, params: &Vector6<f64>) {
        self.delta = *params;
    }

    fn params(&self) -> Vector6<f64> {
        self.delta
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.pose();
        let mut r = DVector::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            if !self.active[i] {
                continue;
            }
            if let Some((e, _)) = reprojection_residual(self.camera, &pose, &obs.point, &obs.pixel) {
                let s = self.scale(obs, &e);
                r[2 * i] = s * e.x;
                r[2 * i + 1] = s * e.y;
            }
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let pose = self.pose();
        let mut j = OMatrix::<f64, Dyn, U6>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            if !self.active[i] {
                continue;
            }
            if let Some((e, p_cam)) = reprojection_residual(self.camera, &pose, &obs.point, &obs.pixel) {
                let block = pose_jacobian(self.camera, &p_cam) * self.scale(obs, &e);
                j.fixed_view_mut::<2, 6>(2 * i, 0).copy_from(&block);
            }
        }
        Some(j)
    }
}

/// Classify every observation against `pose` by its chi².
fn classify(camera: &Camera, pose: &SE3, observations: &[PoseObservation], chi2_threshold: f64) -> Vec<bool> {
    observations
        .iter()
        .map(|obs| match reprojection_residual(camera, pose, &obs.point, &obs.pixel) {
            Some((e, _)) => e.norm_squared() * obs.inv_sigma2 <= chi2_threshold,
            None => false,
        })
        .collect()
}

/// Refine `initial` (T_cw) against fixed 3D-2D correspondences.
pub fn refine_pose(
    camera: &Camera,
    initial: &SE3,
    observations: &[PoseObservation],
    config: &PoseOnlyConfig,
) -> PoseRefinement {
    let mut pose = *initial;
    let mut active = vec![true; observations.len()];

    for _ in 0..config.rounds.max(1) {
        if active.iter().filter(|a| **a).count() < 3 {
            break;
        }

        let problem = PoseProblem {
            camera,
            observations,
            active: &active,
            base: pose,
            delta: Vector6::zeros(),
            huber_delta: config.huber_delta,
        };
        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(config.max_evaluations)
            .minimize(problem);
        if report.objective_function.is_finite() {
            pose = solved.pose();
        }

        active = classify(camera, &pose, observations, config.chi2_threshold);
    }

    let inliers = classify(camera, &pose, observations, config.chi2_threshold);
    let num_inliers = inliers.iter().filter(|i| **i).count();
    PoseRefinement {
        pose,
        inliers,
        num_inliers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn create_test_camera() -> Camera {
        Camera::new(458.0, 457.0, 367.0, 248.0, 752, 480)
    }

    fn create_test_observations(t_cw: &SE3, n: usize, seed: u64) -> Vec<PoseObservation> {
        let camera = create_test_camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let t_wc = t_cw.inverse();
        let mut out = Vec::new();
        while out.len() < n {
            let p_cam = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            let pixel = match camera.project(&p_cam) {
                Some(px) if camera.is_in_image(&px) => px,
                _ => continue,
            };
            out.push(PoseObservation {
                point: t_wc.transform_point(&p_cam),
                pixel,
                inv_sigma2: 1.0,
            });
        }
        out
    }

    #[test]
    fn test_pose_jacobian_matches_numeric() {
        let camera = create_test_camera();
        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.05),
            Vector3::new(0.3, -0.1, 0.2),
        );
        let point = Vector3::new(0.5, 0.4, 5.0);
        let observed = Vector2::new(400.0, 260.0);

        let (_, p_cam) = reprojection_residual(&camera, &pose, &point, &observed).unwrap();
        let analytic = pose_jacobian(&camera, &p_cam);

        let h = 1e-6;
        for k in 0..6 {
            let mut d = Vector6::zeros();
            d[k] = h;
            let (e_plus, _) = reprojection_residual(&camera, &pose.retract(&d), &point, &observed).unwrap();
            d[k] = -h;
            let (e_minus, _) = reprojection_residual(&camera, &pose.retract(&d), &point, &observed).unwrap();
            let numeric = (e_plus - e_minus) / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_refine_pose_recovers_truth() {
        let camera = create_test_camera();
        let truth = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, 0.1, -0.03),
            Vector3::new(0.2, -0.1, 0.4),
        );
        let observations = create_test_observations(&truth, 80, 3);

        let initial = truth.retract(&Vector6::new(0.01, -0.015, 0.01, 0.05, -0.04, 0.03));
        let result = refine_pose(&camera, &initial, &observations, &PoseOnlyConfig::default());

        assert_eq!(result.num_inliers, observations.len());
        assert_relative_eq!(result.pose.translation, truth.translation, epsilon = 1e-5);
        assert!(result.pose.angle_to(&truth) < 1e-6);
    }

    #[test]
    fn test_refine_pose_flags_outliers() {
        let camera = create_test_camera();
        let truth = SE3::identity();
        let mut observations = create_test_observations(&truth, 60, 9);
        for obs in observations.iter_mut().take(6) {
            obs.pixel += Vector2::new(40.0, -35.0);
        }

        let initial = truth.retract(&Vector6::new(0.0, 0.01, 0.0, 0.03, 0.0, -0.02));
        let result = refine_pose(&camera, &initial, &observations, &PoseOnlyConfig::default());

        assert_eq!(result.num_inliers, 54);
        assert!(result.inliers[..6].iter().all(|i| !*i));
        assert!(result.inliers[6..].iter().all(|i| *i));
        assert_relative_eq!(result.pose.translation, truth.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_refine_pose_with_too_few_observations() {
        let camera = create_test_camera();
        let observations = create_test_observations(&SE3::identity(), 2, 1);
        let result = refine_pose(&camera, &SE3::identity(), &observations, &PoseOnlyConfig::default());
        assert_eq!(result.inliers.len(), 2);
        assert_eq!(result.pose, SE3::identity());
    }
}
