//! Two-view relative pose from point correspondences.
//!
//! The monocular bootstrap has no metric depth, so the first map comes from
//! the essential matrix between a reference and a current view:
//! - normalized 8-point estimate inside RANSAC (Sampson error)
//! - four-way `(R, t)` decomposition
//! - hypothesis selection by counting points that are in front of both
//!   cameras, reproject within the chi-square gate and have enough parallax
//!
//! The recovered translation has unit norm; callers fix the map scale.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector2, Vector3};
use rand::Rng;

use crate::camera::Camera;

use super::triangulation::triangulate_with_projections;
use super::SE3;

/// Minimum sample size of the linear solver.
const MIN_SAMPLE: usize = 8;

/// One-DOF chi-square gate (95%) for the epipolar residual.
const CHI2_EPIPOLAR: f64 = 3.841;

/// A runner-up hypothesis with this fraction of the winner's support is ambiguous.
const AMBIGUITY_RATIO: f64 = 0.7;

/// Parameters for [`reconstruct_two_view`].
#[derive(Debug, Clone)]
pub struct TwoViewParams {
    pub ransac_iterations: usize,
    /// Measurement standard deviation (pixels).
    pub sigma_px: f64,
    /// Two-DOF chi-square gate on squared reprojection error.
    pub chi2_threshold: f64,
    /// Cosine of the minimum parallax angle.
    pub min_parallax_cos: f64,
    /// Fewest valid points a hypothesis needs to be accepted.
    pub min_triangulated: usize,
}

/// Result of a successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// Transform from the first camera frame to the second (`T_c2c1`).
    pub t21: SE3,
    /// Triangulated point in the first camera frame, per correspondence.
    /// `None` for RANSAC outliers and points failing a gate.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_valid: usize,
}

/// Recover relative pose and structure from pixel correspondences.
pub fn reconstruct_two_view<R: Rng + ?Sized>(
    camera: &Camera,
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    params: &TwoViewParams,
    rng: &mut R,
) -> Option<TwoViewReconstruction> {
    if pixels1.len() != pixels2.len() || pixels1.len() < MIN_SAMPLE {
        return None;
    }

    let norm1: Vec<Vector2<f64>> = pixels1.iter().map(|p| camera.unproject(p).xy()).collect();
    let norm2: Vec<Vector2<f64>> = pixels2.iter().map(|p| camera.unproject(p).xy()).collect();

    let focal = 0.5 * (camera.fx + camera.fy);
    let th_norm = CHI2_EPIPOLAR.sqrt() * params.sigma_px / focal;
    let (essential, inliers) =
        find_essential_ransac(&norm1, &norm2, th_norm * th_norm, params.ransac_iterations, rng)?;

    let hypotheses = decompose_essential(&essential);
    let mut scored: Vec<(usize, SE3, Vec<Option<Vector3<f64>>>)> = hypotheses
        .iter()
        .map(|(r, t)| {
            let t21 = SE3::from_rt(r, t);
            let points = check_hypothesis(camera, &t21, pixels1, pixels2, &norm1, &norm2, &inliers, params);
            let good = points.iter().filter(|p| p.is_some()).count();
            (good, t21, points)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let (best_good, t21, points) = scored.swap_remove(0);
    let second_good = scored.iter().map(|s| s.0).max().unwrap_or(0);

    if best_good < params.min_triangulated {
        tracing::debug!(
            "[Init] Best hypothesis has {} valid points (need {})",
            best_good,
            params.min_triangulated
        );
        return None;
    }
    if second_good as f64 > AMBIGUITY_RATIO * best_good as f64 {
        tracing::debug!("[Init] Ambiguous decomposition ({} vs {})", best_good, second_good);
        return None;
    }

    Some(TwoViewReconstruction {
        t21,
        points,
        num_valid: best_good,
    })
}

/// RANSAC over the 8-point solver. Returns the refit model and its inlier mask.
pub fn find_essential_ransac<R: Rng + ?Sized>(
    norm1: &[Vector2<f64>],
    norm2: &[Vector2<f64>],
    threshold_sq: f64,
    iterations: usize,
    rng: &mut R,
) -> Option<(Matrix3<f64>, Vec<bool>)> {
    let n = norm1.len();
    if n < MIN_SAMPLE || norm2.len() != n {
        return None;
    }

    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;

    for _ in 0..iterations.max(1) {
        let sample = rand::seq::index::sample(rng, n, MIN_SAMPLE).into_vec();
        let s1: Vec<Vector2<f64>> = sample.iter().map(|&i| norm1[i]).collect();
        let s2: Vec<Vector2<f64>> = sample.iter().map(|&i| norm2[i]).collect();

        let e = match eight_point(&s1, &s2) {
            Some(e) => e,
            None => continue,
        };

        let mask: Vec<bool> = (0..n)
            .map(|i| sampson_error(&e, &norm1[i], &norm2[i]) < threshold_sq)
            .collect();
        let count = mask.iter().filter(|&&m| m).count();

        if best.as_ref().map_or(true, |b| count > b.2) {
            best = Some((e, mask, count));
        }
        if count == n {
            break;
        }
    }

    let (e, mask, count) = best?;
    if count < MIN_SAMPLE {
        return None;
    }

    // Refit on the consensus set.
    let in1: Vec<Vector2<f64>> = (0..n).filter(|&i| mask[i]).map(|i| norm1[i]).collect();
    let in2: Vec<Vector2<f64>> = (0..n).filter(|&i| mask[i]).map(|i| norm2[i]).collect();
    let refit = eight_point(&in1, &in2).unwrap_or(e);
    let refit_mask: Vec<bool> = (0..n)
        .map(|i| sampson_error(&refit, &norm1[i], &norm2[i]) < threshold_sq)
        .collect();

    if refit_mask.iter().filter(|&&m| m).count() >= count {
        Some((refit, refit_mask))
    } else {
        Some((e, mask))
    }
}

/// Linear essential matrix from at least 8 normalized correspondences (`x2ᵀ E x1 = 0`).
///
/// The null vector of `A` is taken as the smallest eigenvector of `AᵀA`, then the
/// result is projected onto the essential manifold (singular values `1, 1, 0`).
pub fn eight_point(pts1: &[Vector2<f64>], pts2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    if pts1.len() != pts2.len() || pts1.len() < MIN_SAMPLE {
        return None;
    }

    let n = pts1.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for i in 0..n {
        let (x1, y1) = (pts1[i].x, pts1[i].y);
        let (x2, y2) = (pts2[i].x, pts2[i].y);
        a[(i, 0)] = x2 * x1;
        a[(i, 1)] = x2 * y1;
        a[(i, 2)] = x2;
        a[(i, 3)] = y2 * x1;
        a[(i, 4)] = y2 * y1;
        a[(i, 5)] = y2;
        a[(i, 6)] = x1;
        a[(i, 7)] = y1;
        a[(i, 8)] = 1.0;
    }

    let ata = a.transpose() * &a;
    let eigen = SymmetricEigen::new(ata);
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &v)| if v < best.1 { (i, v) } else { best });
    let e_vec = eigen.eigenvectors.column(min_idx);

    let e = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2], //
        e_vec[3], e_vec[4], e_vec[5], //
        e_vec[6], e_vec[7], e_vec[8],
    );

    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let e = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t;
    if e.iter().all(|c| c.is_finite()) {
        Some(e)
    } else {
        None
    }
}

/// First-order geometric error of a correspondence under `E`.
pub fn sampson_error(e: &Matrix3<f64>, p1: &Vector2<f64>, p2: &Vector2<f64>) -> f64 {
    let x1 = Vector3::new(p1.x, p1.y, 1.0);
    let x2 = Vector3::new(p2.x, p2.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let num = x2.dot(&ex1);
    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom < 1e-18 {
        return f64::INFINITY;
    }
    num * num / denom
}

/// The four `(R, t)` factorizations of an essential matrix.
pub fn decompose_essential(e: &Matrix3<f64>) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let (mut u, mut v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Vec::new(),
    };

    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    // Null direction of Eᵀ: the singular vector with the smallest singular value.
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &s)| if s < best.1 { (i, s) } else { best });
    let t = u.column(min_idx).into_owned().normalize();

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;

    vec![(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

/// Triangulate inliers under one hypothesis; keep points passing every gate.
#[allow(clippy::too_many_arguments)]
fn check_hypothesis(
    camera: &Camera,
    t21: &SE3,
    pixels1: &[Vector2<f64>],
    pixels2: &[Vector2<f64>],
    norm1: &[Vector2<f64>],
    norm2: &[Vector2<f64>],
    inliers: &[bool],
    params: &TwoViewParams,
) -> Vec<Option<Vector3<f64>>> {
    let p1 = SE3::identity().to_matrix3x4();
    let p2 = t21.to_matrix3x4();
    let center2 = t21.inverse().translation;
    let max_err_sq = params.chi2_threshold * params.sigma_px * params.sigma_px;

    (0..norm1.len())
        .map(|i| {
            if !inliers[i] {
                return None;
            }
            let ray1 = Vector3::new(norm1[i].x, norm1[i].y, 1.0);
            let ray2 = Vector3::new(norm2[i].x, norm2[i].y, 1.0);
            let x1 = triangulate_with_projections(&ray1, &ray2, &p1, &p2)?;

            let x2 = t21.transform_point(&x1);
            if x1.z <= 0.0 || x2.z <= 0.0 {
                return None;
            }

            let cos_parallax = super::parallax_cos(&Vector3::zeros(), &center2, &x1);
            if cos_parallax > params.min_parallax_cos {
                return None;
            }

            let err1 = (camera.project(&x1)? - pixels1[i]).norm_squared();
            let err2 = (camera.project(&x2)? - pixels2[i]).norm_squared();
            if err1 > max_err_sq || err2 > max_err_sq {
                return None;
            }

            Some(x1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn create_test_scene() -> (Camera, SE3, Vec<Vector3<f64>>) {
        let camera = Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let t21 = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            Vector3::new(-0.3, 0.02, 0.01),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let points = (0..120)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(3.0..6.0),
                )
            })
            .collect();
        (camera, t21, points)
    }

    fn create_test_params() -> TwoViewParams {
        TwoViewParams {
            ransac_iterations: 100,
            sigma_px: 1.0,
            chi2_threshold: 5.991,
            min_parallax_cos: 1.0f64.to_radians().cos(),
            min_triangulated: 30,
        }
    }

    #[test]
    fn test_eight_point_satisfies_epipolar_constraint() {
        let (camera, t21, points) = create_test_scene();
        let n1: Vec<_> = points.iter().map(|p| (p / p.z).xy()).collect();
        let n2: Vec<_> = points
            .iter()
            .map(|p| {
                let q = t21.transform_point(p);
                (q / q.z).xy()
            })
            .collect();

        let e = eight_point(&n1, &n2).unwrap();
        for i in 0..n1.len() {
            assert!(sampson_error(&e, &n1[i], &n2[i]) < 1e-12);
        }
        let _ = camera;
    }

    #[test]
    fn test_reconstruct_recovers_motion() {
        let (camera, t21, points) = create_test_scene();
        let px1: Vec<_> = points.iter().map(|p| camera.project(p).unwrap()).collect();
        let px2: Vec<_> = points
            .iter()
            .map(|p| camera.project(&t21.transform_point(p)).unwrap())
            .collect();

        let mut rng = StdRng::seed_from_u64(0);
        let rec = reconstruct_two_view(&camera, &px1, &px2, &create_test_params(), &mut rng).unwrap();

        assert!(rec.t21.angle_to(&t21) < 1e-6);
        let dir = t21.translation.normalize();
        assert!((rec.t21.translation.normalize() - dir).norm() < 1e-6);
        assert_eq!(rec.num_valid, points.len());

        // Structure is recovered up to the translation scale.
        let scale = t21.translation.norm();
        for (est, truth) in rec.points.iter().zip(&points) {
            let est = est.unwrap();
            assert!((est * scale - truth).norm() < 1e-6);
        }
    }

    #[test]
    fn test_reconstruct_rejects_pure_rotation() {
        let (camera, _, points) = create_test_scene();
        let rotation_only = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0), Vector3::zeros());
        let px1: Vec<_> = points.iter().map(|p| camera.project(p).unwrap()).collect();
        let px2: Vec<_> = points
            .iter()
            .map(|p| camera.project(&rotation_only.transform_point(p)).unwrap())
            .collect();

        let mut rng = StdRng::seed_from_u64(0);
        assert!(reconstruct_two_view(&camera, &px1, &px2, &create_test_params(), &mut rng).is_none());
    }

    #[test]
    fn test_too_few_points() {
        let camera = Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let px = vec![Vector2::new(1.0, 1.0); 5];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(reconstruct_two_view(&camera, &px, &px, &create_test_params(), &mut rng).is_none());
    }
}
