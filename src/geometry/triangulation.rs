//! Two-view linear triangulation and the error measures used to gate it.

use nalgebra::{Matrix3x4, Matrix4, Vector2, Vector3};

use crate::camera::Camera;

use super::SE3;

/// Linear (DLT) triangulation of one correspondence.
///
/// `ray1`/`ray2` are normalized image coordinates `(x, y, 1)`; `t1_cw`/`t2_cw`
/// map world points into each camera. Returns `None` for points at infinity.
pub fn triangulate_dlt(
    ray1: &Vector3<f64>,
    ray2: &Vector3<f64>,
    t1_cw: &SE3,
    t2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = t1_cw.to_matrix3x4();
    let p2 = t2_cw.to_matrix3x4();
    triangulate_with_projections(ray1, ray2, &p1, &p2)
}

/// Same as [`triangulate_dlt`] with explicit 3x4 projection matrices.
pub fn triangulate_with_projections(
    ray1: &Vector3<f64>,
    ray2: &Vector3<f64>,
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
) -> Option<Vector3<f64>> {
    // Rows x * P[2] - P[0] and y * P[2] - P[1] per view.
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = ray1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = ray1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = ray2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = ray2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    // Singular values are not guaranteed sorted; take the smallest.
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &s)| if s < best.1 { (i, s) } else { best });
    let x_h = v_t.row(min_idx);

    if x_h[3].abs() < 1e-12 {
        return None;
    }

    let p = Vector3::new(x_h[0] / x_h[3], x_h[1] / x_h[3], x_h[2] / x_h[3]);
    if p.iter().all(|c| c.is_finite()) {
        Some(p)
    } else {
        None
    }
}

/// Squared pixel reprojection error of a world point, `None` if behind the camera.
pub fn reprojection_error_sq(
    camera: &Camera,
    t_cw: &SE3,
    p_world: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Option<f64> {
    let p_cam = t_cw.transform_point(p_world);
    camera
        .project(&p_cam)
        .map(|uv| (uv - observed).norm_squared())
}

/// Cosine of the parallax angle at `point` between rays from two camera centers.
pub fn parallax_cos(center1: &Vector3<f64>, center2: &Vector3<f64>, point: &Vector3<f64>) -> f64 {
    let r1 = point - center1;
    let r2 = point - center2;
    let denom = r1.norm() * r2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    r1.dot(&r2) / denom
}
