//! Pinhole camera with radial-tangential distortion.
//!
//! Features are undistorted once when a frame is built, so everything past
//! frame construction works with the ideal pinhole model:
//!
//! ```text
//! u = fx * x / z + cx
//! v = fy * y / z + cy
//! ```

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::CameraConfig;

/// Iterations of the fixed-point undistortion.
const UNDISTORT_ITERATIONS: usize = 10;

/// Intrinsic parameters returned by [`Camera::intrinsics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Stateless camera model. Poses live on frames, not here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Distortion coefficients `[k1, k2, p1, p2]`.
    pub distortion: [f64; 4],
    pub width: u32,
    pub height: u32,
}

impl Camera {
    /// Distortion-free camera.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 4],
            width,
            height,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            fx: config.fx,
            fy: config.fy,
            cx: config.cx,
            cy: config.cy,
            distortion: [config.k1, config.k2, config.p1, config.p2],
            width: config.width,
            height: config.height,
        }
    }

    pub fn with_distortion(mut self, distortion: [f64; 4]) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn intrinsics(&self) -> Intrinsics {
        Intrinsics {
            fx: self.fx,
            fy: self.fy,
            cx: self.cx,
            cy: self.cy,
        }
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a camera-frame point. `None` behind (or on) the image plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Back-project an undistorted pixel to a ray `(x, y, 1)` in the camera frame.
    pub fn unproject(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }

    /// Unit-length viewing ray through an undistorted pixel.
    pub fn bearing(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        self.unproject(pixel).normalize()
    }

    pub fn is_distorted(&self) -> bool {
        self.distortion.iter().any(|&c| c != 0.0)
    }

    /// Map a raw (distorted) pixel to where an ideal pinhole camera would see it.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        if !self.is_distorted() {
            return *pixel;
        }

        let xd = (pixel.x - self.cx) / self.fx;
        let yd = (pixel.y - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);

        for _ in 0..UNDISTORT_ITERATIONS {
            let (dx, dy) = self.distortion_offset(x, y);
            let r2 = x * x + y * y;
            let radial = 1.0 + self.distortion[0] * r2 + self.distortion[1] * r2 * r2;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        Vector2::new(x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Apply the distortion model to an ideal pixel.
    pub fn distort_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let x = (pixel.x - self.cx) / self.fx;
        let y = (pixel.y - self.cy) / self.fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + self.distortion[0] * r2 + self.distortion[1] * r2 * r2;
        let (dx, dy) = self.distortion_offset(x, y);
        Vector2::new(
            (x * radial + dx) * self.fx + self.cx,
            (y * radial + dy) * self.fy + self.cy,
        )
    }

    /// Tangential part of the distortion at normalized coordinates.
    fn distortion_offset(&self, x: f64, y: f64) -> (f64, f64) {
        let [_, _, p1, p2] = self.distortion;
        let r2 = x * x + y * y;
        (
            2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    pub fn is_in_image(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.width as f64
            && pixel.y < self.height as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_project_unproject() {
        let cam = create_test_camera();
        let p = Vector3::new(0.4, -0.2, 2.0);

        let pixel = cam.project(&p).unwrap();
        assert_relative_eq!(pixel, Vector2::new(420.0, 190.0), epsilon = 1e-12);

        let ray = cam.unproject(&pixel);
        assert_relative_eq!(ray * p.z, p, epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        let cam = create_test_camera();
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(1.0, 1.0, 0.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let cam = create_test_camera().with_distortion([-0.28, 0.07, 2e-4, 1.7e-5]);
        let ideal = Vector2::new(100.0, 400.0);

        let raw = cam.distort_pixel(&ideal);
        assert!((raw - ideal).norm() > 1.0);

        let recovered = cam.undistort_pixel(&raw);
        assert_relative_eq!(recovered, ideal, epsilon = 1e-3);
    }

    #[test]
    fn test_undistort_is_identity_without_distortion() {
        let cam = create_test_camera();
        let pixel = Vector2::new(12.5, 77.25);
        assert_eq!(cam.undistort_pixel(&pixel), pixel);
    }

    #[test]
    fn test_is_in_image() {
        let cam = create_test_camera();
        assert!(cam.is_in_image(&Vector2::new(0.0, 0.0)));
        assert!(cam.is_in_image(&Vector2::new(639.9, 479.9)));
        assert!(!cam.is_in_image(&Vector2::new(640.0, 10.0)));
        assert!(!cam.is_in_image(&Vector2::new(-0.1, 10.0)));
    }
}
