//! Synthetic scenes for unit tests: random landmarks with unique descriptors,
//! observed by a noise-free pinhole camera.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera::Camera;
use crate::frame::{Descriptor, Feature, Frame};
use crate::geometry::SE3;
use crate::map::FrameId;

pub(crate) fn create_test_camera() -> Camera {
    Camera::new(458.0, 457.0, 367.0, 248.0, 752, 480)
}

/// Pure translation camera-to-world pose.
pub(crate) fn create_test_pose(x: f64, y: f64, z: f64) -> SE3 {
    SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(x, y, z))
}

pub(crate) fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut d = [0u8; 32];
    rng.fill(&mut d[..]);
    d
}

pub(crate) struct SyntheticScene {
    pub camera: Camera,
    pub landmarks: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl SyntheticScene {
    /// `n` landmarks spread in front of the origin camera, 5 to 10 m deep.
    pub fn new(n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let landmarks = (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-4.0..4.0),
                    rng.gen_range(-2.5..2.5),
                    rng.gen_range(5.0..10.0),
                )
            })
            .collect();
        Self::with_landmarks(landmarks, seed.wrapping_add(1))
    }

    pub fn with_landmarks(landmarks: Vec<Vector3<f64>>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let descriptors = landmarks.iter().map(|_| random_descriptor(&mut rng)).collect();
        Self {
            camera: create_test_camera(),
            landmarks,
            descriptors,
        }
    }

    pub fn project(&self, pose_wc: &SE3, landmark: usize) -> Option<Vector2<f64>> {
        let p_cam = pose_wc.inverse().transform_point(&self.landmarks[landmark]);
        self.camera
            .project(&p_cam)
            .filter(|px| self.camera.is_in_image(px))
    }

    /// Frame seeing every visible landmark at level 0, posed at `pose_wc`.
    /// Also returns the landmark index behind each feature.
    pub fn frame(&self, id: u64, pose_wc: &SE3) -> (Frame, Vec<usize>) {
        let frame_id = FrameId::new(id);
        let mut features = Vec::new();
        let mut landmark_of = Vec::new();
        for i in 0..self.landmarks.len() {
            if let Some(px) = self.project(pose_wc, i) {
                features.push(Feature::new(frame_id, px, 0, self.descriptors[i]));
                landmark_of.push(i);
            }
        }
        let mut frame = Frame::from_features(frame_id, Some(id as f64 * 0.05), features);
        frame.pose = *pose_wc;
        (frame, landmark_of)
    }
}
