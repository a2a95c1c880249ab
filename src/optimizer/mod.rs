//! Nonlinear refinement of poses and structure.
//!
//! [`Optimizer`] is the seam Tracking and LocalMapping call into:
//! - pose-only refinement of the current frame against fixed map points
//! - local bundle adjustment over a keyframe's covisibility neighborhood
//!
//! Both use a Huber kernel on the whitened reprojection error.

pub mod local_ba;
pub mod pose_only;
pub mod robust;

pub use local_ba::{
    apply_local_ba, collect_local_ba, solve_local_ba, BAObservation, LocalBAConfig, LocalBAProblem,
    LocalBAResult,
};
pub use pose_only::{refine_pose, PoseObservation, PoseOnlyConfig, PoseRefinement};

use crate::camera::Camera;
use crate::config::SlamConfig;
use crate::geometry::SE3;

pub trait Optimizer: Send + Sync {
    /// Refine a world-to-camera pose against fixed 3D-2D correspondences.
    fn pose_only_refine(&self, camera: &Camera, initial_cw: &SE3, observations: &[PoseObservation]) -> PoseRefinement;

    /// Solve a collected local BA problem. The caller applies the result.
    fn local_refine(
        &self,
        problem: &LocalBAProblem,
        camera: &Camera,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<LocalBAResult>;
}

/// Levenberg-Marquardt backed [`Optimizer`].
#[derive(Debug, Clone, Default)]
pub struct LmOptimizer {
    pub pose: PoseOnlyConfig,
    pub local: LocalBAConfig,
}

impl LmOptimizer {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            pose: PoseOnlyConfig {
                rounds: config.pose_refine_rounds,
                chi2_threshold: config.chi2_threshold,
                huber_delta: config.huber_delta,
                ..PoseOnlyConfig::default()
            },
            local: LocalBAConfig::from_config(config),
        }
    }
}

impl Optimizer for LmOptimizer {
    fn pose_only_refine(&self, camera: &Camera, initial_cw: &SE3, observations: &[PoseObservation]) -> PoseRefinement {
        refine_pose(camera, initial_cw, observations, &self.pose)
    }

    fn local_refine(
        &self,
        problem: &LocalBAProblem,
        camera: &Camera,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<LocalBAResult> {
        solve_local_ba(problem, camera, &self.local, should_stop)
    }
}
