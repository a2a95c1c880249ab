//! Constant-velocity motion prior.

use crate::geometry::SE3;

/// Predicts the next camera pose from the relative motion between the last
/// two tracked frames.
///
/// The velocity is stored as `T_cl = T_cw(current) * T_wc(last)`, so the
/// prediction is `T_cw(next) = T_cl * T_cw(current)`.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Last tracked pose (T_wc).
    prev_pose: Option<SE3>,
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly tracked pose (T_wc).
    pub fn update(&mut self, pose_wc: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(pose_wc.inverse().compose(prev));
        }
        self.prev_pose = Some(*pose_wc);
    }

    /// Predicted T_wc of the next frame. Without a velocity estimate the last
    /// pose is returned.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose?;
        match &self.velocity {
            Some(velocity) => Some(velocity.compose(&prev.inverse()).inverse()),
            None => Some(prev),
        }
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Drop the velocity but keep the last pose, e.g. after relocalization.
    pub fn clear_velocity(&mut self) {
        self.velocity = None;
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}
