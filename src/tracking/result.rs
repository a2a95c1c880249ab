//! Per-frame tracking output.

use crate::geometry::SE3;
use crate::map::{FrameId, KeyFrameId};
use crate::tracking::TrackingState;

/// What happened on a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: FrameId,
    pub timestamp: Option<f64>,
    /// State after processing the frame.
    pub state: TrackingState,
    /// Camera to world, when the frame was tracked.
    pub pose: Option<SE3>,
    pub reference_kf: Option<KeyFrameId>,
    /// Keyframe queued for LocalMapping from this frame.
    pub new_keyframe: Option<KeyFrameId>,
    pub event: Option<TrackingEvent>,
    pub metrics: TrackingMetrics,
}

/// State transitions worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEvent {
    Initialized,
    Lost,
    Relocalized(KeyFrameId),
    Reset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingMetrics {
    pub n_features: usize,
    /// Map point matches before pose refinement.
    pub n_matches: usize,
    pub n_inliers: usize,
    /// Inliers observed by few keyframes.
    pub n_weak: usize,
    pub n_local_points: usize,
}
