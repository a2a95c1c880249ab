//! Inter-thread message types.

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::map::{FrameId, KeyFrame, KeyFrameId, MapSnapshot};
use crate::tracking::TrackingState;

/// Tracking -> LocalMapping: one keyframe to integrate.
///
/// The keyframe carries the map point associations found while tracking; the
/// map links them on insertion.
#[derive(Debug)]
pub struct NewKeyFrameMsg {
    /// Session the keyframe was created in. LocalMapping drops messages from
    /// an older session.
    pub epoch: u64,
    pub keyframe: KeyFrame,
}

/// Per-frame tracking summary for the viewer.
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    /// Session the frame was tracked in.
    pub epoch: u64,
    pub frame_id: FrameId,
    pub timestamp: Option<f64>,
    pub state: TrackingState,
    /// Camera to world, when tracked.
    pub pose: Option<SE3>,
    /// World positions of the map points matched in this frame.
    pub tracked_points: Vec<Vector3<f64>>,
}

/// Events consumed by the viewer thread. Every event carries the session
/// epoch it was produced in.
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    Frame(FrameUpdate),
    /// Map copy after a LocalMapping cycle. `current_kf` is the keyframe just processed.
    Map {
        epoch: u64,
        snapshot: MapSnapshot,
        current_kf: Option<KeyFrameId>,
    },
    /// Session `epoch` started; drop everything drawn so far.
    Reset { epoch: u64 },
}

impl ViewerEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            ViewerEvent::Frame(update) => update.epoch,
            ViewerEvent::Map { epoch, .. } | ViewerEvent::Reset { epoch } => *epoch,
        }
    }
}
