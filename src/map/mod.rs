//! Sparse map: keyframes, map points, covisibility and the keyframe database.

pub mod covisibility;
pub mod keyframe;
pub mod keyframe_db;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use covisibility::CovisibilityGraph;
pub use keyframe::KeyFrame;
pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use map::{KeyFrameView, Map, MapSnapshot, PointView};
pub use map_point::MapPoint;
pub use types::{FrameId, KeyFrameId, MapPointId};
