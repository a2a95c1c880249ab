//! Tracking: per-frame pose estimation and keyframe selection.
//!
//! - monocular bootstrap ([`Initializer`])
//! - constant-velocity prior ([`MotionModel`])
//! - track local map (projection search over the covisible neighborhood)
//! - new-keyframe policy ([`KeyFramePolicy`])
//! - relocalization through the keyframe database

pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod motion_model;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;

pub use initializer::{Bootstrap, InitOutcome, InitStage, Initializer};
pub use keyframe_decision::{KeyFrameInputs, KeyFramePolicy};
pub use motion_model::MotionModel;
pub use result::{TrackingEvent, TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::Tracker;
