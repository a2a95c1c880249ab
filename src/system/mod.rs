//! SLAM system orchestration and thread management.
//!
//! [`SlamSystem`] runs Tracking on the caller's thread and spawns the
//! LocalMapping and viewer threads. [`SharedState`] holds the map behind one
//! coarse lock together with the session epoch and worker flags.

pub mod collaborators;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use collaborators::Collaborators;
pub use messages::{FrameUpdate, NewKeyFrameMsg, ViewerEvent};
pub use shared_state::SharedState;
pub use slam_system::{RunSummary, SlamSystem};
