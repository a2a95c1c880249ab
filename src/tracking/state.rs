//! Tracking state machine.

use std::fmt;

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No map yet; frames go to the initializer.
    #[default]
    Uninitialized,
    /// Pose tracked against the map.
    Good,
    /// Tracking failed on the last frame; relocalization is attempted next.
    Lost,
}

impl TrackingState {
    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Good => "GOOD",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}
