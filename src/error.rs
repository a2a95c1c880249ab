//! Error type shared by the library.
//!
//! Expected control flow (a failed match, a rejected triangulation candidate,
//! a stale keyframe from a reset session) never goes through [`SlamError`];
//! those are plain `Option`/`bool` results. This type covers I/O, malformed
//! input and precondition violations at module boundaries.

use crate::map::{FrameId, KeyFrameId};

/// Errors returned by the SLAM library.
#[derive(Debug, thiserror::Error)]
pub enum SlamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A frame that was never promoted was handed to the keyframe path.
    #[error("frame {0} is not a keyframe")]
    NotAKeyframe(FrameId),

    #[error("keyframe {0} is already in the map")]
    DuplicateKeyFrame(KeyFrameId),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("image source error: {0}")]
    ImageSource(String),

    #[error("feature extraction failed: {0}")]
    Extraction(String),

    #[error("viewer error: {0}")]
    Viewer(String),

    #[error("local mapping worker is not running")]
    WorkerStopped,
}

pub type Result<T> = std::result::Result<T, SlamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SlamError::NotAKeyframe(FrameId::new(7));
        assert_eq!(err.to_string(), "frame F7 is not a keyframe");

        let err = SlamError::DuplicateKeyFrame(KeyFrameId::new(3));
        assert_eq!(err.to_string(), "keyframe KF3 is already in the map");
    }

    #[test]
    fn test_io_error_conversion() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.yaml")?)
        }
        assert!(matches!(open_missing(), Err(SlamError::Io(_))));
    }
}
