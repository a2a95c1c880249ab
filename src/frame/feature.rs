//! Features and binary descriptors.

use nalgebra::Vector2;

use crate::map::{FrameId, MapPointId};

/// 256-bit binary descriptor (ORB/BRIEF layout).
pub type Descriptor = [u8; 32];

/// Number of differing bits between two descriptors.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Raw output of a [`FeatureExtractor`](super::FeatureExtractor): distorted pixel position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFeature {
    pub keypoint: Vector2<f64>,
    pub descriptor: Descriptor,
    pub level: usize,
}

/// A keypoint of a frame, undistorted, with its optional landmark association.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Undistorted pixel coordinates.
    pub pixel: Vector2<f64>,
    /// Pyramid level the keypoint was detected at.
    pub level: usize,
    pub descriptor: Descriptor,
    /// Frame this feature belongs to (non-owning).
    pub frame: FrameId,
    /// At most one MapPoint at a time.
    pub map_point: Option<MapPointId>,
}

impl Feature {
    pub fn new(frame: FrameId, pixel: Vector2<f64>, level: usize, descriptor: Descriptor) -> Self {
        Self {
            pixel,
            level,
            descriptor,
            frame,
            map_point: None,
        }
    }
}
