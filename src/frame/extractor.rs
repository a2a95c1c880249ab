//! Feature extraction seam.

use crate::error::Result;
use crate::io::GrayImage;

use super::feature::ExtractedFeature;

/// Detects keypoints and computes descriptors for one image.
///
/// The returned order is the frame's feature order and never changes.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Result<Vec<ExtractedFeature>>;
}
